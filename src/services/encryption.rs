//! Payload encryption before upload and decryption at playback.
//!
//! Layout of an encrypted object:
//!
//! ```text
//! nonce (12 bytes) || ciphertext || auth tag (16 bytes)
//! ```
//!
//! Objects written by the older protocol are AES-256-CBC with PKCS#7 padding,
//! either as `iv (16 bytes) || ciphertext` or with the IV kept in the key
//! material. Those are only ever decrypted, never produced.

use crate::error::{Result, UploadError};
use crate::services::storage::ObjectFetcher;
use aes_gcm::Aes256Gcm;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::{Aead, KeyInit};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const LEGACY_IV_LEN: usize = 16;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
    /// Legacy, non-authenticated. Decrypt only.
    Aes256Cbc,
}

impl EncryptionAlgorithm {
    pub fn is_authenticated(self) -> bool {
        !matches!(self, EncryptionAlgorithm::Aes256Cbc)
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncryptionAlgorithm::Aes256Gcm => "aes-256-gcm",
            EncryptionAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            EncryptionAlgorithm::Aes256Cbc => "aes-256-cbc",
        };
        f.write_str(s)
    }
}

/// Per-file key material. Only ever leaves the process inside the
/// registration call; the key is wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionMaterial {
    key: [u8; KEY_LEN],
    iv: Vec<u8>,
    pub algorithm: EncryptionAlgorithm,
}

impl fmt::Debug for EncryptionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionMaterial")
            .field("key", &"[REDACTED]")
            .field("iv", &hex::encode(&self.iv))
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Drop for EncryptionMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl EncryptionMaterial {
    pub fn new(key: [u8; KEY_LEN], iv: Vec<u8>, algorithm: EncryptionAlgorithm) -> Self {
        Self { key, iv, algorithm }
    }

    pub fn from_hex(key_hex: &str, iv_hex: &str, algorithm: EncryptionAlgorithm) -> Result<Self> {
        let key_bytes = hex::decode(key_hex.trim())
            .map_err(|e| UploadError::Decryption(format!("invalid key encoding: {}", e)))?;
        if key_bytes.len() != KEY_LEN {
            return Err(UploadError::Decryption(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                key_bytes.len()
            )));
        }
        let iv = hex::decode(iv_hex.trim())
            .map_err(|e| UploadError::Decryption(format!("invalid IV encoding: {}", e)))?;

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&key_bytes);
        Ok(Self::new(key, iv, algorithm))
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(&self.iv)
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub ciphertext: Bytes,
    pub material: EncryptionMaterial,
}

/// Named decryption attempts, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionStrategy {
    /// Current layout with the declared AEAD cipher.
    AeadPrefixedNonce(EncryptionAlgorithm),
    /// Legacy CBC with the IV stored in front of the ciphertext.
    LegacyCbcPrefixedIv,
    /// Legacy CBC with the IV carried by the key material.
    LegacyCbcMaterialIv,
    /// Legacy CBC written with an all-zero IV.
    LegacyCbcZeroIv,
}

impl fmt::Display for DecryptionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptionStrategy::AeadPrefixedNonce(alg) => write!(f, "{}/prefixed-nonce", alg),
            DecryptionStrategy::LegacyCbcPrefixedIv => f.write_str("aes-256-cbc/prefixed-iv"),
            DecryptionStrategy::LegacyCbcMaterialIv => f.write_str("aes-256-cbc/material-iv"),
            DecryptionStrategy::LegacyCbcZeroIv => f.write_str("aes-256-cbc/zero-iv"),
        }
    }
}

impl DecryptionStrategy {
    /// The attempt order for a given material.
    pub fn ordered_for(material: &EncryptionMaterial) -> Vec<DecryptionStrategy> {
        let mut strategies = Vec::with_capacity(4);
        if material.algorithm.is_authenticated() {
            strategies.push(DecryptionStrategy::AeadPrefixedNonce(material.algorithm));
        }
        strategies.push(DecryptionStrategy::LegacyCbcPrefixedIv);
        strategies.push(DecryptionStrategy::LegacyCbcMaterialIv);
        strategies.push(DecryptionStrategy::LegacyCbcZeroIv);
        strategies
    }

    /// CBC cannot tell a wrong IV from a right one, so the legacy variants
    /// are kept mutually exclusive by looking at what the material carries.
    /// Material whose AEAD nonce prefixes the data is never handed to CBC:
    /// unauthenticated padding checks would accept some tampered payloads.
    fn applies(self, data: &[u8], material: &EncryptionMaterial) -> bool {
        let iv = material.iv();
        let iv_is_zero = iv.len() == LEGACY_IV_LEN && iv.iter().all(|b| *b == 0);
        let current_layout = material.algorithm.is_authenticated()
            && iv.len() == NONCE_LEN
            && data.starts_with(iv);
        match self {
            DecryptionStrategy::AeadPrefixedNonce(_) => data.len() >= NONCE_LEN + TAG_LEN,
            DecryptionStrategy::LegacyCbcPrefixedIv => {
                !current_layout
                    && data.len() >= 2 * LEGACY_IV_LEN
                    && (iv.len() != LEGACY_IV_LEN || data.starts_with(iv))
            }
            DecryptionStrategy::LegacyCbcMaterialIv => {
                iv.len() == LEGACY_IV_LEN && !iv_is_zero && !data.starts_with(iv)
            }
            DecryptionStrategy::LegacyCbcZeroIv => iv_is_zero && !data.starts_with(iv),
        }
    }

    fn attempt(self, data: &[u8], material: &EncryptionMaterial) -> std::result::Result<Vec<u8>, String> {
        match self {
            DecryptionStrategy::AeadPrefixedNonce(alg) => {
                let (nonce, body) = data.split_at(NONCE_LEN);
                aead_decrypt(alg, &material.key, nonce, body)
            }
            DecryptionStrategy::LegacyCbcPrefixedIv => {
                let (iv, body) = data.split_at(LEGACY_IV_LEN);
                cbc_decrypt(&material.key, iv, body)
            }
            DecryptionStrategy::LegacyCbcMaterialIv => cbc_decrypt(&material.key, material.iv(), data),
            DecryptionStrategy::LegacyCbcZeroIv => {
                cbc_decrypt(&material.key, &[0u8; LEGACY_IV_LEN], data)
            }
        }
    }
}

fn aead_decrypt(
    alg: EncryptionAlgorithm,
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    body: &[u8],
) -> std::result::Result<Vec<u8>, String> {
    match alg {
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| e.to_string())?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(nonce), body)
                .map_err(|_| "authentication failed".to_string())
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|e| e.to_string())?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), body)
                .map_err(|_| "authentication failed".to_string())
        }
        EncryptionAlgorithm::Aes256Cbc => Err("not an AEAD cipher".to_string()),
    }
}

fn cbc_decrypt(key: &[u8; KEY_LEN], iv: &[u8], body: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if body.is_empty() || body.len() % LEGACY_IV_LEN != 0 {
        return Err(format!("ciphertext length {} is not block aligned", body.len()));
    }
    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| e.to_string())?
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| "bad padding".to_string())
}

/// Plaintext recovered for playback, tagged with its sniffed container type.
#[derive(Debug, Clone)]
pub struct DecryptedAsset {
    pub data: Bytes,
    pub content_type: String,
    pub extension: Option<String>,
    pub strategy: DecryptionStrategy,
}

/// Sniffs the media container from magic bytes.
pub fn detect_content_type(data: &[u8]) -> Option<(&'static str, &'static str)> {
    infer::get(data).map(|k| (k.mime_type(), k.extension()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptionPipeline {
    algorithm: EncryptionAlgorithm,
}

impl EncryptionPipeline {
    pub fn new(algorithm: EncryptionAlgorithm) -> Result<Self> {
        if !algorithm.is_authenticated() {
            return Err(UploadError::Encryption(format!(
                "{} is only supported for decryption",
                algorithm
            )));
        }
        Ok(Self { algorithm })
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Encrypts a whole payload under a fresh key and nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let mut key = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| UploadError::Encryption(format!("failed to generate key: {}", e)))?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| UploadError::Encryption(format!("failed to generate nonce: {}", e)))?;

        let ciphertext = match self.algorithm {
            EncryptionAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(&key)
                .map_err(|e| UploadError::Encryption(e.to_string()))?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
            EncryptionAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key)
                .map_err(|e| UploadError::Encryption(e.to_string()))?
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext),
            EncryptionAlgorithm::Aes256Cbc => {
                return Err(UploadError::Encryption(
                    "legacy CBC is decrypt-only".to_string(),
                ));
            }
        }
        .map_err(|e| UploadError::Encryption(e.to_string()))?;

        // Combine Nonce + Ciphertext
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        let material = EncryptionMaterial::new(key, nonce.to_vec(), self.algorithm);
        key.zeroize();

        Ok(EncryptedPayload {
            ciphertext: Bytes::from(combined),
            material,
        })
    }

    /// Runs [`encrypt`](Self::encrypt) on the blocking pool so large payloads
    /// do not stall the runtime.
    pub async fn encrypt_in_background(&self, plaintext: Bytes) -> Result<EncryptedPayload> {
        let pipeline = *self;
        tokio::task::spawn_blocking(move || pipeline.encrypt(&plaintext))
            .await
            .map_err(|e| UploadError::Encryption(format!("encryption task failed: {}", e)))?
    }

    /// Tries each applicable strategy in order and tags the result with the
    /// detected container type, falling back to `declared_type`.
    pub fn decrypt(
        data: &[u8],
        material: &EncryptionMaterial,
        declared_type: Option<&str>,
    ) -> Result<DecryptedAsset> {
        let mut failures = Vec::new();

        for strategy in DecryptionStrategy::ordered_for(material) {
            if !strategy.applies(data, material) {
                tracing::debug!("Decryption strategy {} not applicable", strategy);
                continue;
            }

            match strategy.attempt(data, material) {
                Ok(plaintext) => {
                    if !matches!(strategy, DecryptionStrategy::AeadPrefixedNonce(_)) {
                        tracing::warn!("🔓 Decrypted legacy payload with {}", strategy);
                    } else {
                        tracing::debug!("🔓 Decrypted payload with {}", strategy);
                    }
                    let (content_type, extension) = match detect_content_type(&plaintext) {
                        Some((mime, ext)) => (mime.to_string(), Some(ext.to_string())),
                        None => (
                            declared_type.unwrap_or(FALLBACK_CONTENT_TYPE).to_string(),
                            None,
                        ),
                    };
                    return Ok(DecryptedAsset {
                        data: Bytes::from(plaintext),
                        content_type,
                        extension,
                        strategy,
                    });
                }
                Err(reason) => {
                    tracing::warn!("Decryption strategy {} failed: {}", strategy, reason);
                    failures.push(format!("{}: {}", strategy, reason));
                }
            }
        }

        if failures.is_empty() {
            failures.push(format!("no strategy applies to {} bytes", data.len()));
        }
        Err(UploadError::Decryption(failures.join("; ")))
    }

    /// Downloads and decrypts an object. Transport failures surface as
    /// [`UploadError::Remote`], cipher failures as [`UploadError::Decryption`].
    pub async fn fetch_and_decrypt(
        fetcher: &dyn ObjectFetcher,
        key: &str,
        material: &EncryptionMaterial,
        declared_type: Option<&str>,
    ) -> Result<DecryptedAsset> {
        let data = fetcher.fetch_object(key).await?;
        let material = material.clone();
        let declared_type = declared_type.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            Self::decrypt(&data, &material, declared_type.as_deref())
        })
        .await
        .map_err(|e| UploadError::Decryption(format!("decryption task failed: {}", e)))?
    }
}

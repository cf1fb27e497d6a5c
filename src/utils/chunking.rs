use crate::config::UploadConfig;
use crate::models::{ChunkRecord, ChunkStatus};

const MIB: u64 = 1024 * 1024;

/// Chooses the part size for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    pub chunk_size: u64,
    pub multipart_threshold: u64,
    pub max_parts: u32,
}

impl ChunkingPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            multipart_threshold: config.multipart_threshold,
            max_parts: config.max_parts.max(1),
        }
    }

    /// Single part up to the threshold; above it the nominal chunk size, grown
    /// a MiB at a time until the part count fits `max_parts`.
    pub fn chunk_size_for(&self, len: u64) -> u64 {
        if len <= self.multipart_threshold {
            return len.max(1);
        }
        let mut size = self.chunk_size;
        while len.div_ceil(size) > self.max_parts as u64 {
            size += MIB;
        }
        size
    }
}

/// Splits `[0, len)` into `ceil(len / chunk_size)` contiguous pending records.
/// The last range is `[start, len)` and is never empty.
pub fn split_ranges(len: u64, chunk_size: u64) -> Vec<ChunkRecord> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let count = len.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(len);
            ChunkRecord {
                index: i as u32,
                part_number: i as u32 + 1,
                start,
                end,
                status: ChunkStatus::Pending,
                attempts: 0,
                etag: None,
            }
        })
        .collect()
}

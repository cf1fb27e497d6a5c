use crate::services::registrar::HttpFinalizer;
use anyhow::Context;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builds the registration client from `FINALIZE_URL` and optional
/// `FINALIZE_TOKEN`.
pub fn setup_registrar() -> anyhow::Result<Arc<HttpFinalizer>> {
    let endpoint = env::var("FINALIZE_URL").context("FINALIZE_URL must be set")?;
    let token = env::var("FINALIZE_TOKEN").ok().filter(|t| !t.is_empty());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    info!(
        "📝 Registration endpoint: {} (auth: {})",
        endpoint,
        if token.is_some() { "bearer" } else { "none" }
    );
    Ok(Arc::new(HttpFinalizer::with_client(client, endpoint, token)))
}

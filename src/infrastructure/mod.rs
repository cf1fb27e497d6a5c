pub mod database;
pub mod logging;
pub mod registrar;
pub mod storage;

use crate::config::UploadConfig;
use crate::services::ledger::ChunkLedger;
use crate::services::ledger_store::SqliteLedgerStore;
use crate::services::scheduler::UploadScheduler;
use std::sync::Arc;

/// Wires the SQLite ledger, S3 client and HTTP registrar into a scheduler.
/// The scheduler is returned unstarted.
pub async fn setup_scheduler(config: UploadConfig) -> anyhow::Result<UploadScheduler> {
    let pool = database::setup_database(&config.database_url).await?;
    let ledger = Arc::new(ChunkLedger::new(
        Arc::new(SqliteLedgerStore::new(pool)),
        config.ledger_prefix.clone(),
    ));
    let client = storage::setup_storage().await?;
    let finalizer = registrar::setup_registrar()?;

    Ok(UploadScheduler::new(config, ledger, client, finalizer))
}

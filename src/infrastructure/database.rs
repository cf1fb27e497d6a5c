use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Opens (creating if needed) the ledger database and runs migrations.
pub async fn setup_database(database_url: &str) -> anyhow::Result<SqlitePool> {
    info!("📂 Ledger database: {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // An in-memory database is per-connection, so it must never be pooled wider than one.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    info!("✅ Ledger database connected");

    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    setup_database("sqlite::memory:").await
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    info!("🔄 Running ledger migrations...");

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS upload_ledger (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

//! SQLite-backed persistence bootstrap.
//!
//! One WAL-mode database file backs the order store, the offline queue, and
//! the network-status audit log (§5/§6's "Persistent layout"). A single pool
//! is shared by all three; there is no separate migrations crate, just the
//! `CREATE TABLE IF NOT EXISTS` statements run once at startup.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::BridgeResult;
use crate::network::NetworkStatus;
use crate::timestamp::UnixMillis;

pub async fn init_pool(database_url: &str) -> BridgeResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> BridgeResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            chat_id TEXT NOT NULL,
            status TEXT NOT NULL,
            quote_json TEXT NOT NULL,
            signature_json TEXT,
            tx_hash TEXT,
            settlement_id TEXT,
            error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            completed_at INTEGER
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_user_id ON orders (user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS queue (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            signed_tx_blob TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            last_retry INTEGER,
            next_retry INTEGER,
            created_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_next_retry ON queue (next_retry)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS network_status_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            old_status TEXT NOT NULL,
            new_status TEXT NOT NULL,
            at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Appends one row to the network-status audit log. Read-only from the
/// bridge's own perspective — it exists for after-the-fact diagnosis (§8).
pub async fn log_network_status_change(
    pool: &SqlitePool,
    old: NetworkStatus,
    new: NetworkStatus,
    at: UnixMillis,
) -> BridgeResult<()> {
    sqlx::query("INSERT INTO network_status_log (old_status, new_status, at) VALUES (?, ?, ?)")
        .bind(format!("{old:?}").to_uppercase())
        .bind(format!("{new:?}").to_uppercase())
        .bind(at.0)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_pool_is_idempotent_and_creates_all_tables() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap(); // safe to run twice

        let tables: Vec<String> = sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&pool)
            .await
            .unwrap();
        for expected in ["orders", "queue", "network_status_log"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn logs_a_network_status_transition() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        log_network_status_change(&pool, NetworkStatus::Offline, NetworkStatus::Online, UnixMillis::now())
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM network_status_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}

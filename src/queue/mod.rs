//! Persistent queue (C5).
//!
//! Durable, crash-safe storage for signed transactions awaiting broadcast.
//! Backed by WAL-mode SQLite so power loss between enqueue and broadcast
//! cannot lose a signed item (§4.5).

pub mod processor;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, query};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::order::OrderStore;
use crate::timestamp::UnixMillis;

#[derive(Debug, Clone, PartialEq)]
pub struct OfflineQueueItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub signed_tx_blob: String,
    pub retry_count: u32,
    pub last_retry: Option<UnixMillis>,
    pub next_retry: Option<UnixMillis>,
    pub created_at: UnixMillis,
}

impl OfflineQueueItem {
    pub fn new(order_id: Uuid, signed_tx_blob: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            signed_tx_blob,
            retry_count: 0,
            last_retry: None,
            next_retry: None,
            created_at: UnixMillis::now(),
        }
    }
}

/// `{pending, processing, failed, totalAmount, oldestItem?}` per §4.5/§6.
/// `failed` is sourced from the order store, not derived from the queue
/// table — see the grounding ledger for why.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineQueueStats {
    pub pending: i64,
    pub processing: i64,
    pub failed: i64,
    pub total_amount: Decimal,
    pub oldest_item: Option<UnixMillis>,
}

#[async_trait]
pub trait PersistentQueue: Send + Sync {
    async fn enqueue(&self, item: &OfflineQueueItem) -> BridgeResult<()>;
    async fn dequeue(&self, id: Uuid) -> BridgeResult<()>;
    async fn update_retry(&self, id: Uuid, retry_count: u32, next_retry: UnixMillis) -> BridgeResult<()>;
    /// Rows with `next_retry IS NULL OR next_retry <= now`, ordered by
    /// `created_at` ascending.
    async fn get_ready_items(&self, now: UnixMillis) -> BridgeResult<Vec<OfflineQueueItem>>;
    async fn get_all(&self) -> BridgeResult<Vec<OfflineQueueItem>>;
    async fn get_stats(&self, orders: &dyn OrderStore) -> BridgeResult<OfflineQueueStats>;
}

pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: SqliteRow) -> BridgeResult<OfflineQueueItem> {
        Ok(OfflineQueueItem {
            id: Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())
                .map_err(|e| BridgeError::Storage(e.to_string()))?,
            order_id: Uuid::parse_str(row.try_get::<String, _>("order_id")?.as_str())
                .map_err(|e| BridgeError::Storage(e.to_string()))?,
            signed_tx_blob: row.try_get("signed_tx_blob")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            last_retry: row.try_get::<Option<i64>, _>("last_retry")?.map(UnixMillis),
            next_retry: row.try_get::<Option<i64>, _>("next_retry")?.map(UnixMillis),
            created_at: UnixMillis(row.try_get("created_at")?),
        })
    }
}

#[async_trait]
impl PersistentQueue for SqliteQueue {
    async fn enqueue(&self, item: &OfflineQueueItem) -> BridgeResult<()> {
        query(
            "INSERT INTO queue (id, order_id, signed_tx_blob, retry_count, last_retry, next_retry, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(item.id.to_string())
        .bind(item.order_id.to_string())
        .bind(&item.signed_tx_blob)
        .bind(item.retry_count as i64)
        .bind(item.last_retry.map(|t| t.0))
        .bind(item.next_retry.map(|t| t.0))
        .bind(item.created_at.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self, id: Uuid) -> BridgeResult<()> {
        query("DELETE FROM queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_retry(&self, id: Uuid, retry_count: u32, next_retry: UnixMillis) -> BridgeResult<()> {
        query("UPDATE queue SET retry_count = ?, last_retry = ?, next_retry = ? WHERE id = ?")
            .bind(retry_count as i64)
            .bind(UnixMillis::now().0)
            .bind(next_retry.0)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_ready_items(&self, now: UnixMillis) -> BridgeResult<Vec<OfflineQueueItem>> {
        let rows = query(
            "SELECT * FROM queue WHERE next_retry IS NULL OR next_retry <= ? ORDER BY created_at ASC",
        )
        .bind(now.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::from_row).collect()
    }

    async fn get_all(&self) -> BridgeResult<Vec<OfflineQueueItem>> {
        let rows = query("SELECT * FROM queue ORDER BY created_at ASC").fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::from_row).collect()
    }

    async fn get_stats(&self, orders: &dyn OrderStore) -> BridgeResult<OfflineQueueStats> {
        let items = self.get_all().await?;
        let mut pending = 0i64;
        let mut processing = 0i64;
        let mut total_amount = Decimal::ZERO;
        let mut oldest_item: Option<UnixMillis> = None;

        for item in &items {
            if item.retry_count == 0 {
                pending += 1;
            } else {
                processing += 1;
            }
            if let Some(order) = orders.get(item.order_id).await? {
                total_amount += order.quote.amount_crypto;
            }
            oldest_item = Some(match oldest_item {
                Some(current) if current.0 <= item.created_at.0 => current,
                _ => item.created_at,
            });
        }

        let failed = orders.count_failed().await?;

        Ok(OfflineQueueStats {
            pending,
            processing,
            failed,
            total_amount,
            oldest_item,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_has_zero_retry_count_and_no_retry_schedule() {
        let item = OfflineQueueItem::new(Uuid::new_v4(), "blob".to_string());
        assert_eq!(item.retry_count, 0);
        assert!(item.last_retry.is_none());
        assert!(item.next_retry.is_none());
    }
}

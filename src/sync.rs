//! Sync coordinator (C8).
//!
//! `forceSync` lets an operator (or a chat command) ask for an immediate
//! drain outside the processor's own 10 s cadence, and reports its outcome as
//! a stream of events rather than a single return value — a sync can run for
//! minutes against a large backlog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use crate::error::{BridgeError, BridgeResult};
use crate::network::{NetworkDetector, NetworkStatus};
use crate::order::{OrderStore, PaymentStatus};
use crate::queue::PersistentQueue;
use crate::queue::processor::QueueProcessor;
use crate::timestamp::UnixMillis;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Started,
    Progress { total: usize, processed: usize, failed: usize },
    Completed { total: usize, processed: usize, failed: usize },
    Failed { total: usize, processed: usize, failed: usize, reason: String },
}

pub struct SyncCoordinator {
    queue: Arc<dyn PersistentQueue>,
    orders: Arc<dyn OrderStore>,
    processor: Arc<QueueProcessor>,
    network: Arc<NetworkDetector>,
    events: broadcast::Sender<SyncEvent>,
    syncing: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<dyn PersistentQueue>,
        orders: Arc<dyn OrderStore>,
        processor: Arc<QueueProcessor>,
        network: Arc<NetworkDetector>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            queue,
            orders,
            processor,
            network,
            events,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Refuses to start a second sync while one is already running, and
    /// refuses to start at all while the network is OFFLINE (§4.8).
    pub async fn force_sync(&self) -> BridgeResult<()> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadySyncing);
        }
        let result = self.run_sync().await;
        self.syncing.store(false, Ordering::SeqCst);
        result
    }

    async fn run_sync(&self) -> BridgeResult<()> {
        if self.network.status().await == NetworkStatus::Offline {
            return Err(BridgeError::NetworkOffline);
        }

        let before = self.queue.get_all().await?;
        let total = before.len();
        let _ = self.events.send(SyncEvent::Started);

        self.processor.process_queue().await;

        let after = self.queue.get_all().await?;
        let processed = total.saturating_sub(after.len());
        let failed = self.orders.count_failed().await? as usize;

        let _ = self.events.send(SyncEvent::Progress { total, processed, failed });

        if !after.is_empty() && self.network.status().await == NetworkStatus::Offline {
            let _ = self.events.send(SyncEvent::Failed {
                total,
                processed,
                failed,
                reason: "network went offline mid-sync".to_string(),
            });
        } else {
            let _ = self.events.send(SyncEvent::Completed { total, processed, failed });
        }
        Ok(())
    }

    /// Deletes COMPLETED orders whose `completedAt` is older than
    /// `older_than_days`. Returns the number removed.
    pub async fn cleanup_old_orders(&self, older_than_days: i64) -> BridgeResult<usize> {
        let cutoff = UnixMillis::now().plus_millis(-older_than_days * 24 * 60 * 60 * 1000);
        let completed = self.orders.list_by_status(PaymentStatus::Completed).await?;
        let mut removed = 0usize;
        for order in completed {
            if let Some(completed_at) = order.completed_at {
                if completed_at.0 < cutoff.0 {
                    self.orders.delete(order.id).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MockBlockchain, MockSettlement};
    use crate::network::{NetworkDetector, Probe};
    use crate::order::SqliteOrderStore;
    use crate::queue::SqliteQueue;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use url::Url;

    struct AlwaysDown;

    #[async_trait]
    impl Probe for AlwaysDown {
        async fn probe(&self, _endpoint: &Url) -> bool {
            false
        }
    }

    async fn in_memory_pool() -> sqlx::SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE orders (id TEXT PRIMARY KEY, user_id TEXT, chat_id TEXT, status TEXT, \
             quote_json TEXT, signature_json TEXT, tx_hash TEXT, settlement_id TEXT, error TEXT, \
             created_at INTEGER, updated_at INTEGER, completed_at INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE queue (id TEXT PRIMARY KEY, order_id TEXT, signed_tx_blob TEXT, \
             retry_count INTEGER, last_retry INTEGER, next_retry INTEGER, created_at INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn force_sync_refuses_while_offline() {
        let pool = in_memory_pool().await;
        let orders = Arc::new(SqliteOrderStore::new(pool.clone()));
        let queue = Arc::new(SqliteQueue::new(pool));
        let network = Arc::new(NetworkDetector::new(
            vec![Url::parse("https://a.example").unwrap()],
            Arc::new(AlwaysDown),
        ));
        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            orders.clone(),
            Arc::new(MockBlockchain::default()),
            Arc::new(MockSettlement::new()),
            network.clone(),
        ));
        let coordinator = SyncCoordinator::new(queue, orders, processor, network);

        let err = coordinator.force_sync().await.unwrap_err();
        assert!(matches!(err, BridgeError::NetworkOffline));
    }
}

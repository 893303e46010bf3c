//! Queue processor (C6).
//!
//! Drains ready queue items broadcast → confirm → settle → complete, with
//! exponential-backoff retry and a single-flight gate so overlapping ticks
//! never drain concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::capabilities::{Blockchain, Settlement};
use crate::error::BridgeResult;
use crate::network::{NetworkDetector, NetworkStatus};
use crate::order::{OrderStore, PaymentOrder, PaymentStatus, apply_transition};
use crate::queue::{OfflineQueueItem, PersistentQueue};
use crate::timestamp::UnixMillis;

const MAX_RETRIES: u32 = 5;
const CONFIRMATIONS: u32 = 3;
const CONFIRMATION_TIMEOUT_MS: u64 = 60_000;
const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// `min(5_000 * 2^(retryCount-1), 300_000)` ms, applied after incrementing
/// `retryCount`. Non-decreasing in `retryCount` up to the cap (§8).
pub fn backoff_delay_ms(retry_count: u32) -> u64 {
    let exponent = retry_count.saturating_sub(1);
    let delay = 5_000u64.saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
    delay.min(300_000)
}

pub struct QueueProcessor {
    queue: Arc<dyn PersistentQueue>,
    orders: Arc<dyn OrderStore>,
    blockchain: Arc<dyn Blockchain>,
    settlement: Arc<dyn Settlement>,
    network: Arc<NetworkDetector>,
    draining: AtomicBool,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<dyn PersistentQueue>,
        orders: Arc<dyn OrderStore>,
        blockchain: Arc<dyn Blockchain>,
        settlement: Arc<dyn Settlement>,
        network: Arc<NetworkDetector>,
    ) -> Self {
        Self {
            queue,
            orders,
            blockchain,
            settlement,
            network,
            draining: AtomicBool::new(false),
        }
    }

    /// Entry point for the ticker, enqueue hook, and network-up hook alike.
    /// A boolean gate prevents concurrent drains; a new invocation while one
    /// is active returns immediately (§4.6).
    pub async fn process_queue(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = self.drain().await;
        self.draining.store(false, Ordering::SeqCst);
        if let Err(error) = result {
            tracing::error!(%error, "queue drain aborted");
        }
    }

    #[instrument(skip(self))]
    async fn drain(&self) -> BridgeResult<()> {
        let now = UnixMillis::now();
        let items = self.queue.get_ready_items(now).await?;
        for item in items {
            if self.network.status().await == NetworkStatus::Offline {
                tracing::info!("network went offline mid-drain, stopping");
                break;
            }
            self.process_item(item).await?;
        }
        Ok(())
    }

    async fn process_item(&self, item: OfflineQueueItem) -> BridgeResult<()> {
        let Some(mut order) = self.orders.get(item.order_id).await? else {
            self.queue.dequeue(item.id).await?;
            return Ok(());
        };

        if order.status == PaymentStatus::Signed {
            apply_transition(&mut order, PaymentStatus::Pending)?;
            self.orders.update(&order).await?;
        }

        let tx_hash = match self.blockchain.broadcast_transaction(&item.signed_tx_blob).await {
            Ok(hash) => hash,
            Err(error) => {
                return self.retry_or_fail(&item, &mut order, format!("Broadcast failed: {error}")).await;
            }
        };
        order.tx_hash = Some(tx_hash.clone());
        self.orders.update(&order).await?;

        let confirmed = self
            .blockchain
            .wait_for_confirmation(&tx_hash, CONFIRMATIONS, CONFIRMATION_TIMEOUT_MS)
            .await
            .unwrap_or(false);
        if !confirmed {
            return self.retry_or_fail(&item, &mut order, "Transaction not confirmed".to_string()).await;
        }

        let settlement = match self.settlement.settle(&order).await {
            Ok(result) if result.success => result,
            Ok(result) => {
                let reason = result.error.unwrap_or_else(|| "settlement rejected".to_string());
                return self.retry_or_fail(&item, &mut order, format!("Settlement failed: {reason}")).await;
            }
            Err(error) => {
                return self.retry_or_fail(&item, &mut order, format!("Settlement failed: {error}")).await;
            }
        };

        apply_transition(&mut order, PaymentStatus::Settled)?;
        apply_transition(&mut order, PaymentStatus::Completed)?;
        order.settlement_id = settlement.settlement_id;
        order.error = None;
        self.orders.update(&order).await?;
        self.queue.dequeue(item.id).await?;
        Ok(())
    }

    async fn retry_or_fail(&self, item: &OfflineQueueItem, order: &mut PaymentOrder, reason: String) -> BridgeResult<()> {
        let next_retry_count = item.retry_count + 1;
        if next_retry_count >= MAX_RETRIES {
            order.error = Some(format!("Max retries exceeded: {reason}"));
            apply_transition(order, PaymentStatus::Failed)?;
            self.orders.update(order).await?;
            self.queue.dequeue(item.id).await?;
        } else {
            order.error = Some(reason);
            self.orders.update(order).await?;
            let delay_ms = backoff_delay_ms(next_retry_count);
            let next_retry = UnixMillis::now().plus_millis(delay_ms as i64);
            self.queue.update_retry(item.id, next_retry_count, next_retry).await?;
        }
        Ok(())
    }

    /// Spawns the 10 s ticker until `cancel` fires.
    pub fn spawn_ticker(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.process_queue().await;
                    }
                }
            }
        })
    }

    /// Called synchronously after an enqueue while the network is ONLINE.
    pub async fn on_enqueue(&self) {
        if self.network.status().await != NetworkStatus::Offline {
            self.process_queue().await;
        }
    }

    /// Called on every `* -> ONLINE` network transition.
    pub async fn on_network_online(&self) {
        self.process_queue().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_non_decreasing_up_to_cap() {
        let delays: Vec<u64> = (1..=8).map(backoff_delay_ms).collect();
        assert_eq!(delays[0], 5_000);
        assert_eq!(delays[1], 10_000);
        assert_eq!(delays[2], 20_000);
        assert_eq!(delays[3], 40_000);
        assert_eq!(delays[4], 80_000);
        assert_eq!(delays[5], 160_000);
        assert_eq!(delays[6], 300_000); // capped: 320_000 -> 300_000
        assert_eq!(delays[7], 300_000);
        for window in delays.windows(2) {
            assert!(window[1] >= window[0]);
        }
    }
}

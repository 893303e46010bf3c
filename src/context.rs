//! Application state (§9 Design Notes: "avoid hidden globals").
//!
//! Every tool orchestrator (C9) and HTTP handler takes a `Context` rather
//! than reaching for ambient statics, so tests can build a fully isolated
//! instance per case.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::capabilities::{Blockchain, Exchange, Settlement};
use crate::config::Config;
use crate::network::{NetworkDetector, NetworkStatus, Probe, TcpConnectProbe};
use crate::order::{OrderStore, SqliteOrderStore};
use crate::queue::processor::QueueProcessor;
use crate::queue::{PersistentQueue, SqliteQueue};
use crate::quote::{QuoteIndex, RateCache};
use crate::sync::SyncCoordinator;

pub struct Context {
    pub config: Config,
    pub pool: SqlitePool,
    pub orders: Arc<dyn OrderStore>,
    pub queue: Arc<dyn PersistentQueue>,
    pub rates: Arc<RateCache>,
    pub quotes: Arc<QuoteIndex>,
    pub blockchain: Arc<dyn Blockchain>,
    pub exchange: Arc<dyn Exchange>,
    pub settlement: Arc<dyn Settlement>,
    pub network: Arc<NetworkDetector>,
    pub processor: Arc<QueueProcessor>,
    pub sync: Arc<SyncCoordinator>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        pool: SqlitePool,
        blockchain: Arc<dyn Blockchain>,
        exchange: Arc<dyn Exchange>,
        settlement: Arc<dyn Settlement>,
        probe_endpoints: Vec<Url>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let orders: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::new(pool.clone()));
        let queue: Arc<dyn PersistentQueue> = Arc::new(SqliteQueue::new(pool.clone()));
        let network = Arc::new(NetworkDetector::new(probe_endpoints, probe));
        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            orders.clone(),
            blockchain.clone(),
            settlement.clone(),
            network.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(queue.clone(), orders.clone(), processor.clone(), network.clone()));

        Self {
            config,
            pool,
            orders,
            queue,
            rates: Arc::new(RateCache::new()),
            quotes: Arc::new(QuoteIndex::new()),
            blockchain,
            exchange,
            settlement,
            network,
            processor,
            sync,
        }
    }

    /// Builds a `Context` wired for real deployment: real `TcpConnectProbe`
    /// against the configured upstream URLs (falling back to the rate/settlement
    /// hosts when no explicit probe list is configured).
    pub async fn bootstrap(config: Config) -> crate::error::BridgeResult<Self> {
        let pool = crate::storage::init_pool(config.database_url()).await?;
        let blockchain: Arc<dyn Blockchain> = Arc::new(crate::capabilities::MockBlockchain::default());
        let settlement: Arc<dyn Settlement> = Arc::new(crate::capabilities::MockSettlement::new());
        let exchange: Arc<dyn Exchange> = Arc::new(crate::quote::MockRateSource);

        let mut endpoints = Vec::new();
        if let Some(url) = config.exchange_api_url() {
            endpoints.push(url.clone());
        }
        if let Some(url) = config.settlement_api_url() {
            endpoints.push(url.clone());
        }
        if endpoints.is_empty() {
            endpoints.push(Url::parse("https://www.google.com").expect("static URL parses"));
        }

        let ctx = Self::new(config, pool, blockchain, exchange, settlement, endpoints, Arc::new(TcpConnectProbe));
        ctx.recover_active_orders().await?;
        Ok(ctx)
    }

    /// Startup recovery scan (§9: durable storage is authoritative, in-memory
    /// state is a derived view rebuilt on start). This bridge keeps no
    /// separate in-memory order index to rebuild — every read goes straight
    /// to `orders` — so recovery here means confirming what's still
    /// in-flight and logging it, the way the queue processor's own ticker
    /// will pick each one back up on its next tick.
    async fn recover_active_orders(&self) -> crate::error::BridgeResult<()> {
        let active = self.orders.list_active().await?;
        if !active.is_empty() {
            tracing::info!(count = active.len(), "recovered active orders from durable storage on startup");
        }
        Ok(())
    }

    /// Spawns the background loops (queue ticker, network prober, audit
    /// logger) and returns a handle that cancels them on drop via `cancel`.
    pub fn spawn_background_tasks(self: &Arc<Self>, cancel: CancellationToken) {
        self.processor.clone().spawn_ticker(cancel.clone());
        self.network.clone().run(cancel.clone());
        spawn_network_audit_logger(self.network.clone(), self.pool.clone(), cancel.clone());
        spawn_network_drain_trigger(self.network.clone(), self.processor.clone(), cancel);
    }

    pub async fn network_status(&self) -> NetworkStatus {
        self.network.status().await
    }
}

/// Drains the queue on every `* -> ONLINE` transition (§4.6: "also
/// synchronously on ... network-status transition into ONLINE").
fn spawn_network_drain_trigger(network: Arc<NetworkDetector>, processor: Arc<QueueProcessor>, cancel: CancellationToken) {
    let mut subscription = network.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.receiver.recv() => {
                    match event {
                        Ok((_old, NetworkStatus::Online)) => processor.on_network_online().await,
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}

fn spawn_network_audit_logger(network: Arc<NetworkDetector>, pool: SqlitePool, cancel: CancellationToken) {
    let mut subscription = network.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.receiver.recv() => {
                    match event {
                        Ok((old, new)) => {
                            if let Err(error) = crate::storage::log_network_status_change(&pool, old, new, crate::timestamp::UnixMillis::now()).await {
                                tracing::warn!(%error, "failed to persist network status transition");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MockBlockchain, MockSettlement};
    use crate::network::Probe;
    use crate::order::{apply_transition, PaymentOrder, PaymentStatus};
    use crate::quote::RateSource;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use sqlx::sqlite::SqlitePoolOptions;

    struct AlwaysUp;

    #[async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self, _endpoint: &Url) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn recover_active_orders_finds_in_flight_work_via_list_active() {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::storage::run_migrations(&pool).await.unwrap();
        let ctx = Context::new(
            Config::default(),
            pool,
            Arc::new(MockBlockchain::default()),
            Arc::new(crate::quote::MockRateSource),
            Arc::new(MockSettlement::new()),
            vec![Url::parse("https://a.example").unwrap()],
            Arc::new(AlwaysUp),
        );

        let prompt_pay = crate::qr::parse(&crate::qr::generate("0812345678", None).unwrap()).unwrap();
        let rate = crate::quote::MockRateSource.get_rate(crate::types::Token::Usdt).await.unwrap();
        let quote = crate::quote::create_quote(dec!(150), crate::types::Token::Usdt, prompt_pay, rate, dec!(10000)).unwrap();
        let mut order = PaymentOrder::new("user-1".to_string(), "chat-1".to_string(), quote);
        ctx.orders.insert(&order).await.unwrap();
        apply_transition(&mut order, PaymentStatus::Quoted).unwrap();
        ctx.orders.update(&order).await.unwrap();

        let active = ctx.orders.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, PaymentStatus::Quoted);

        ctx.recover_active_orders().await.unwrap();
    }
}

//! Network-quality detector (C7).
//!
//! Probes a fixed set of endpoints on a 10 s interval with a 5 s per-probe
//! timeout, aggregates the results into a three-level status, and notifies
//! subscribers on every change. Independent of the queue; C6 merely listens
//! to it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const WEAK_LATENCY_THRESHOLD_MS: u128 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkStatus {
    Online,
    Weak,
    Offline,
}

/// A single endpoint probe. Kept as a trait so tests can substitute a
/// deterministic fake instead of performing real I/O.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Url) -> bool;
}

/// Probes by attempting a TCP connect to the endpoint's host:port within the
/// per-probe timeout. Does not perform any request/response round trip —
/// reachability is the only signal this crate needs.
pub struct TcpConnectProbe;

#[async_trait::async_trait]
impl Probe for TcpConnectProbe {
    async fn probe(&self, endpoint: &Url) -> bool {
        let host = match endpoint.host_str() {
            Some(h) => h,
            None => return false,
        };
        let port = endpoint.port_or_known_default().unwrap_or(443);
        tokio::net::TcpStream::connect((host, port)).await.is_ok()
    }
}

/// Multi-endpoint probe aggregator. `start` spawns the probing loop;
/// dropping the returned handle does not stop it — cancel the shared token
/// instead (mirrors the lifecycle-managed singleton called for in §9).
pub struct NetworkDetector {
    endpoints: Vec<Url>,
    probe: Arc<dyn Probe>,
    status: Arc<RwLock<NetworkStatus>>,
    events: broadcast::Sender<(NetworkStatus, NetworkStatus)>,
}

pub struct Subscription {
    pub receiver: broadcast::Receiver<(NetworkStatus, NetworkStatus)>,
}

impl NetworkDetector {
    pub fn new(endpoints: Vec<Url>, probe: Arc<dyn Probe>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            endpoints,
            probe,
            status: Arc::new(RwLock::new(NetworkStatus::Offline)),
            events,
        }
    }

    pub async fn status(&self) -> NetworkStatus {
        *self.status.read().await
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.events.subscribe(),
        }
    }

    /// Runs one probe round against every configured endpoint and updates the
    /// aggregate status, notifying subscribers on change. Exposed separately
    /// from [`Self::run`] so tests can drive single rounds deterministically.
    #[instrument(skip(self))]
    pub async fn probe_once(&self) -> NetworkStatus {
        let mut success_count = 0usize;
        let mut total_latency = Duration::ZERO;

        for endpoint in &self.endpoints {
            let started = tokio::time::Instant::now();
            let probe = self.probe.clone();
            let endpoint = endpoint.clone();
            let result = timeout(PROBE_TIMEOUT, async move { probe.probe(&endpoint).await }).await;
            if matches!(result, Ok(true)) {
                success_count += 1;
                total_latency += started.elapsed();
            }
        }

        let new_status = aggregate(success_count, self.endpoints.len(), total_latency);
        let old_status = {
            let mut guard = self.status.write().await;
            let old = *guard;
            *guard = new_status;
            old
        };
        if old_status != new_status {
            tracing::info!(?old_status, ?new_status, "network status changed");
            let _ = self.events.send((old_status, new_status));
        }
        new_status
    }

    /// Spawns the periodic probing loop until `cancel` fires.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                }
            }
        })
    }
}

fn aggregate(success_count: usize, endpoint_count: usize, total_latency: Duration) -> NetworkStatus {
    if success_count == 0 {
        return NetworkStatus::Offline;
    }
    let avg_latency_ms = total_latency.as_millis() / success_count as u128;
    let majority = success_count * 2 >= endpoint_count;
    if !majority || avg_latency_ms > WEAK_LATENCY_THRESHOLD_MS {
        NetworkStatus::Weak
    } else {
        NetworkStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_successes_is_offline() {
        assert_eq!(aggregate(0, 3, Duration::ZERO), NetworkStatus::Offline);
    }

    #[test]
    fn minority_successes_is_weak() {
        assert_eq!(aggregate(1, 3, Duration::from_millis(10)), NetworkStatus::Weak);
    }

    #[test]
    fn majority_with_high_latency_is_weak() {
        assert_eq!(aggregate(3, 3, Duration::from_millis(9000)), NetworkStatus::Weak);
    }

    #[test]
    fn majority_with_low_latency_is_online() {
        assert_eq!(aggregate(3, 3, Duration::from_millis(300)), NetworkStatus::Online);
    }

    struct AlwaysUp;

    #[async_trait::async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self, _endpoint: &Url) -> bool {
            true
        }
    }

    struct AlwaysDown;

    #[async_trait::async_trait]
    impl Probe for AlwaysDown {
        async fn probe(&self, _endpoint: &Url) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn probe_once_transitions_and_notifies_subscribers() {
        let endpoints = vec![Url::parse("https://a.example").unwrap(), Url::parse("https://b.example").unwrap()];
        let detector = NetworkDetector::new(endpoints, Arc::new(AlwaysUp));
        let mut subscription = detector.subscribe();

        assert_eq!(detector.status().await, NetworkStatus::Offline);
        let new_status = detector.probe_once().await;
        assert_eq!(new_status, NetworkStatus::Online);

        let (old, new) = subscription.receiver.recv().await.unwrap();
        assert_eq!(old, NetworkStatus::Offline);
        assert_eq!(new, NetworkStatus::Online);
    }

    #[tokio::test]
    async fn repeated_same_status_does_not_emit_duplicate_event() {
        let endpoints = vec![Url::parse("https://a.example").unwrap()];
        let detector = NetworkDetector::new(endpoints, Arc::new(AlwaysDown));
        detector.probe_once().await;
        let mut subscription = detector.subscribe();
        detector.probe_once().await;
        assert!(subscription.receiver.try_recv().is_err());
    }
}

//! The Warden - Overlay Reconciler
//!
//! Re-runs `ensure` for every stored network on a fixed interval:
//! - Failed networks are retried with exponential backoff
//! - A per-network circuit breaker stops retries for a cooldown period
//! - A successful pass forgets the network's failure history

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use breaker_machines::{CircuitBreaker, CircuitBuilder};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::manifest::ReconcileConfig;
use crate::network::driver::Driver;
use crate::network::repository::NetworkRepository;
use crate::network::types::Network;

/// How long an open breaker keeps a network out of reconciliation
const BREAKER_COOLDOWN_SECS: f64 = 300.0;

/// Events the Warden receives
#[derive(Debug)]
pub enum WardenEvent {
    /// Reconcile one network now, ignoring its backoff schedule
    Reconcile { network_id: String },
    /// Shutdown the Warden
    Shutdown,
}

/// Result of one reconciliation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converged,
    Failed,
    /// Backoff or breaker kept the network from being attempted
    Deferred,
}

/// Retry state tracking for a single network
struct RetryState {
    /// Consecutive failed attempts
    attempts: u8,
    backoff: ExponentialBackoff,
    breaker: CircuitBreaker,
    /// Earliest time of the next attempt
    next_attempt: Instant,
}

impl RetryState {
    fn new(network_id: &str, config: &ReconcileConfig, now: Instant) -> Self {
        Self {
            attempts: 0,
            backoff: ExponentialBackoff::new()
                .base_delay_ms(config.base_delay_ms)
                .max_delay_ms(config.max_delay_ms)
                .multiplier(2.0)
                .max_attempts(config.max_attempts)
                .jitter_factor(0.5),
            breaker: CircuitBuilder::new(format!("reconcile_{}", network_id))
                .failure_threshold(config.failure_threshold)
                .success_threshold(2)
                .half_open_timeout_secs(BREAKER_COOLDOWN_SECS)
                .build(),
            next_attempt: now,
        }
    }

    fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.breaker.record_failure(0.0);
    }

    fn next_delay(&self) -> Option<Duration> {
        let mut rng = rng();
        self.backoff
            .delay(self.attempts, &mut rng)
            .map(Duration::from_millis)
    }

    fn should_retry(&self) -> bool {
        self.breaker.is_closed() && self.backoff.should_retry(self.attempts)
    }

    /// Schedule the next attempt; `None` means the network is parked
    fn schedule(&mut self, now: Instant) -> Option<Duration> {
        let delay = if self.should_retry() {
            self.next_delay()
        } else {
            None
        };
        self.next_attempt =
            now + delay.unwrap_or(Duration::from_secs_f64(BREAKER_COOLDOWN_SECS));
        delay
    }

    /// Parked networks get a fresh history once their cooldown is over
    fn cooled_down(&self, now: Instant) -> bool {
        !self.should_retry() && now >= self.next_attempt
    }
}

/// The Warden keeps every stored network converged
pub struct Warden<D: Driver> {
    /// Channel to receive events
    rx: mpsc::Receiver<WardenEvent>,
    /// Sender for notifying the Warden (cloneable)
    tx: mpsc::Sender<WardenEvent>,
    /// Retry state per failing network
    states: HashMap<String, RetryState>,
    networks: Arc<NetworkRepository<D>>,
    config: ReconcileConfig,
}

impl<D: Driver> Warden<D> {
    pub fn new(networks: Arc<NetworkRepository<D>>, config: ReconcileConfig) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            rx,
            tx,
            states: HashMap::new(),
            networks,
            config,
        }
    }

    /// Get a sender to notify the Warden of events
    pub fn sender(&self) -> mpsc::Sender<WardenEvent> {
        self.tx.clone()
    }

    /// Run the reconcile loop until shutdown
    ///
    /// This should be spawned as a tokio task
    pub async fn run(&mut self) {
        info!(interval_secs = self.config.interval_secs, "warden started");

        let period = Duration::from_secs(self.config.interval_secs);
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => self.reconcile_all(Instant::now()).await,
                event = self.rx.recv() => match event {
                    Some(WardenEvent::Reconcile { network_id }) => {
                        self.reconcile_now(&network_id).await;
                    }
                    Some(WardenEvent::Shutdown) | None => break,
                },
            }
        }

        info!("warden stopped");
    }

    /// One pass over every stored network
    pub async fn reconcile_all(&mut self, now: Instant) {
        let networks = match self.networks.list().await {
            Ok(networks) => networks,
            Err(e) => {
                warn!(error = %e, "failed to list networks");
                return;
            }
        };

        // Deleted networks take their history with them
        self.states
            .retain(|id, _| networks.iter().any(|n| &n.id == id));

        for network in &networks {
            self.reconcile(network, now).await;
        }
    }

    async fn reconcile_now(&mut self, network_id: &str) {
        match self.networks.exists(network_id).await {
            Ok(Some(network)) => {
                let now = Instant::now();
                if let Some(state) = self.states.get_mut(network_id) {
                    state.next_attempt = now;
                }
                self.reconcile(&network, now).await;
            }
            Ok(None) => {
                self.states.remove(network_id);
                debug!(network_id, "reconcile requested for unknown network");
            }
            Err(e) => warn!(network_id, error = %e, "failed to load network"),
        }
    }

    /// Reconcile one network, honouring its backoff and breaker
    pub async fn reconcile(&mut self, network: &Network, now: Instant) -> Outcome {
        let schedule = self
            .states
            .get(&network.id)
            .map(|s| (s.cooled_down(now), now < s.next_attempt, s.attempts));
        match schedule {
            Some((true, _, _)) => {
                info!(network_id = %network.id, "cooldown over, retrying");
                self.states.remove(&network.id);
            }
            Some((false, true, attempts)) => {
                debug!(network_id = %network.id, attempts, "deferred");
                return Outcome::Deferred;
            }
            _ => {}
        }

        match self.networks.ensure(network).await {
            Ok(_) => {
                if let Some(state) = self.states.remove(&network.id) {
                    info!(
                        network_id = %network.id,
                        attempts = state.attempts,
                        "network recovered"
                    );
                }
                Outcome::Converged
            }
            Err(e) => {
                self.record_failure(network, &e, now);
                Outcome::Failed
            }
        }
    }

    fn record_failure(&mut self, network: &Network, err: &Error, now: Instant) {
        let config = &self.config;
        let state = self
            .states
            .entry(network.id.clone())
            .or_insert_with(|| RetryState::new(&network.id, config, now));
        state.record_failure();

        match state.schedule(now) {
            Some(delay) => warn!(
                network_id = %network.id,
                attempt = state.attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "reconcile failed"
            ),
            None => error!(
                network_id = %network.id,
                attempts = state.attempts,
                cooldown_secs = BREAKER_COOLDOWN_SECS,
                error = %err,
                "reconcile keeps failing, parking network"
            ),
        }
    }

    /// Number of networks currently carrying failure history
    pub fn failing(&self) -> usize {
        self.states.len()
    }
}

/// Handle for interacting with the Warden from other tasks
#[derive(Clone)]
pub struct WardenHandle {
    sender: mpsc::Sender<WardenEvent>,
}

impl WardenHandle {
    /// Create a handle from a Warden
    pub fn new<D: Driver>(warden: &Warden<D>) -> Self {
        Self {
            sender: warden.sender(),
        }
    }

    /// Ask for an immediate reconcile of one network
    pub async fn reconcile(&self, network_id: &str) -> Result<()> {
        self.sender
            .send(WardenEvent::Reconcile {
                network_id: network_id.to_string(),
            })
            .await
            .map_err(|_| Error::Io(std::io::Error::other("Warden channel closed")))
    }

    /// Request the Warden to shutdown
    pub async fn shutdown(&self) {
        let _ = self.sender.send(WardenEvent::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::NameGenerator;
    use crate::network::fake::FakeDriver;
    use crate::network::overlay::VXLAN_NAME;
    use crate::network::repository::NetworkCreate;
    use crate::store::MemoryStore;
    use std::path::Path;

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            interval_secs: 30,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            max_attempts: 10,
            failure_threshold: 3,
        }
    }

    async fn setup() -> (Warden<FakeDriver>, Arc<FakeDriver>, Network) {
        let driver = Arc::new(FakeDriver::new());
        let networks = Arc::new(NetworkRepository::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&driver),
            Arc::new(NameGenerator::seeded(3)),
            "10.0.0.0/24",
        ));
        let network = networks
            .create(NetworkCreate {
                name: "blue".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (Warden::new(networks, config()), driver, network)
    }

    #[test]
    fn test_retry_state_backoff() {
        let now = Instant::now();
        let mut state = RetryState::new("n1", &config(), now);
        assert!(state.should_retry());

        state.record_failure();
        let delay = state.schedule(now).unwrap();
        assert!(delay <= Duration::from_millis(8000));
        assert_eq!(state.next_attempt, now + delay);
    }

    #[test]
    fn test_breaker_parks_network() {
        let now = Instant::now();
        let mut state = RetryState::new("n1", &config(), now);
        for _ in 0..3 {
            state.record_failure();
        }
        assert!(!state.should_retry());
        assert!(state.schedule(now).is_none());
        assert!(!state.cooled_down(now));
        assert!(state.cooled_down(now + Duration::from_secs_f64(BREAKER_COOLDOWN_SECS)));
    }

    #[tokio::test]
    async fn test_reconcile_restores_deleted_vxlan() {
        let (mut warden, driver, network) = setup().await;
        let ns = driver.get(Path::new(&network.ns_handle_path)).unwrap();
        ns.remove_link(VXLAN_NAME);

        let outcome = warden.reconcile(&network, Instant::now()).await;
        assert_eq!(outcome, Outcome::Converged);
        assert!(ns.link(VXLAN_NAME).is_some());
        assert_eq!(warden.failing(), 0);
    }

    #[tokio::test]
    async fn test_failure_backs_off_then_recovers() {
        let (mut warden, driver, network) = setup().await;
        let now = Instant::now();

        driver.host.fail_next("links");
        assert_eq!(warden.reconcile(&network, now).await, Outcome::Failed);
        assert_eq!(warden.failing(), 1);

        // Still inside the backoff window
        assert_eq!(warden.reconcile(&network, now).await, Outcome::Deferred);

        let later = now + Duration::from_millis(8000);
        assert_eq!(warden.reconcile(&network, later).await, Outcome::Converged);
        assert_eq!(warden.failing(), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_waits_for_cooldown() {
        let (mut warden, driver, network) = setup().await;
        let mut now = Instant::now();

        for _ in 0..3 {
            driver.host.fail_next("links");
            assert_eq!(warden.reconcile(&network, now).await, Outcome::Failed);
            now += Duration::from_millis(8000);
        }

        // Parked: even a long backoff does not bring it back early
        assert_eq!(warden.reconcile(&network, now).await, Outcome::Deferred);

        now += Duration::from_secs_f64(BREAKER_COOLDOWN_SECS);
        assert_eq!(warden.reconcile(&network, now).await, Outcome::Converged);
        assert_eq!(warden.failing(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_all_forgets_deleted_networks() {
        let (mut warden, driver, network) = setup().await;
        let now = Instant::now();

        driver.host.fail_next("links");
        warden.reconcile_all(now).await;
        assert_eq!(warden.failing(), 1);

        warden.networks.delete(&network.id).await.unwrap();
        warden.reconcile_all(now).await;
        assert_eq!(warden.failing(), 0);
    }

    #[tokio::test]
    async fn test_run_handles_events_until_shutdown() {
        let (mut warden, driver, network) = setup().await;
        let handle = WardenHandle::new(&warden);
        let ns = driver.get(Path::new(&network.ns_handle_path)).unwrap();
        ns.remove_link(VXLAN_NAME);

        let task = tokio::spawn(async move {
            warden.run().await;
            warden
        });
        handle.reconcile(&network.id).await.unwrap();
        handle.reconcile("unknown").await.unwrap();
        handle.shutdown().await;

        let warden = task.await.unwrap();
        assert_eq!(warden.failing(), 0);
        assert!(ns.link(VXLAN_NAME).is_some());
    }
}

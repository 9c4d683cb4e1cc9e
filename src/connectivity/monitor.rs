use super::{ConnectivityState, PlatformSignal, Reachability};
use crate::config::ConnectivityConfig;
use crate::sync::events::{EventBus, SyncEvent};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct ProbeTracker {
    consecutive_failures: u32,
    /// The current online period has been confirmed at least once
    confirmed: bool,
}

/// Tracks connectivity with hysteresis.
///
/// - A probe success always yields verified online.
/// - A platform offline signal yields offline at once and asks for a
///   confirming probe; a successful probe flips it back.
/// - A verified online state survives `offline_after_failures - 1` failed
///   probes (demoted to unverified); an unconfirmed one goes offline on the
///   first failure.
/// - Without a probe, platform signals are trusted as verified.
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
    tracker: Mutex<ProbeTracker>,
    offline_after_failures: u32,
    probe_timeout: Duration,
    has_probe: bool,
    probe_requested: Notify,
    events: EventBus,
}

impl ConnectivityMonitor {
    pub fn new(config: &ConnectivityConfig, has_probe: bool, events: EventBus) -> Self {
        let (tx, _) = watch::channel(ConnectivityState::assumed_online());
        Self {
            tx,
            tracker: Mutex::new(ProbeTracker::default()),
            offline_after_failures: config.offline_after_failures.max(1),
            probe_timeout: config.probe_timeout(),
            has_probe,
            probe_requested: Notify::new(),
            events,
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    pub fn report(&self, signal: PlatformSignal) {
        debug!("Platform connectivity signal: {:?}", signal);
        match signal {
            PlatformSignal::Offline => {
                {
                    let mut tracker = self.tracker.lock();
                    tracker.confirmed = false;
                    tracker.consecutive_failures = 0;
                    self.transition(false, false);
                }
                if self.has_probe {
                    self.probe_requested.notify_one();
                }
            }
            PlatformSignal::Online => {
                if self.has_probe {
                    // Online is only emitted once a probe succeeds
                    self.probe_requested.notify_one();
                } else {
                    let mut tracker = self.tracker.lock();
                    tracker.confirmed = true;
                    tracker.consecutive_failures = 0;
                    self.transition(true, true);
                }
            }
        }
    }

    /// Fold one probe outcome into the state.
    pub fn record_probe(&self, reachable: bool) -> ConnectivityState {
        let mut tracker = self.tracker.lock();
        if reachable {
            tracker.consecutive_failures = 0;
            tracker.confirmed = true;
            self.transition(true, true);
        } else {
            tracker.consecutive_failures += 1;
            let current = self.current();
            if current.is_online {
                if tracker.confirmed
                    && tracker.consecutive_failures < self.offline_after_failures
                {
                    self.transition(true, false);
                } else {
                    tracker.confirmed = false;
                    self.transition(false, false);
                }
            }
        }
        self.current()
    }

    /// Run a single probe, bounded by the configured timeout.
    pub async fn check(&self, probe: &dyn Reachability) -> ConnectivityState {
        let reachable = tokio::time::timeout(self.probe_timeout, probe.probe())
            .await
            .unwrap_or(false);
        self.record_probe(reachable)
    }

    /// Probe immediately, then every `interval` or whenever a platform
    /// signal asks for confirmation, until `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        probe: Arc<dyn Reachability>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Connectivity monitor started (probe every {:?})", interval);
        loop {
            self.check(probe.as_ref()).await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.probe_requested.notified() => {
                    debug!("Confirming probe requested");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Connectivity monitor stopped");
    }

    fn transition(&self, is_online: bool, verified: bool) {
        let now = Utc::now();
        let changed = self.tx.send_if_modified(|state| {
            let next = ConnectivityState {
                is_online,
                verified,
                since: now.max(state.since),
            };
            if state.same_as(&next) {
                return false;
            }
            *state = next;
            true
        });

        if changed {
            let state = self.current();
            if is_online {
                info!(
                    "Connectivity: online ({})",
                    if verified { "verified" } else { "unverified" }
                );
            } else {
                warn!("Connectivity: offline");
            }
            self.events.emit(SyncEvent::Connectivity(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn monitor(has_probe: bool) -> (ConnectivityMonitor, EventBus) {
        let bus = EventBus::new(64);
        let config = ConnectivityConfig::default();
        (ConnectivityMonitor::new(&config, has_probe, bus.clone()), bus)
    }

    #[test]
    fn test_starts_online_unverified() {
        let (monitor, _) = monitor(true);
        let state = monitor.current();
        assert!(state.is_online);
        assert!(!state.verified);
    }

    #[test]
    fn test_unconfirmed_online_drops_on_first_failure() {
        let (monitor, _) = monitor(true);
        let state = monitor.record_probe(false);
        assert!(!state.is_online);
    }

    #[test]
    fn test_verified_online_needs_consecutive_failures() {
        let (monitor, _) = monitor(true);
        assert!(monitor.record_probe(true).is_verified_online());

        let state = monitor.record_probe(false);
        assert!(state.is_online);
        assert!(!state.verified);

        let state = monitor.record_probe(false);
        assert!(!state.is_online);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (monitor, _) = monitor(true);
        monitor.record_probe(true);
        monitor.record_probe(false);
        monitor.record_probe(true);
        let state = monitor.record_probe(false);
        assert!(state.is_online);
    }

    #[test]
    fn test_platform_offline_is_immediate() {
        let (monitor, _) = monitor(true);
        monitor.record_probe(true);
        monitor.report(PlatformSignal::Offline);
        assert!(!monitor.current().is_online);

        // Online from the platform waits for a probe
        monitor.report(PlatformSignal::Online);
        assert!(!monitor.current().is_online);
        assert!(monitor.record_probe(true).is_verified_online());
    }

    #[test]
    fn test_signals_trusted_without_probe() {
        let (monitor, _) = monitor(false);
        monitor.report(PlatformSignal::Offline);
        assert!(!monitor.current().is_online);
        monitor.report(PlatformSignal::Online);
        assert!(monitor.current().is_verified_online());
    }

    #[test]
    fn test_repeated_state_keeps_since() {
        let (monitor, _) = monitor(false);
        monitor.report(PlatformSignal::Offline);
        let first = monitor.current();

        monitor.report(PlatformSignal::Offline);
        let second = monitor.current();
        assert!(second.same_as(&first));
        assert_eq!(second.since, first.since);
    }

    #[test]
    fn test_duplicate_states_not_emitted() {
        let (monitor, bus) = monitor(false);
        let mut rx = bus.subscribe();

        monitor.report(PlatformSignal::Offline);
        monitor.report(PlatformSignal::Offline);
        monitor.report(PlatformSignal::Online);
        monitor.report(PlatformSignal::Online);

        let mut transitions = vec![];
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Connectivity(state) = event {
                transitions.push(state.is_online);
            }
        }
        assert_eq!(transitions, vec![false, true]);
    }

    #[test]
    fn test_since_is_monotonic() {
        let (monitor, _) = monitor(false);
        let first = monitor.current().since;
        monitor.report(PlatformSignal::Offline);
        let second = monitor.current().since;
        monitor.report(PlatformSignal::Online);
        let third = monitor.current().since;
        assert!(first <= second && second <= third);
    }

    struct Unreachable;

    #[async_trait]
    impl Reachability for Unreachable {
        async fn probe(&self) -> bool {
            false
        }
    }

    struct Hanging;

    #[async_trait]
    impl Reachability for Hanging {
        async fn probe(&self) -> bool {
            tokio::time::sleep(Duration::from_secs(60)).await;
            true
        }
    }

    #[tokio::test]
    async fn test_check_uses_probe() {
        let (monitor, _) = monitor(true);
        let state = monitor.check(&Unreachable).await;
        assert!(!state.is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_times_out() {
        let (monitor, _) = monitor(true);
        let state = monitor.check(&Hanging).await;
        assert!(!state.is_online);
    }
}

// ABOUTME: Background task that serializes reconciliation passes
//
// The driver owns the `Reconciler` inside one tokio task, so passes never run
// concurrently. Triggers are coalesced: any number of rescan requests or timer
// ticks collapse into one pending scan, while user intents queue in order and
// are all handed to the next pass. Scans run on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Intent, Reconciler, ReconcilerEvent};
use crate::config::AppConfig;
use crate::observer::{ObservationError, ObservationResult, PortSnapshot, PortSource};
use crate::registry::ProxyRegistry;
use crate::supervisor::ClientProcess;

/// The reconciler task has exited
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Reconciler has stopped")]
pub struct ReconcilerStopped;

/// Timing for the driver loop
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Time between scans when scans succeed
    pub scan_interval: Duration,
    /// Cap on the scan interval multiplier after repeated scan failures
    pub max_backoff_factor: u32,
    /// How often to poll the client for an unexpected exit
    pub health_interval: Duration,
    /// Re-request persisted mappings after the first scan
    pub restore_on_startup: bool,
}

impl DriverSettings {
    /// Settings from the application config
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            scan_interval: config.scan.interval(),
            max_backoff_factor: config.scan.max_backoff_factor.max(1),
            health_interval: Duration::from_secs(1),
            restore_on_startup: config.mappings.restore_on_startup,
        }
    }

    /// Delay before the next scan after `failures` consecutive failed scans
    pub fn scan_delay(&self, failures: u32) -> Duration {
        let factor = 2u32
            .saturating_pow(failures)
            .min(self.max_backoff_factor.max(1));
        self.scan_interval.saturating_mul(factor)
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Handle to a running reconciler task
pub struct ReconcilerHandle {
    intents: mpsc::UnboundedSender<Intent>,
    rescan: Arc<Notify>,
    events: mpsc::UnboundedReceiver<ReconcilerEvent>,
    registry: watch::Receiver<ProxyRegistry>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Queue a user intent for the next pass
    pub fn send(&self, intent: Intent) -> Result<(), ReconcilerStopped> {
        self.intents.send(intent).map_err(|_| ReconcilerStopped)
    }

    /// Ask for a scan; multiple requests before the next pass collapse into one
    pub fn request_rescan(&self) {
        self.rescan.notify_one();
    }

    /// Next event, or `None` once the task has exited
    pub async fn next_event(&mut self) -> Option<ReconcilerEvent> {
        self.events.recv().await
    }

    /// Watch the committed registry
    pub fn registry(&self) -> watch::Receiver<ProxyRegistry> {
        self.registry.clone()
    }

    /// Stop the loop, stop the tunnel client and wait for the task
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Reconciler task did not stop in time");
            }
        }
        info!("Reconciler shut down");
    }
}

/// Start the reconciler loop on the current tokio runtime
pub fn spawn<S, P>(
    source: Arc<S>,
    reconciler: Reconciler<P>,
    settings: DriverSettings,
) -> ReconcilerHandle
where
    S: PortSource + 'static,
    P: ClientProcess + 'static,
{
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rescan = Arc::new(Notify::new());
    let registry = reconciler.subscribe();

    let driver = Driver {
        source,
        reconciler,
        settings,
        intents: intent_rx,
        events: event_tx,
        rescan: Arc::clone(&rescan),
        shutdown: shutdown_rx,
        scan_failures: 0,
    };
    let task = tokio::spawn(driver.run());

    ReconcilerHandle {
        intents: intent_tx,
        rescan,
        events: event_rx,
        registry,
        shutdown: shutdown_tx,
        task: Some(task),
    }
}

struct Driver<S, P> {
    source: Arc<S>,
    reconciler: Reconciler<P>,
    settings: DriverSettings,
    intents: mpsc::UnboundedReceiver<Intent>,
    events: mpsc::UnboundedSender<ReconcilerEvent>,
    rescan: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    scan_failures: u32,
}

impl<S, P> Driver<S, P>
where
    S: PortSource + 'static,
    P: ClientProcess + 'static,
{
    async fn run(mut self) {
        debug!("Reconciler loop started");

        let events = self.reconciler.initialize().await;
        self.emit(events);

        let first = self.scan().await;
        let restored = match (&first, self.settings.restore_on_startup) {
            (Some(snapshot), true) => self.reconciler.restore_intents(snapshot),
            _ => Vec::new(),
        };
        let events = self.reconciler.pass(first, restored).await;
        self.emit(events);

        let mut next_scan = Instant::now() + self.settings.scan_delay(self.scan_failures);
        let mut health = tokio::time::interval(self.settings.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let restart_at = self.reconciler.restart_deadline();

            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    debug!("Reconciler loop received shutdown signal");
                    break;
                }

                Some(intent) = self.intents.recv() => {
                    let mut batch = vec![intent];
                    while let Ok(more) = self.intents.try_recv() {
                        batch.push(more);
                    }

                    let snapshot = if batch.contains(&Intent::Refresh) {
                        next_scan = Instant::now() + self.settings.scan_interval;
                        self.scan().await
                    } else {
                        None
                    };

                    let events = self.reconciler.pass(snapshot, batch).await;
                    self.emit(events);
                }

                () = self.rescan.notified() => {
                    let snapshot = self.scan().await;
                    next_scan = Instant::now() + self.settings.scan_delay(self.scan_failures);
                    let events = self.reconciler.pass(snapshot, Vec::new()).await;
                    self.emit(events);
                }

                () = sleep_until(next_scan) => {
                    let snapshot = self.scan().await;
                    next_scan = Instant::now() + self.settings.scan_delay(self.scan_failures);
                    let events = self.reconciler.pass(snapshot, Vec::new()).await;
                    self.emit(events);
                }

                () = sleep_until(restart_at.unwrap_or(next_scan)), if restart_at.is_some() => {
                    let events = self.reconciler.restart_client(Instant::now()).await;
                    self.emit(events);
                }

                _ = health.tick() => {
                    let events = self.reconciler.check_client(Instant::now());
                    self.emit(events);
                }
            }
        }

        self.reconciler.shutdown().await;
        debug!("Reconciler loop exited");
    }

    async fn scan(&mut self) -> Option<PortSnapshot> {
        match scan_blocking(&self.source).await {
            Ok(snapshot) => {
                if self.scan_failures > 0 {
                    info!(failures = self.scan_failures, "Port scan recovered");
                }
                self.scan_failures = 0;
                Some(snapshot)
            }
            Err(e) => {
                self.scan_failures = self.scan_failures.saturating_add(1);
                warn!(
                    error = %e,
                    failures = self.scan_failures,
                    "Port scan failed, backing off"
                );
                self.emit(vec![ReconcilerEvent::ObservationFailed {
                    reason: e.to_string(),
                }]);
                None
            }
        }
    }

    fn emit(&self, events: Vec<ReconcilerEvent>) {
        for event in events {
            debug!(event = ?event, "Reconciler event");
            // Nobody listening is fine
            let _ = self.events.send(event);
        }
    }
}

async fn scan_blocking<S: PortSource + 'static>(source: &Arc<S>) -> ObservationResult<PortSnapshot> {
    let source = Arc::clone(source);
    tokio::task::spawn_blocking(move || source.scan())
        .await
        .map_err(|e| ObservationError::TaskFailed(e.to_string()))?
}

// ABOUTME: Reconciler - ties observation, registry, config rendering and the client together
//
// One `pass` is the unit of work: fold in a fresh port snapshot, tear down
// mappings whose port vanished, apply queued user intents in order, then render
// and apply the configuration if the desired set changed. All registry changes
// happen on a staged copy that replaces the live registry at the end, so
// readers never see a half-applied pass.
//
// Entries only become Active after the config is on disk and the client has
// confirmed it is running with it. On an apply failure the previous config is
// restored on disk, new entries go to Failed and Active entries are untouched.

pub mod driver;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::observer::{ListeningPort, PortSnapshot};
use crate::persist::MappingStore;
use crate::registry::{ProxyRegistry, ProxyState};
use crate::supervisor::{ClientAvailability, ClientProcess, ClientState, ClientSupervisor, LaunchError};
use crate::synth;

pub use driver::{DriverSettings, ReconcilerHandle, ReconcilerStopped};

/// A user request, applied in arrival order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Map `local_port` to `remote_port` on the tunnel server
    MapPort {
        /// Port on this host
        local_port: u16,
        /// Port on the tunnel server
        remote_port: u16,
    },
    /// Tear down the mapping for `local_port`
    UnmapPort {
        /// Port on this host
        local_port: u16,
    },
    /// Rescan now, re-check the client and clear a crash loop
    Refresh,
    /// Remove every mapping and stop the client
    StopAll,
}

/// Status change reported to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcilerEvent {
    /// Listening ports changed since the previous snapshot
    PortsUpdated {
        /// Ports that started listening
        added: Vec<ListeningPort>,
        /// Ports that stopped listening
        removed: Vec<u16>,
    },
    /// A mapping is live
    MappingActivated {
        /// Port on this host
        local_port: u16,
        /// Port on the tunnel server
        remote_port: u16,
    },
    /// A mapping was torn down
    MappingRemoved {
        /// Port on this host
        local_port: u16,
    },
    /// A mapping could not be applied
    MappingFailed {
        /// Port on this host
        local_port: u16,
        /// Why
        reason: String,
    },
    /// A map request was refused before touching the registry
    IntentRejected {
        /// Port on this host
        local_port: u16,
        /// Why
        reason: String,
    },
    /// The tunnel client appeared or disappeared
    ClientAvailabilityChanged {
        /// New availability
        availability: ClientAvailability,
    },
    /// The tunnel client changed lifecycle state
    ClientStateChanged {
        /// New state
        state: ClientState,
    },
    /// The port scan failed
    ObservationFailed {
        /// Why
        reason: String,
    },
}

/// The reconciliation engine. Owns the registry and the client supervisor.
pub struct Reconciler<P> {
    registry: ProxyRegistry,
    supervisor: ClientSupervisor<P>,
    server: ServerConfig,
    config_path: PathBuf,
    store: Option<MappingStore>,
    availability: ClientAvailability,
    snapshot: Option<PortSnapshot>,
    last_applied: Option<BTreeMap<u16, u16>>,
    last_good: Option<Vec<u8>>,
    persisted: BTreeMap<u16, u16>,
    registry_tx: watch::Sender<ProxyRegistry>,
}

impl<P: ClientProcess> Reconciler<P> {
    /// Create a reconciler writing the client config to `config_path`
    pub fn new(supervisor: ClientSupervisor<P>, server: ServerConfig, config_path: PathBuf) -> Self {
        // Whatever is on disk already is the config to fall back to
        let last_good = std::fs::read(&config_path).ok();
        let (registry_tx, _) = watch::channel(ProxyRegistry::new());

        Self {
            registry: ProxyRegistry::new(),
            supervisor,
            server,
            config_path,
            store: None,
            availability: ClientAvailability::missing(),
            snapshot: None,
            last_applied: None,
            last_good,
            persisted: BTreeMap::new(),
            registry_tx,
        }
    }

    /// Persist the requested mappings to `store` after every pass
    #[must_use]
    pub fn with_store(mut self, store: MappingStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Current registry
    pub const fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    /// Watch the registry as committed at the end of each pass
    pub fn subscribe(&self) -> watch::Receiver<ProxyRegistry> {
        self.registry_tx.subscribe()
    }

    /// Last known client availability
    pub const fn availability(&self) -> &ClientAvailability {
        &self.availability
    }

    /// Client lifecycle state
    pub const fn client_state(&self) -> ClientState {
        self.supervisor.state()
    }

    /// Mapping set of the last successfully applied config
    pub const fn last_applied(&self) -> Option<&BTreeMap<u16, u16>> {
        self.last_applied.as_ref()
    }

    /// The most recent port snapshot
    pub const fn snapshot(&self) -> Option<&PortSnapshot> {
        self.snapshot.as_ref()
    }

    /// When a scheduled client restart is due
    pub const fn restart_deadline(&self) -> Option<Instant> {
        self.supervisor.restart_deadline()
    }

    /// Access the supervisor
    pub const fn supervisor(&self) -> &ClientSupervisor<P> {
        &self.supervisor
    }

    /// Check whether the client is installed. Call once before the first pass.
    pub async fn initialize(&mut self) -> Vec<ReconcilerEvent> {
        let mut events = Vec::new();
        self.refresh_availability(&mut events).await;
        events.push(ReconcilerEvent::ClientStateChanged {
            state: self.supervisor.state(),
        });
        events
    }

    /// Map intents for persisted mappings whose port is listening in `snapshot`.
    ///
    /// Mappings for ports that are not listening are dropped; the store is
    /// rewritten without them at the end of the next pass.
    pub fn restore_intents(&mut self, snapshot: &PortSnapshot) -> Vec<Intent> {
        let Some(store) = &self.store else {
            return Vec::new();
        };

        let saved = match store.load() {
            Ok(saved) => saved,
            Err(e) => {
                warn!(error = %e, "Could not load persisted mappings");
                return Vec::new();
            }
        };
        self.persisted.clone_from(&saved);

        saved
            .into_iter()
            .filter(|&(local_port, remote_port)| {
                let listening = snapshot.contains(local_port);
                if !listening {
                    info!(local_port, remote_port, "Dropping persisted mapping, port not listening");
                }
                listening
            })
            .map(|(local_port, remote_port)| Intent::MapPort {
                local_port,
                remote_port,
            })
            .collect()
    }

    /// Run one reconciliation pass
    pub async fn pass(
        &mut self,
        snapshot: Option<PortSnapshot>,
        intents: Vec<Intent>,
    ) -> Vec<ReconcilerEvent> {
        let mut events = Vec::new();
        let state_before = self.supervisor.state();
        let mut staged = self.registry.clone();
        let mut force = false;
        let mut stop_all = false;

        if let Some(snapshot) = snapshot {
            self.observe(snapshot, &mut events);
        }

        if let Some(current) = &self.snapshot {
            let vanished: Vec<u16> = staged
                .entries()
                .filter(|e| e.state.is_desired() && !current.contains(e.local_port))
                .map(|e| e.local_port)
                .collect();
            for local_port in vanished {
                info!(local_port, "Port stopped listening, closing mapping");
                staged.mark_closing(local_port);
            }
        }

        for intent in intents {
            debug!(intent = ?intent, "Applying intent");
            match intent {
                Intent::MapPort {
                    local_port,
                    remote_port,
                } => self.apply_map(&mut staged, local_port, remote_port, &mut events),
                Intent::UnmapPort { local_port } => {
                    staged.mark_closing(local_port);
                }
                Intent::Refresh => {
                    force = true;
                    self.supervisor.reset();
                    self.refresh_availability(&mut events).await;
                }
                Intent::StopAll => {
                    stop_all = true;
                    let ports: Vec<u16> = staged.entries().map(|e| e.local_port).collect();
                    for local_port in ports {
                        staged.mark_closing(local_port);
                    }
                }
            }
        }

        if !self.availability.installed {
            // Nothing can be applied; report everything wanted as failed
            Self::fail_entries(
                &mut staged,
                ProxyState::is_desired,
                &LaunchError::NotInstalled.to_string(),
                &mut events,
            );
            self.retire_without_client(&mut staged, &mut events);
        } else if self.supervisor.state() == ClientState::Failed && !stop_all {
            let reason = LaunchError::CrashLoop {
                attempts: self.supervisor.max_restarts(),
            }
            .to_string();
            Self::fail_entries(
                &mut staged,
                |state| state == ProxyState::Pending,
                &reason,
                &mut events,
            );
        } else {
            self.apply(&mut staged, force, stop_all, &mut events).await;
        }

        self.finish(staged, state_before, &mut events);
        events
    }

    /// Detect a client crash and schedule a bounded restart
    pub fn check_client(&mut self, now: Instant) -> Vec<ReconcilerEvent> {
        let mut events = Vec::new();
        if !self.supervisor.poll_health() {
            return events;
        }

        events.push(ReconcilerEvent::ClientStateChanged {
            state: ClientState::Crashed,
        });
        if let Err(e) = self.supervisor.schedule_restart(now) {
            self.surface_crash_loop(&e, &mut events);
        }
        events
    }

    /// Perform a scheduled restart once it is due
    pub async fn restart_client(&mut self, now: Instant) -> Vec<ReconcilerEvent> {
        let mut events = Vec::new();
        if !self.supervisor.restart_due(now) {
            return events;
        }

        match self.supervisor.restart(&self.config_path).await {
            Ok(()) => {
                events.push(ReconcilerEvent::ClientStateChanged {
                    state: ClientState::Running,
                });
            }
            Err(LaunchError::NotInstalled) => {
                self.availability = ClientAvailability::missing();
                events.push(ReconcilerEvent::ClientAvailabilityChanged {
                    availability: self.availability.clone(),
                });
            }
            Err(e) => {
                warn!(error = %e, "Tunnel client restart failed");
                if let Err(e) = self.supervisor.schedule_restart(now) {
                    self.surface_crash_loop(&e, &mut events);
                }
            }
        }
        events
    }

    /// Stop the client on shutdown. Mappings stay persisted.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.supervisor.stop().await {
            warn!(error = %e, "Failed to stop tunnel client on shutdown");
        }
        info!("Reconciler stopped");
    }

    fn observe(&mut self, snapshot: PortSnapshot, events: &mut Vec<ReconcilerEvent>) {
        let (added, removed) = match &self.snapshot {
            Some(previous) => snapshot.diff(previous),
            None => (snapshot.ports().to_vec(), Vec::new()),
        };

        if self.snapshot.is_none() || !added.is_empty() || !removed.is_empty() {
            debug!(added = added.len(), removed = removed.len(), "Ports updated");
            events.push(ReconcilerEvent::PortsUpdated {
                added,
                removed: removed.into_iter().map(|p| p.port).collect(),
            });
        }
        self.snapshot = Some(snapshot);
    }

    fn apply_map(
        &self,
        staged: &mut ProxyRegistry,
        local_port: u16,
        remote_port: u16,
        events: &mut Vec<ReconcilerEvent>,
    ) {
        let rejection = if let Err(e) = synth::validate_mapping(local_port, remote_port) {
            Some(e.to_string())
        } else if self
            .snapshot
            .as_ref()
            .is_some_and(|snapshot| !snapshot.contains(local_port))
        {
            Some(format!("Port {local_port} is not listening"))
        } else {
            match staged.apply_intent(local_port, remote_port) {
                Ok(entry) if entry.state == ProxyState::Pending && !self.availability.installed => {
                    let reason = LaunchError::NotInstalled.to_string();
                    staged.record_failure(local_port, reason.clone());
                    events.push(ReconcilerEvent::MappingFailed { local_port, reason });
                    None
                }
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            }
        };

        if let Some(reason) = rejection {
            info!(local_port, remote_port, reason = %reason, "Map request rejected");
            events.push(ReconcilerEvent::IntentRejected { local_port, reason });
        }
    }

    async fn apply(
        &mut self,
        staged: &mut ProxyRegistry,
        force: bool,
        stop_all: bool,
        events: &mut Vec<ReconcilerEvent>,
    ) {
        let desired = staged.desired();
        let set_changed = self.last_applied.as_ref() != Some(&desired);
        if !set_changed && !force && !stop_all && !staged.has_unsettled() {
            return;
        }

        let rendered = match synth::render(&desired, &self.server) {
            Ok(rendered) => rendered,
            Err(e) => {
                Self::fail_entries(
                    staged,
                    |state| state == ProxyState::Pending,
                    &e.to_string(),
                    events,
                );
                return;
            }
        };

        let bytes_changed = self.last_good.as_deref() != Some(rendered.as_bytes());
        if bytes_changed {
            if let Err(e) = rendered.write_to(&self.config_path) {
                warn!(error = %e, path = %self.config_path.display(), "Failed to write client config");
                Self::fail_entries(
                    staged,
                    |state| state == ProxyState::Pending,
                    &format!("Failed to write client config: {e}"),
                    events,
                );
                return;
            }
            debug!(path = %self.config_path.display(), proxies = desired.len(), "Wrote client config");
        }

        let launched = if stop_all {
            self.supervisor.stop().await
        } else if desired.is_empty() && !self.supervisor.is_running() {
            Ok(())
        } else {
            self.supervisor
                .ensure_running(&self.config_path, bytes_changed)
                .await
        };

        match launched {
            Ok(()) => {
                self.last_good = Some(rendered.as_bytes().to_vec());
                self.last_applied = Some(desired.clone());

                let applied: BTreeSet<u16> = desired.keys().copied().collect();
                let outcome = staged.commit_applied(&applied);
                for entry in outcome.activated {
                    info!(local_port = entry.local_port, remote_port = entry.remote_port, "Mapping active");
                    events.push(ReconcilerEvent::MappingActivated {
                        local_port: entry.local_port,
                        remote_port: entry.remote_port,
                    });
                }
                for local_port in outcome.removed {
                    info!(local_port, "Mapping removed");
                    events.push(ReconcilerEvent::MappingRemoved { local_port });
                }
            }
            Err(e) => {
                if bytes_changed {
                    self.rollback_config();
                }
                if matches!(e, LaunchError::NotInstalled) {
                    self.availability = ClientAvailability::missing();
                    events.push(ReconcilerEvent::ClientAvailabilityChanged {
                        availability: self.availability.clone(),
                    });
                    Self::fail_entries(staged, ProxyState::is_desired, &e.to_string(), events);
                } else {
                    Self::fail_entries(
                        staged,
                        |state| state == ProxyState::Pending,
                        &e.to_string(),
                        events,
                    );
                    self.restart_if_crashed(staged, events);
                }
            }
        }
    }

    /// Active entries need a live client. If the failed launch found the
    /// client dead, queue a restart on the restored config.
    fn restart_if_crashed(&mut self, staged: &mut ProxyRegistry, events: &mut Vec<ReconcilerEvent>) {
        if self.supervisor.state() != ClientState::Crashed
            || self.supervisor.restart_deadline().is_some()
        {
            return;
        }

        if let Err(e) = self.supervisor.schedule_restart(Instant::now()) {
            warn!(error = %e, "Tunnel client restart budget exhausted");
            let reason = e.to_string();
            Self::fail_entries(
                staged,
                |state| state == ProxyState::Pending,
                &reason,
                events,
            );
        }
    }

    /// With no client installed nothing is launched, but `Closing` entries
    /// still present in the applied config are only dropped once a config
    /// without them is on disk.
    fn retire_without_client(&mut self, staged: &mut ProxyRegistry, events: &mut Vec<ReconcilerEvent>) {
        let in_config = staged.in_state(ProxyState::Closing).any(|entry| {
            self.last_applied
                .as_ref()
                .is_some_and(|applied| applied.contains_key(&entry.local_port))
        });

        if in_config {
            let desired = staged.desired();
            let written = synth::render(&desired, &self.server)
                .map_err(|e| e.to_string())
                .and_then(|rendered| {
                    rendered
                        .write_to(&self.config_path)
                        .map(|()| rendered)
                        .map_err(|e| e.to_string())
                });
            match written {
                Ok(rendered) => {
                    debug!(path = %self.config_path.display(), "Rewrote client config without closed mappings");
                    self.last_good = Some(rendered.as_bytes().to_vec());
                    self.last_applied = Some(desired);
                }
                Err(reason) => {
                    warn!(reason = %reason, "Failed to rewrite client config, keeping closing mappings");
                    return;
                }
            }
        }

        let outcome = staged.commit_applied(&BTreeSet::new());
        events.extend(
            outcome
                .removed
                .into_iter()
                .map(|local_port| ReconcilerEvent::MappingRemoved { local_port }),
        );
    }

    fn rollback_config(&self) {
        let result = match &self.last_good {
            Some(bytes) => crate::fsutil::write_atomic(&self.config_path, bytes),
            None => match std::fs::remove_file(&self.config_path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };

        match result {
            Ok(()) => debug!(path = %self.config_path.display(), "Restored last good client config"),
            Err(e) => warn!(error = %e, "Failed to restore last good client config"),
        }
    }

    fn fail_entries(
        staged: &mut ProxyRegistry,
        which: impl Fn(ProxyState) -> bool,
        reason: &str,
        events: &mut Vec<ReconcilerEvent>,
    ) {
        let ports: Vec<u16> = staged
            .entries()
            .filter(|e| which(e.state))
            .map(|e| e.local_port)
            .collect();

        for local_port in ports {
            warn!(local_port, reason = %reason, "Mapping failed");
            staged.record_failure(local_port, reason);
            events.push(ReconcilerEvent::MappingFailed {
                local_port,
                reason: reason.to_string(),
            });
        }
    }

    fn surface_crash_loop(&mut self, error: &LaunchError, events: &mut Vec<ReconcilerEvent>) {
        events.push(ReconcilerEvent::ClientStateChanged {
            state: ClientState::Failed,
        });

        let mut staged = self.registry.clone();
        Self::fail_entries(
            &mut staged,
            |state| state == ProxyState::Pending,
            &error.to_string(),
            events,
        );
        let state = self.supervisor.state();
        self.finish(staged, state, events);
    }

    async fn refresh_availability(&mut self, events: &mut Vec<ReconcilerEvent>) {
        let availability = self.supervisor.locate().await;
        if availability != self.availability {
            info!(
                installed = availability.installed,
                path = ?availability.executable_path,
                "Tunnel client availability changed"
            );
            self.availability = availability;
            events.push(ReconcilerEvent::ClientAvailabilityChanged {
                availability: self.availability.clone(),
            });
        }
    }

    fn finish(
        &mut self,
        staged: ProxyRegistry,
        state_before: ClientState,
        events: &mut Vec<ReconcilerEvent>,
    ) {
        let state_after = self.supervisor.state();
        if state_after != state_before {
            events.push(ReconcilerEvent::ClientStateChanged { state: state_after });
        }

        self.registry = staged;
        self.persist();
        self.registry_tx.send_replace(self.registry.clone());
    }

    fn persist(&mut self) {
        let Some(store) = &self.store else {
            return;
        };

        let requested = self.registry.requested();
        if requested == self.persisted {
            return;
        }

        match store.save(&requested) {
            Ok(()) => self.persisted = requested,
            Err(e) => warn!(error = %e, "Failed to persist mappings"),
        }
    }
}

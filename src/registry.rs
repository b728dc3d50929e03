// ABOUTME: Proxy registry - desired port mappings and their lifecycle state
//
// The registry is a plain owned value. Only the reconciler mutates it, and it
// does so on a staged copy that replaces the live registry at the end of a
// pass, so a half-applied cycle is never visible to readers.
//
// Lifecycle: Pending -> Active -> Closing -> (removed), with Failed reachable
// from Pending/Active on apply failure and reset to Pending by a user retry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Lifecycle state of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    /// Requested but not yet confirmed by the tunnel client
    Pending,
    /// Rendered into the applied configuration and the client is running
    Active,
    /// Being torn down; removed once the config is re-rendered without it
    Closing,
    /// Apply failed; stays here until the user retries
    Failed,
}

impl ProxyState {
    /// Whether the mapping belongs in the desired configuration
    pub const fn is_desired(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// A single local-port to remote-port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    /// Port on this host
    pub local_port: u16,
    /// Port on the tunnel server
    pub remote_port: u16,
    /// Lifecycle state
    pub state: ProxyState,
    /// Reason for the last failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProxyEntry {
    fn pending(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
            state: ProxyState::Pending,
            last_error: None,
        }
    }
}

/// Errors from registry transitions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The local port is already mapped to a different remote port
    #[error("Port {local_port} is already mapped to remote port {existing_remote} (requested {requested_remote})")]
    Conflict {
        /// The local port in question
        local_port: u16,
        /// Remote port of the existing mapping
        existing_remote: u16,
        /// Remote port that was requested
        requested_remote: u16,
    },
}

/// Outcome of `commit_applied`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Entries that became Active in this commit
    pub activated: Vec<ProxyEntry>,
    /// Local ports whose Closing entries were removed
    pub removed: Vec<u16>,
}

/// The authoritative set of mappings, keyed by local port.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProxyRegistry {
    entries: BTreeMap<u16, ProxyEntry>,
}

impl ProxyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a mapping.
    ///
    /// - No entry, or a `Failed`/`Closing` one: (re)set to `Pending`.
    /// - `Pending`/`Active` with the same remote port: returned unchanged.
    /// - `Pending`/`Active` with a different remote port: `Conflict`.
    pub fn apply_intent(
        &mut self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ProxyEntry, RegistryError> {
        if let Some(existing) = self.entries.get(&local_port) {
            if existing.state.is_desired() {
                if existing.remote_port == remote_port {
                    return Ok(existing.clone());
                }
                return Err(RegistryError::Conflict {
                    local_port,
                    existing_remote: existing.remote_port,
                    requested_remote: remote_port,
                });
            }
        }

        let entry = ProxyEntry::pending(local_port, remote_port);
        debug!(local_port, remote_port, "Mapping pending");
        self.entries.insert(local_port, entry.clone());
        Ok(entry)
    }

    /// Begin tearing down a mapping. Absent entries are a no-op.
    ///
    /// Returns true if the entry changed state.
    pub fn mark_closing(&mut self, local_port: u16) -> bool {
        match self.entries.get_mut(&local_port) {
            Some(entry) if entry.state != ProxyState::Closing => {
                debug!(local_port, from = ?entry.state, "Mapping closing");
                entry.state = ProxyState::Closing;
                true
            }
            _ => false,
        }
    }

    /// Record that the given ports are live in the applied configuration.
    ///
    /// Every entry in `applied` becomes `Active`; every `Closing` entry not in
    /// `applied` is removed. Other entries are left alone.
    pub fn commit_applied(&mut self, applied: &BTreeSet<u16>) -> CommitOutcome {
        let mut outcome = CommitOutcome::default();

        for port in applied {
            if let Some(entry) = self.entries.get_mut(port) {
                if entry.state != ProxyState::Active {
                    entry.state = ProxyState::Active;
                    entry.last_error = None;
                    outcome.activated.push(entry.clone());
                }
            }
        }

        self.entries.retain(|port, entry| {
            let keep = entry.state != ProxyState::Closing || applied.contains(port);
            if !keep {
                outcome.removed.push(*port);
            }
            keep
        });

        outcome
    }

    /// Move an entry to `Failed` with a reason. Returns false if absent.
    pub fn record_failure(&mut self, local_port: u16, reason: impl Into<String>) -> bool {
        let Some(entry) = self.entries.get_mut(&local_port) else {
            return false;
        };
        let reason = reason.into();
        debug!(local_port, reason = %reason, "Mapping failed");
        entry.state = ProxyState::Failed;
        entry.last_error = Some(reason);
        true
    }

    /// Look up an entry
    pub fn get(&self, local_port: u16) -> Option<&ProxyEntry> {
        self.entries.get(&local_port)
    }

    /// State of an entry, if present
    pub fn state_of(&self, local_port: u16) -> Option<ProxyState> {
        self.entries.get(&local_port).map(|e| e.state)
    }

    /// All entries ordered by local port
    pub fn entries(&self) -> impl Iterator<Item = &ProxyEntry> {
        self.entries.values()
    }

    /// Entries in a given state
    pub fn in_state(&self, state: ProxyState) -> impl Iterator<Item = &ProxyEntry> {
        self.entries.values().filter(move |e| e.state == state)
    }

    /// The desired mapping set: local -> remote for every Pending/Active entry
    pub fn desired(&self) -> BTreeMap<u16, u16> {
        self.entries
            .values()
            .filter(|e| e.state.is_desired())
            .map(|e| (e.local_port, e.remote_port))
            .collect()
    }

    /// Everything the user still wants mapped, including failed entries
    /// awaiting a retry. This is the set that is persisted.
    pub fn requested(&self) -> BTreeMap<u16, u16> {
        self.entries
            .values()
            .filter(|e| e.state != ProxyState::Closing)
            .map(|e| (e.local_port, e.remote_port))
            .collect()
    }

    /// Whether any entry is waiting on an apply (Pending or Closing)
    pub fn has_unsettled(&self) -> bool {
        self.entries
            .values()
            .any(|e| matches!(e.state, ProxyState::Pending | ProxyState::Closing))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

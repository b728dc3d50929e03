// ABOUTME: Port observer - snapshots of locally listening TCP ports
//
// A `PortSnapshot` is an immutable, port-ordered view of the socket table at
// one instant. Sources implement `PortSource` so the reconciler can be driven
// by the OS socket table scanner or by a fake in tests.

pub mod error;
pub mod sockets;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

pub use error::{ObservationError, ObservationResult};
pub use sockets::SocketScanner;

/// Ports below this are treated as system ports.
pub const FIRST_USER_PORT: u16 = 1024;

/// A listening port and the process that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListeningPort {
    /// The local port number.
    pub port: u16,
    /// Name of the owning process.
    pub process_name: String,
}

impl ListeningPort {
    /// Create a new listening port record
    pub fn new(port: u16, process_name: impl Into<String>) -> Self {
        Self {
            port,
            process_name: process_name.into(),
        }
    }
}

/// Immutable view of the listening ports at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    ports: Vec<ListeningPort>,
    taken_at: DateTime<Utc>,
}

impl PortSnapshot {
    /// Build a snapshot from raw scan results.
    ///
    /// Output is ordered by ascending port. When several processes listen on
    /// the same port only the first one seen is kept.
    pub fn from_scan<I>(raw: I) -> Self
    where
        I: IntoIterator<Item = ListeningPort>,
    {
        let mut seen = BTreeSet::new();
        let mut ports: Vec<ListeningPort> =
            raw.into_iter().filter(|p| seen.insert(p.port)).collect();
        ports.sort_by_key(|p| p.port);

        Self {
            ports,
            taken_at: Utc::now(),
        }
    }

    /// An empty snapshot
    pub fn empty() -> Self {
        Self::from_scan(Vec::new())
    }

    /// Drop system ports (below 1024) from the snapshot
    #[must_use]
    pub fn without_system_ports(mut self) -> Self {
        self.ports.retain(|p| p.port >= FIRST_USER_PORT);
        self
    }

    /// Ports in ascending order
    pub fn ports(&self) -> &[ListeningPort] {
        &self.ports
    }

    /// When the snapshot was taken
    pub const fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Whether `port` is listening in this snapshot
    pub fn contains(&self, port: u16) -> bool {
        self.ports.binary_search_by_key(&port, |p| p.port).is_ok()
    }

    /// Owning process name for `port`, if listening
    pub fn process_name(&self, port: u16) -> Option<&str> {
        self.ports
            .binary_search_by_key(&port, |p| p.port)
            .ok()
            .map(|idx| self.ports[idx].process_name.as_str())
    }

    /// The set of listening port numbers
    pub fn port_set(&self) -> BTreeSet<u16> {
        self.ports.iter().map(|p| p.port).collect()
    }

    /// Number of listening ports
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether no ports are listening
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ports that appeared and disappeared relative to `previous`.
    pub fn diff(&self, previous: &Self) -> (Vec<ListeningPort>, Vec<ListeningPort>) {
        let added = self
            .ports
            .iter()
            .filter(|p| !previous.contains(p.port))
            .cloned()
            .collect();
        let removed = previous
            .ports
            .iter()
            .filter(|p| !self.contains(p.port))
            .cloned()
            .collect();
        (added, removed)
    }
}

/// Anything that can enumerate the host's listening ports.
///
/// `scan` must be side-effect free; it is called from a blocking worker.
#[cfg_attr(test, mockall::automock)]
pub trait PortSource: Send + Sync {
    /// Take a fresh snapshot of the listening ports
    fn scan(&self) -> ObservationResult<PortSnapshot>;
}

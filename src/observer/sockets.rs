// ABOUTME: Cross-platform port scanner built on the OS socket table
//
// netstat2 lists TCP sockets on Linux, macOS and Windows together with the
// PIDs that own them; sysinfo turns those PIDs into process names. A port
// whose owner cannot be resolved (another user's process, or a socket with
// no PID attached) is still reported, with the owner shown as "system".

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

use netstat2::{iterate_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, trace};

use super::error::{ObservationError, ObservationResult};
use super::{ListeningPort, PortSnapshot, PortSource};

/// Owner name used when the socket's process cannot be resolved
pub const UNKNOWN_PROCESS: &str = "system";

/// A listening TCP socket before its owner is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Listener {
    port: u16,
    pid: Option<u32>,
}

/// Port scanner backed by the OS socket table
#[derive(Debug, Clone)]
pub struct SocketScanner {
    include_system_ports: bool,
}

impl SocketScanner {
    /// Scanner for this host; ports below 1024 are reported only if asked for
    pub const fn new(include_system_ports: bool) -> Self {
        Self {
            include_system_ports,
        }
    }
}

impl PortSource for SocketScanner {
    fn scan(&self) -> ObservationResult<PortSnapshot> {
        let listeners = listening_sockets()?;

        let mut pids: Vec<u32> = listeners.iter().filter_map(|l| l.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        let names = process_names(&pids);

        let snapshot = PortSnapshot::from_scan(resolve_owners(&listeners, &names));
        let snapshot = if self.include_system_ports {
            snapshot
        } else {
            snapshot.without_system_ports()
        };

        debug!(ports = snapshot.len(), "Port scan complete");
        Ok(snapshot)
    }
}

fn listening_sockets() -> ObservationResult<Vec<Listener>> {
    let families = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let sockets = iterate_sockets_info(families, ProtocolFlags::TCP)
        .map_err(|e| ObservationError::SocketTable(e.to_string()))?;

    let mut listeners = Vec::new();
    for socket in sockets {
        let info = match socket {
            Ok(info) => info,
            Err(e) => {
                trace!(error = %e, "Skipping unreadable socket entry");
                continue;
            }
        };

        if let ProtocolSocketInfo::Tcp(tcp) = &info.protocol_socket_info {
            if matches!(tcp.state, TcpState::Listen) {
                listeners.push(Listener {
                    port: tcp.local_port,
                    pid: info.associated_pids.first().copied(),
                });
            }
        }
    }

    Ok(listeners)
}

/// Look up display names for `pids`. PIDs that vanished or cannot be
/// inspected are left out.
fn process_names(pids: &[u32]) -> HashMap<u32, String> {
    if pids.is_empty() {
        return HashMap::new();
    }

    let pids: Vec<Pid> = pids.iter().map(|&pid| Pid::from_u32(pid)).collect();
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&pids),
        true,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
    );

    pids.iter()
        .filter_map(|pid| {
            let process = system.process(*pid)?;
            Some((pid.as_u32(), process_label(process.exe(), process.name())))
        })
        .collect()
}

/// Executable basename when known, otherwise the name the OS reports
fn process_label(exe: Option<&Path>, name: &OsStr) -> String {
    exe.and_then(Path::file_name)
        .unwrap_or(name)
        .to_string_lossy()
        .into_owned()
}

fn resolve_owners(listeners: &[Listener], names: &HashMap<u32, String>) -> Vec<ListeningPort> {
    listeners
        .iter()
        .map(|listener| {
            let owner = listener
                .pid
                .and_then(|pid| names.get(&pid))
                .map_or(UNKNOWN_PROCESS, String::as_str);
            ListeningPort::new(listener.port, owner)
        })
        .collect()
}

// ABOUTME: Reconciler task tests: triggers, scan failures, restarts and shutdown

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use portmapper::reconciler::driver::{self, DriverSettings, ReconcilerHandle};
use portmapper::reconciler::ReconcilerEvent;
use portmapper::registry::ProxyState;
use portmapper::supervisor::ClientState;

use super::fixtures::*;

fn fast_settings() -> DriverSettings {
    DriverSettings {
        scan_interval: Duration::from_millis(50),
        max_backoff_factor: 4,
        health_interval: Duration::from_millis(20),
        restore_on_startup: true,
    }
}

fn start(dir: &TempDir, client: &FakeClient, source: &FakeSource) -> ReconcilerHandle {
    let reconciler = build_reconciler(dir, client.clone());
    driver::spawn(Arc::new(source.clone()), reconciler, fast_settings())
}

async fn wait_for(
    handle: &mut ReconcilerHandle,
    wanted: impl Fn(&ReconcilerEvent) -> bool,
) -> ReconcilerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match handle.next_event().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => {}
                None => panic!("reconciler stopped before the expected event"),
            }
        }
    })
    .await
    .expect("timed out waiting for reconciler event")
}

fn activated(port: u16) -> impl Fn(&ReconcilerEvent) -> bool {
    move |e| matches!(e, ReconcilerEvent::MappingActivated { local_port, .. } if *local_port == port)
}

fn client_state(state: ClientState) -> impl Fn(&ReconcilerEvent) -> bool {
    move |e| matches!(e, ReconcilerEvent::ClientStateChanged { state: s } if *s == state)
}

#[tokio::test]
async fn test_map_intent_activates_mapping() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[(8080, "nginx")]);
    let mut handle = start(&dir, &client, &source);

    handle.send(map(8080, 16080)).unwrap();
    wait_for(&mut handle, activated(8080)).await;

    let registry = handle.registry();
    assert_eq!(registry.borrow().state_of(8080), Some(ProxyState::Active));
    assert_eq!(client.starts(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_rescan_removes_vanished_port() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[(8080, "nginx")]);
    let mut handle = start(&dir, &client, &source);
    handle.send(map(8080, 16080)).unwrap();
    wait_for(&mut handle, activated(8080)).await;

    source.set_ports(&[]);
    handle.request_rescan();

    wait_for(&mut handle, |e| {
        matches!(e, ReconcilerEvent::MappingRemoved { local_port: 8080 })
    })
    .await;
    assert!(handle.registry().borrow().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_periodic_scan_picks_up_new_ports() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[]);
    let mut handle = start(&dir, &client, &source);

    source.set_ports(&[(5173, "vite")]);

    let event = wait_for(&mut handle, |e| match e {
        ReconcilerEvent::PortsUpdated { added, .. } => added.iter().any(|p| p.port == 5173),
        _ => false,
    })
    .await;
    assert!(matches!(event, ReconcilerEvent::PortsUpdated { .. }));
    assert!(source.scans() >= 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_failed_scan_is_reported() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[(8080, "nginx")]);
    source.set_failing(true);
    let mut handle = start(&dir, &client, &source);

    wait_for(&mut handle, |e| {
        matches!(e, ReconcilerEvent::ObservationFailed { .. })
    })
    .await;

    // Recovery on a later scan
    source.set_failing(false);
    wait_for(&mut handle, |e| matches!(e, ReconcilerEvent::PortsUpdated { .. })).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_crashed_client_is_restarted() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[(8080, "nginx")]);
    let mut handle = start(&dir, &client, &source);
    handle.send(map(8080, 16080)).unwrap();
    wait_for(&mut handle, activated(8080)).await;

    client.crash();

    wait_for(&mut handle, client_state(ClientState::Crashed)).await;
    wait_for(&mut handle, client_state(ClientState::Running)).await;
    assert_eq!(client.starts(), 2);
    assert!(client.running());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_persisted_mappings_restored_on_startup() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[(8080, "nginx")]);
    let saved: BTreeMap<u16, u16> = [(8080, 16080), (3000, 13000)].into_iter().collect();
    portmapper::persist::MappingStore::new(dir.path().join("mappings.json"))
        .save(&saved)
        .unwrap();

    let mut handle = start(&dir, &client, &source);

    wait_for(&mut handle, activated(8080)).await;
    assert!(handle.registry().borrow().get(3000).is_none());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_client() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[(8080, "nginx")]);
    let mut handle = start(&dir, &client, &source);
    handle.send(map(8080, 16080)).unwrap();
    wait_for(&mut handle, activated(8080)).await;

    handle.shutdown().await;

    assert!(client.stops() >= 1);
    assert!(!client.running());
}

#[tokio::test]
async fn test_registry_watch_closes_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let client = FakeClient::installed();
    let source = FakeSource::with_ports(&[]);
    let handle = start(&dir, &client, &source);
    let registry = handle.registry();

    handle.shutdown().await;

    assert!(registry.has_changed().is_err());
}

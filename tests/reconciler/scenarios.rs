// ABOUTME: End-to-end reconciliation scenarios against a fake tunnel client
//
// Covers mapping activation, teardown when a port vanishes, the missing-client
// path, duplicate and conflicting requests, rollback on launch failure, and
// stop-all.

use pretty_assertions::assert_eq;

use portmapper::reconciler::{Intent, ReconcilerEvent};
use portmapper::registry::ProxyState;
use portmapper::supervisor::ClientState;

use super::fixtures::*;

#[tokio::test]
async fn test_scenario_map_port_becomes_active() {
    let mut h = Harness::new(FakeClient::installed()).await;

    let events = h.pass(&[(8080, "nginx")], vec![map(8080, 16080)]).await;

    let entry = h.reconciler.registry().get(8080).unwrap();
    assert_eq!(entry.state, ProxyState::Active);
    assert_eq!(entry.remote_port, 16080);
    assert_eq!(activated_ports(&events), vec![8080]);

    assert_eq!(h.rendered_proxies(), [(8080, 16080)].into_iter().collect());
    assert_eq!(h.client.starts(), 1);
    assert_eq!(h.reconciler.client_state(), ClientState::Running);
}

#[tokio::test]
async fn test_scenario_vanished_port_is_removed() {
    let mut h = Harness::new(FakeClient::installed()).await;
    h.pass(&[(8080, "nginx")], vec![map(8080, 16080)]).await;

    let events = h.pass(&[], vec![]).await;

    assert!(h.reconciler.registry().get(8080).is_none());
    assert_eq!(removed_ports(&events), vec![8080]);
    assert!(h.rendered_proxies().is_empty());
    // Running client was told to pick up the shrunken config
    assert_eq!(h.client.reloads(), 1);
}

#[tokio::test]
async fn test_scenario_not_installed_fails_without_writing() {
    let mut h = Harness::new(FakeClient::missing()).await;

    let events = h.pass(&[(8080, "nginx")], vec![map(8080, 16080)]).await;

    let entry = h.reconciler.registry().get(8080).unwrap();
    assert_eq!(entry.state, ProxyState::Failed);
    assert_eq!(entry.last_error.as_deref(), Some("NotInstalled"));
    assert_eq!(failed_ports(&events), vec![8080]);
    assert!(!h.config_exists());
    assert_eq!(h.client.starts(), 0);
}

#[tokio::test]
async fn test_scenario_duplicate_map_is_not_a_conflict() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let ports = [(9000, "app")];

    let events = h
        .pass(&ports, vec![map(9000, 19000), map(9000, 19000)])
        .await;

    assert!(!events
        .iter()
        .any(|e| matches!(e, ReconcilerEvent::IntentRejected { .. })));
    assert_eq!(h.reconciler.registry().len(), 1);

    // Again once active: no restart, no reload
    let events = h.pass(&ports, vec![map(9000, 19000)]).await;
    assert!(events.is_empty());
    assert_eq!(h.client.starts(), 1);
    assert_eq!(h.client.reloads(), 0);
}

#[tokio::test]
async fn test_different_remote_port_is_rejected() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let ports = [(9000, "app")];
    h.pass(&ports, vec![map(9000, 19000)]).await;

    let events = h.pass(&ports, vec![map(9000, 19001)]).await;

    assert!(matches!(
        events.as_slice(),
        [ReconcilerEvent::IntentRejected { local_port: 9000, .. }]
    ));
    assert_eq!(h.reconciler.registry().get(9000).unwrap().remote_port, 19000);
}

#[tokio::test]
async fn test_map_of_non_listening_port_is_rejected() {
    let mut h = Harness::new(FakeClient::installed()).await;

    let events = h.pass(&[(8080, "nginx")], vec![map(3000, 13000)]).await;

    assert!(events.iter().any(|e| matches!(
        e,
        ReconcilerEvent::IntentRejected { local_port: 3000, .. }
    )));
    assert!(h.reconciler.registry().is_empty());
    assert_eq!(h.client.starts(), 0);
}

#[tokio::test]
async fn test_unmap_removes_mapping() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let ports = [(8080, "nginx"), (3000, "node")];
    h.pass(&ports, vec![map(8080, 16080), map(3000, 13000)]).await;

    let events = h.pass(&ports, vec![unmap(8080)]).await;

    assert_eq!(removed_ports(&events), vec![8080]);
    assert_eq!(h.rendered_proxies(), [(3000, 13000)].into_iter().collect());
    assert_eq!(
        h.reconciler.registry().state_of(3000),
        Some(ProxyState::Active)
    );
}

#[tokio::test]
async fn test_unmap_and_vanish_in_same_pass_converge() {
    let mut h = Harness::new(FakeClient::installed()).await;
    h.pass(&[(8080, "nginx")], vec![map(8080, 16080)]).await;

    let events = h.pass(&[], vec![unmap(8080)]).await;

    assert_eq!(removed_ports(&events), vec![8080]);
    assert!(h.reconciler.registry().is_empty());
}

#[tokio::test]
async fn test_unmap_absent_port_is_noop() {
    let mut h = Harness::new(FakeClient::installed()).await;

    let events = h.pass(&[(8080, "nginx")], vec![unmap(8080)]).await;

    assert!(h.reconciler.registry().is_empty());
    assert!(removed_ports(&events).is_empty());
}

#[tokio::test]
async fn test_launch_failure_rolls_back_config() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let ports = [(8080, "nginx"), (3000, "node")];
    h.pass(&ports, vec![map(8080, 16080)]).await;
    let good = std::fs::read_to_string(h.config_path()).unwrap();

    // Client dies and will not come back
    h.client.crash();
    h.client.set_start_outcome(StartOutcome::ExitEarly);
    let events = h.pass(&ports, vec![map(3000, 13000)]).await;

    assert_eq!(failed_ports(&events), vec![3000]);
    assert_eq!(
        h.reconciler.registry().state_of(3000),
        Some(ProxyState::Failed)
    );
    // Already-active mapping untouched
    assert_eq!(
        h.reconciler.registry().state_of(8080),
        Some(ProxyState::Active)
    );
    assert_eq!(std::fs::read_to_string(h.config_path()).unwrap(), good);
}

#[tokio::test]
async fn test_first_launch_failure_removes_config() {
    let client = FakeClient::installed();
    client.set_start_outcome(StartOutcome::ExitEarly);
    let mut h = Harness::new(client).await;

    let events = h.pass(&[(8080, "nginx")], vec![map(8080, 16080)]).await;

    assert_eq!(failed_ports(&events), vec![8080]);
    assert!(!h.config_exists());
}

#[tokio::test]
async fn test_failed_entry_can_be_retried() {
    let client = FakeClient::installed();
    client.set_start_outcome(StartOutcome::ExitEarly);
    let mut h = Harness::new(client).await;
    let ports = [(8080, "nginx")];
    h.pass(&ports, vec![map(8080, 16080)]).await;

    h.client.set_start_outcome(StartOutcome::Succeed);
    let events = h.pass(&ports, vec![map(8080, 16080)]).await;

    assert_eq!(activated_ports(&events), vec![8080]);
    assert!(h.reconciler.registry().get(8080).unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_client_confirms_config_before_activation() {
    let mut h = Harness::new(FakeClient::installed()).await;

    h.pass(&[(8080, "nginx")], vec![map(8080, 16080)]).await;

    let seen = h.client.applied_configs();
    assert_eq!(seen.len(), 1);
    assert_eq!(proxies_in(&seen[0]), [(8080, 16080)].into_iter().collect());
}

#[tokio::test]
async fn test_stop_all_removes_everything_and_stops_client() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let ports = [(8080, "nginx"), (3000, "node")];
    h.pass(&ports, vec![map(8080, 16080), map(3000, 13000)]).await;

    let events = h.pass(&ports, vec![Intent::StopAll]).await;

    assert!(h.reconciler.registry().is_empty());
    assert_eq!(removed_ports(&events), vec![3000, 8080]);
    assert_eq!(h.client.stops(), 1);
    assert!(!h.client.running());
    assert!(h.rendered_proxies().is_empty());
    assert_eq!(h.reconciler.client_state(), ClientState::Stopped);
}

#[tokio::test]
async fn test_invalid_remote_port_rejected() {
    let mut h = Harness::new(FakeClient::installed()).await;

    let events = h.pass(&[(8080, "nginx")], vec![map(8080, 0)]).await;

    assert!(events.iter().any(|e| matches!(
        e,
        ReconcilerEvent::IntentRejected { local_port: 8080, .. }
    )));
    assert!(h.reconciler.registry().is_empty());
}

#[tokio::test]
async fn test_ports_updated_reports_diff() {
    let mut h = Harness::new(FakeClient::installed()).await;
    h.pass(&[(8080, "nginx")], vec![]).await;

    let events = h.pass(&[(3000, "node")], vec![]).await;

    match &events[0] {
        ReconcilerEvent::PortsUpdated { added, removed } => {
            assert_eq!(added.len(), 1);
            assert_eq!(added[0].port, 3000);
            assert_eq!(removed, &vec![8080]);
        }
        other => panic!("expected PortsUpdated, got {other:?}"),
    }

    // Unchanged snapshot: no event
    assert!(h.pass(&[(3000, "node")], vec![]).await.is_empty());
}

#[tokio::test]
async fn test_refresh_finds_newly_installed_client() {
    let mut h = Harness::new(FakeClient::missing()).await;
    let ports = [(8080, "nginx")];
    h.pass(&ports, vec![map(8080, 16080)]).await;

    h.client.set_installed(true);
    let events = h
        .pass(&ports, vec![Intent::Refresh, map(8080, 16080)])
        .await;

    assert!(events.iter().any(|e| matches!(
        e,
        ReconcilerEvent::ClientAvailabilityChanged { availability } if availability.installed
    )));
    assert_eq!(activated_ports(&events), vec![8080]);
}

#[tokio::test]
async fn test_registry_watch_sees_committed_state() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let mut watch = h.reconciler.subscribe();

    h.pass(&[(8080, "nginx")], vec![map(8080, 16080)]).await;

    assert!(watch.has_changed().unwrap());
    let registry = watch.borrow_and_update().clone();
    assert_eq!(registry.state_of(8080), Some(ProxyState::Active));
}

#[tokio::test]
async fn test_failed_relaunch_schedules_restart_for_active_mappings() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let ports = [(8080, "nginx"), (9000, "app")];
    h.pass(&ports, vec![map(8080, 16080)]).await;

    // Client dies before a health check notices, and will not come back yet
    h.client.crash();
    h.client.set_start_outcome(StartOutcome::ExitEarly);
    let events = h.pass(&ports, vec![map(9000, 19000)]).await;

    assert_eq!(failed_ports(&events), vec![9000]);
    assert!(events.contains(&ReconcilerEvent::ClientStateChanged {
        state: ClientState::Crashed
    }));
    let deadline = h.reconciler.restart_deadline().unwrap();

    h.client.set_start_outcome(StartOutcome::Succeed);
    let events = h.reconciler.restart_client(deadline).await;

    assert_eq!(
        events,
        vec![ReconcilerEvent::ClientStateChanged {
            state: ClientState::Running
        }]
    );
    assert!(h.client.running());
    assert_eq!(
        h.reconciler.registry().state_of(8080),
        Some(ProxyState::Active)
    );
    // Restarted on the last good config
    let seen = h.client.applied_configs();
    assert_eq!(
        proxies_in(seen.last().unwrap()),
        [(8080, 16080)].into_iter().collect()
    );
}

#[tokio::test]
async fn test_unmap_without_client_rewrites_config_before_removal() {
    let mut h = Harness::new(FakeClient::installed()).await;
    let ports = [(8080, "nginx")];
    h.pass(&ports, vec![map(8080, 16080)]).await;

    h.client.set_installed(false);
    h.pass(&ports, vec![Intent::Refresh]).await;
    assert_eq!(
        h.reconciler.registry().state_of(8080),
        Some(ProxyState::Failed)
    );
    assert_eq!(h.rendered_proxies(), [(8080, 16080)].into_iter().collect());

    let events = h.pass(&ports, vec![unmap(8080)]).await;

    assert_eq!(removed_ports(&events), vec![8080]);
    assert!(h.reconciler.registry().get(8080).is_none());
    assert!(h.rendered_proxies().is_empty());
}

// ABOUTME: Crash detection and bounded restart behaviour

use std::time::Duration;

use tokio::time::Instant;

use portmapper::reconciler::{Intent, ReconcilerEvent};
use portmapper::registry::ProxyState;
use portmapper::supervisor::ClientState;

use super::fixtures::*;

async fn running_harness() -> Harness {
    let mut h = Harness::new(FakeClient::installed()).await;
    h.pass(&[(8080, "nginx"), (3000, "node")], vec![map(8080, 16080)])
        .await;
    assert_eq!(h.client.starts(), 1);
    h
}

#[tokio::test]
async fn test_crash_schedules_restart() {
    let mut h = running_harness().await;
    let now = Instant::now();

    h.client.crash();
    let events = h.reconciler.check_client(now);

    assert_eq!(
        events,
        vec![ReconcilerEvent::ClientStateChanged {
            state: ClientState::Crashed
        }]
    );
    assert_eq!(
        h.reconciler.restart_deadline(),
        Some(now + Duration::from_millis(100))
    );

    // Not due yet
    assert!(h.reconciler.restart_client(now).await.is_empty());
    assert_eq!(h.client.starts(), 1);

    let events = h
        .reconciler
        .restart_client(now + Duration::from_millis(100))
        .await;
    assert_eq!(
        events,
        vec![ReconcilerEvent::ClientStateChanged {
            state: ClientState::Running
        }]
    );
    assert_eq!(h.client.starts(), 2);
}

#[tokio::test]
async fn test_healthy_client_is_left_alone() {
    let mut h = running_harness().await;

    assert!(h.reconciler.check_client(Instant::now()).is_empty());
    assert!(h.reconciler.restart_deadline().is_none());
}

#[tokio::test]
async fn test_crash_loop_stops_after_max_restarts() {
    let mut h = running_harness().await;
    let start = Instant::now();

    // Crash over and over inside one window
    let mut saw_failed = false;
    for i in 0..10u64 {
        let now = start + Duration::from_secs(i);
        h.client.crash();
        let events = h.reconciler.check_client(now);
        if events.contains(&ReconcilerEvent::ClientStateChanged {
            state: ClientState::Failed,
        }) {
            saw_failed = true;
            break;
        }
        if let Some(at) = h.reconciler.restart_deadline() {
            h.reconciler.restart_client(at).await;
        }
    }

    assert!(saw_failed);
    // One initial start plus exactly three restarts
    assert_eq!(h.client.starts(), 4);
    assert_eq!(h.reconciler.client_state(), ClientState::Failed);
    assert!(h.reconciler.restart_deadline().is_none());

    // No further restarts, even after more health checks
    h.reconciler.check_client(start + Duration::from_secs(30));
    assert_eq!(h.client.starts(), 4);
}

#[tokio::test]
async fn test_crash_loop_halts_new_mappings() {
    let mut h = running_harness().await;
    let now = Instant::now();
    for _ in 0..4 {
        h.client.crash();
        h.reconciler.check_client(now);
        h.reconciler.restart_client(now + Duration::from_secs(10)).await;
    }
    assert_eq!(h.reconciler.client_state(), ClientState::Failed);

    let events = h
        .pass(&[(8080, "nginx"), (3000, "node")], vec![map(3000, 13000)])
        .await;

    assert_eq!(failed_ports(&events), vec![3000]);
    let entry = h.reconciler.registry().get(3000).unwrap();
    assert!(entry.last_error.as_deref().unwrap().starts_with("CrashLoop"));
    // Config not rewritten while halted
    assert_eq!(h.rendered_proxies(), [(8080, 16080)].into_iter().collect());
}

#[tokio::test]
async fn test_refresh_clears_crash_loop() {
    let mut h = running_harness().await;
    let now = Instant::now();
    for _ in 0..4 {
        h.client.crash();
        h.reconciler.check_client(now);
        h.reconciler.restart_client(now + Duration::from_secs(10)).await;
    }
    assert_eq!(h.reconciler.client_state(), ClientState::Failed);
    let starts = h.client.starts();

    let ports = [(8080, "nginx"), (3000, "node")];
    h.pass(&ports, vec![Intent::Refresh, map(3000, 13000)]).await;

    assert_eq!(h.reconciler.client_state(), ClientState::Running);
    assert_eq!(h.client.starts(), starts + 1);
    assert_eq!(
        h.reconciler.registry().state_of(3000),
        Some(ProxyState::Active)
    );
}

#[tokio::test]
async fn test_stop_all_cancels_scheduled_restart() {
    let mut h = running_harness().await;
    let now = Instant::now();
    h.client.crash();
    h.reconciler.check_client(now);
    assert!(h.reconciler.restart_deadline().is_some());

    h.pass(&[(8080, "nginx"), (3000, "node")], vec![Intent::StopAll])
        .await;

    assert!(h.reconciler.restart_deadline().is_none());
    assert!(h
        .reconciler
        .restart_client(now + Duration::from_secs(60))
        .await
        .is_empty());
    assert_eq!(h.client.starts(), 1);
}

mod common;

use common::*;
use proxy_hub_common::config::CloudConfig;
use proxy_hub_core::{CloudConnectionHandle, ConnectionEvent};
use proxy_hub_sdk::{OutboundFrame, TelemetryFrame};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn connection(
    broker: &Arc<MockBroker>,
) -> (CloudConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
    let mut config = CloudConfig::default();
    // short enough that reconnect-driven tests finish under the paused clock
    config.stalled_connection_period_ms = 1_000;
    let (events_tx, events_rx) = mpsc::channel(64);
    let handle = CloudConnectionHandle::spawn(
        Arc::new(MockTransport(Arc::clone(broker))),
        &config,
        events_tx,
        CancellationToken::new(),
    );
    (handle, events_rx)
}

fn telemetry(n: i64) -> OutboundFrame {
    OutboundFrame::Telemetry(TelemetryFrame {
        sdid: "D1".into(),
        token: "tok".into(),
        ts: 1_000 + n,
        data: json!({ "n": n }),
        cid: None,
    })
}

async fn wait_for_event(
    rx: &mut mpsc::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    let deadline = Duration::from_secs(120);
    tokio::time::timeout(deadline, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

#[tokio::test(start_paused = true)]
async fn unregistered_telemetry_is_preceded_by_a_register_frame() {
    let broker = MockBroker::new();
    let (handle, _events) = connection(&broker);

    handle.send(telemetry(1)).unwrap();
    wait_until("register and telemetry", || async {
        broker.sent_count() >= 2
    })
    .await;

    let frames = broker.sent_frames();
    assert!(is_register(&frames[0]));
    assert_eq!(frames[0]["sdid"], "D1");
    assert_eq!(frames[0]["Authorization"], "bearer tok");
    assert!(is_telemetry(&frames[1]));
    assert!(frames[1]["cid"].is_string());

    // a second message on the same sdid skips the register
    handle.send(telemetry(2)).unwrap();
    wait_until("second telemetry", || async { broker.sent_count() >= 3 }).await;
    assert_eq!(broker.count_matching(is_register), 1);
}

#[tokio::test(start_paused = true)]
async fn acked_frames_are_not_replayed_after_reconnect() {
    let broker = MockBroker::new();
    let (handle, mut events) = connection(&broker);
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;

    handle.send(telemetry(1)).unwrap();
    wait_until("telemetry", || async {
        broker.count_matching(is_telemetry) >= 1
    })
    .await;
    let cid = broker.find_cid(is_telemetry).unwrap();
    broker.push_inbound(json!({"data": {"cid": cid, "mid": "m1"}}));

    // let the ack land before killing the socket
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.drop_connection();
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Closed)).await;
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.count_matching(is_telemetry), 1);
    // register frames are regenerated on demand, never replayed
    assert_eq!(broker.count_matching(is_register), 1);
}

#[tokio::test(start_paused = true)]
async fn unacked_frames_are_replayed_after_reconnect() {
    let broker = MockBroker::new();
    let (handle, mut events) = connection(&broker);
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;

    handle.send(telemetry(1)).unwrap();
    wait_until("telemetry", || async {
        broker.count_matching(is_telemetry) >= 1
    })
    .await;
    let cid = broker.find_cid(is_telemetry).unwrap();

    broker.drop_connection();
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    wait_until("replayed telemetry", || async {
        broker.count_matching(is_telemetry) >= 2
    })
    .await;

    let frames = broker.sent_frames();
    let replayed = frames.iter().filter(|f| is_telemetry(f)).last().unwrap();
    assert_eq!(replayed["cid"], cid.as_str());
}

#[tokio::test(start_paused = true)]
async fn transmission_failure_is_retried_after_backoff() {
    let broker = MockBroker::new();
    let (handle, _events) = connection(&broker);

    broker.set_fail_sends(true);
    handle.send(telemetry(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.sent_count(), 0);

    broker.set_fail_sends(false);
    // first retry fires one second after the failure
    wait_until("retried telemetry", || async {
        broker.count_matching(is_telemetry) >= 1
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn disabled_retry_drops_failed_frames() {
    let broker = MockBroker::new();
    let mut config = CloudConfig::default();
    config.stalled_connection_period_ms = 600_000;
    config.retry_on_transmission_error = false;
    let (events_tx, _events) = mpsc::channel(64);
    let handle = CloudConnectionHandle::spawn(
        Arc::new(MockTransport(Arc::clone(&broker))),
        &config,
        events_tx,
        CancellationToken::new(),
    );

    broker.set_fail_sends(true);
    handle.send(telemetry(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.set_fail_sends(false);

    // well past where a retry would have fired
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.sent_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_ack_triggers_a_retry_with_the_same_cid() {
    let broker = MockBroker::new();
    let (handle, _events) = connection(&broker);

    handle.send(telemetry(1)).unwrap();
    wait_until("telemetry", || async {
        broker.count_matching(is_telemetry) >= 1
    })
    .await;
    let cid = broker.find_cid(is_telemetry).unwrap();

    // ack with neither mid nor a 200 code
    broker.push_inbound(json!({"data": {"cid": cid}}));
    wait_until("resent telemetry", || async {
        broker.count_matching(|f| f["cid"] == cid.as_str()) >= 2
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn error_401_emits_an_unlink_event() {
    let broker = MockBroker::new();
    let (handle, mut events) = connection(&broker);

    handle.send(telemetry(1)).unwrap();
    wait_until("telemetry", || async {
        broker.count_matching(is_telemetry) >= 1
    })
    .await;
    let cid = broker.find_cid(is_telemetry).unwrap();

    broker.push_inbound(json!({"error": {"code": 401, "cid": cid, "message": "bad token"}}));
    let event = wait_for_event(&mut events, |e| {
        matches!(e, ConnectionEvent::UnlinkCloudDevice(_))
    })
    .await;
    match event {
        ConnectionEvent::UnlinkCloudDevice(sdid) => assert_eq!(sdid, "D1"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limited_frames_are_dropped_not_retried() {
    let broker = MockBroker::new();
    let (handle, _events) = connection(&broker);

    handle.send(telemetry(1)).unwrap();
    wait_until("telemetry", || async {
        broker.count_matching(is_telemetry) >= 1
    })
    .await;
    let cid = broker.find_cid(is_telemetry).unwrap();

    broker.push_inbound(json!({"error": {"code": 429, "cid": cid}}));
    // well past every backoff step that could have been scheduled
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.count_matching(|f| f["cid"] == cid.as_str()), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_409_errors_are_ignored() {
    let broker = MockBroker::new();
    let (handle, _events) = connection(&broker);

    handle.send(telemetry(1)).unwrap();
    wait_until("telemetry", || async {
        broker.count_matching(is_telemetry) >= 1
    })
    .await;
    let cid = broker.find_cid(is_telemetry).unwrap();

    broker.push_inbound(json!({"error": {"code": 409, "cid": cid}}));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.count_matching(|f| f["cid"] == cid.as_str()), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_socket_forces_a_reconnect() {
    let broker = MockBroker::new();
    let mut config = CloudConfig::default();
    config.stalled_connection_period_ms = 200;
    let (events_tx, mut events) = mpsc::channel(64);
    let _handle = CloudConnectionHandle::spawn(
        Arc::new(MockTransport(Arc::clone(&broker))),
        &config,
        events_tx,
        CancellationToken::new(),
    );

    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    // no inbound traffic at all: the stall window expires
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Closed)).await;
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    assert!(broker.connects() >= 2);
}

#[tokio::test(start_paused = true)]
async fn inbound_actions_are_forwarded() {
    let broker = MockBroker::new();
    let (_handle, mut events) = connection(&broker);
    wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;

    broker.push_inbound(json!({
        "type": "action",
        "ddid": "D9",
        "data": {"actions": [{"name": "setOff", "parameters": {}}]},
    }));
    let event =
        wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Action { .. })).await;
    match event {
        ConnectionEvent::Action { ddid, actions } => {
            assert_eq!(ddid, "D9");
            assert_eq!(actions.len(), 1);
            assert_eq!(actions[0].name, "setOff");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn close_shuts_the_actor_down() {
    let broker = MockBroker::new();
    let (handle, _events) = connection(&broker);
    wait_until("initial connect", || async { broker.connects() >= 1 }).await;

    handle.close().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.send(telemetry(1)).is_err());
}

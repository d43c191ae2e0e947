mod common;

use bravia_quad::{BraviaClient, BraviaError, Input, PollTarget, SessionState};
use common::{connected, test_config, wait_until, Action, MockDevice, Soundbar};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;

#[tokio::test]
async fn set_then_get_returns_acked_value() {
    let bar = Soundbar::new(true, 0);
    let device = MockDevice::start(bar.script()).await;
    let client = connected(&device, test_config()).await;

    let cases = [
        ("main.power", json!("on")),
        ("main.volumestep", json!(35)),
        ("main.input", json!("hdmi1")),
        ("audio.voiceenhancer", json!("upon")),
    ];
    for (feature, value) in cases {
        let reply = client.set_value(feature, value.clone()).await.unwrap();
        assert_eq!(reply, json!("ACK"));
        assert_eq!(client.current_value(feature), Some(value.clone()));
        assert_eq!(client.get_value(feature).await.unwrap(), value);
    }
}

#[tokio::test]
async fn requests_go_out_as_json_lines() {
    let bar = Soundbar::new(true, 0);
    let device = MockDevice::start(bar.script()).await;
    let client = connected(&device, test_config()).await;

    client.get_value("main.power").await.unwrap();
    client.set_volume(12).await.unwrap();

    let requests = device.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["type"], "get");
    assert_eq!(requests[0]["feature"], "main.power");
    assert!(requests[0].get("value").is_none());
    assert_eq!(requests[1]["type"], "set");
    assert_eq!(requests[1]["value"], 12);

    let first = requests[0]["id"].as_u64().unwrap();
    let second = requests[1]["id"].as_u64().unwrap();
    assert!(first >= 10);
    assert_ne!(first, second);
}

#[tokio::test]
async fn out_of_order_results_are_not_cross_assigned() {
    let device = MockDevice::start(|request| match request["feature"].as_str() {
        Some("main.power") => Action::Delayed(Duration::from_millis(200), json!("on")),
        _ => Action::Reply(json!(42)),
    })
    .await;
    let client = connected(&device, test_config()).await;

    let (power, volume) = tokio::join!(
        client.get_value("main.power"),
        client.get_value("main.volumestep"),
    );

    assert_eq!(power.unwrap(), json!("on"));
    assert_eq!(volume.unwrap(), json!(42));
    assert_eq!(device.requests()[0]["feature"], "main.power");
}

#[tokio::test]
async fn timeout_on_one_request_does_not_delay_another() {
    let device = MockDevice::start(|request| match request["feature"].as_str() {
        Some("audio.aav") => Action::Ignore,
        _ => Action::Delayed(Duration::from_millis(50), json!("on")),
    })
    .await;
    let client = connected(
        &device,
        test_config().with_request_timeout(Duration::from_millis(300)),
    )
    .await;

    let start = Instant::now();
    let (slow, fast) = tokio::join!(client.get_value("audio.aav"), async {
        let value = client.get_value("main.power").await;
        (value, start.elapsed())
    });

    assert!(matches!(slow, Err(BraviaError::Timeout { ref feature }) if feature == "audio.aav"));
    let (value, elapsed) = fast;
    assert_eq!(value.unwrap(), json!("on"));
    assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn disconnect_fails_every_outstanding_request() {
    let device = MockDevice::start(|_| Action::Ignore).await;
    let config = test_config()
        .with_request_timeout(Duration::from_secs(10))
        .with_reconnect_backoff(Duration::from_secs(5), Duration::from_secs(5));
    let client = connected(&device, config).await;
    let mut stale = client.watch_stale();
    assert!(!*stale.borrow_and_update());

    let tasks: Vec<_> = ["main.power", "main.volumestep", "main.input"]
        .into_iter()
        .map(|feature| {
            let client = client.clone();
            tokio::spawn(async move { client.get_value(feature).await })
        })
        .collect();

    wait_until(|| device.requests().len() == 3).await;
    assert_eq!(client.pending_requests(), 3);
    device.drop_connections();

    for task in tasks {
        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(BraviaError::ConnectionLost)));
    }
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_stale());
    assert!(stale.has_changed().unwrap());
}

#[tokio::test]
async fn notification_reaches_listener_once_and_updates_cache() {
    let device = MockDevice::start(|_| Action::Ignore).await;
    let client = connected(&device, test_config()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_listener = seen.clone();
    client.on_change("main.power", move |value| {
        seen_by_listener.lock().unwrap().push(value.clone());
    });
    let mut changes = client.subscribe_changes();

    device.notify("main.power", json!("on"));

    let change = timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.feature, "main.power");
    assert_eq!(change.value, json!("on"));
    assert_eq!(*seen.lock().unwrap(), vec![json!("on")]);
    assert_eq!(client.current_value("main.power"), Some(json!("on")));
    assert!(client.cached_value("main.power").is_some());
}

#[tokio::test]
async fn removed_listener_is_not_called() {
    let device = MockDevice::start(|_| Action::Ignore).await;
    let client = connected(&device, test_config()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let id = client.on_change("main.volumestep", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(client.remove_listener(id));
    let mut changes = client.subscribe_changes();

    device.notify("main.volumestep", json!(30));

    timeout(Duration::from_secs(1), changes.recv()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.current_value("main.volumestep"), Some(json!(30)));
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let device = MockDevice::start(|_| Action::Reply(json!("off"))).await;
    let client = connected(&device, test_config()).await;
    let mut changes = client.subscribe_changes();

    device.push_line(r#"{"type":"notify"}"#);
    device.push_line("this is not json");
    device.push_line(r#"{"feature":"main.power","type":"notify","value":"on"}{"feature":"main.input","type":"notify","value":"hdmi1"}"#);

    let first = timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((first.feature.as_str(), first.value), ("main.power", json!("on")));
    assert_eq!((second.feature.as_str(), second.value), ("main.input", json!("hdmi1")));

    assert_eq!(client.current_state(), SessionState::Connected);
    assert_eq!(client.get_value("main.power").await.unwrap(), json!("off"));
}

#[tokio::test]
async fn poller_recovers_after_a_timed_out_tick() {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    let device = MockDevice::start(move |request| {
        if request["feature"] == "audio.drangecomp" && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Action::Ignore
        } else {
            Action::Reply(json!("on"))
        }
    })
    .await;
    let config = test_config()
        .with_request_timeout(Duration::from_millis(150))
        .with_poll_targets(vec![PollTarget::new(
            "audio.drangecomp",
            Duration::from_millis(100),
        )]);

    let client = BraviaClient::new(config);
    let mut changes = client.subscribe_changes();
    client.connect(&device.address()).await.unwrap();

    let change = timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.feature, "audio.drangecomp");
    assert_eq!(change.value, json!("on"));
    assert!(polls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn reconnect_refreshes_subscribed_features() {
    let bar = Soundbar::new(true, 0);
    let device = MockDevice::start(bar.script()).await;
    let client = connected(&device, test_config()).await;

    client.on_change("main.power", |_| {});
    client.on_change("bluetooth.mode", |_| {});
    let mut changes = client.subscribe_changes();

    device.drop_connections();
    wait_until(|| device.connections() == 2).await;

    let change = timeout(Duration::from_secs(2), async {
        loop {
            let change = changes.recv().await.unwrap();
            if change.feature == "main.power" {
                break change;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(change.value, json!("off"));
    assert_eq!(client.current_state(), SessionState::Connected);
    assert!(!client.is_stale());
    assert!(device.requests_for("bluetooth.mode").is_empty());
}

#[tokio::test]
async fn closed_client_fails_fast() {
    let bar = Soundbar::new(true, 0);
    let device = MockDevice::start(bar.script()).await;
    let client = connected(&device, test_config()).await;
    client.get_value("main.power").await.unwrap();

    client.close().await;

    assert_eq!(client.current_state(), SessionState::Disconnected);
    assert_eq!(client.current_value("main.power"), None);
    let start = Instant::now();
    let err = client.get_value("main.power").await.unwrap_err();
    assert!(matches!(err, BraviaError::NotConnected));
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn refused_connection_reports_connect_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = BraviaClient::new(test_config());
    let err = client.connect(&address).await.unwrap_err();
    assert!(matches!(err, BraviaError::Connect { .. }));
    assert_eq!(client.current_state(), SessionState::Disconnected);
}

#[tokio::test]
async fn ramp_volume_steps_one_level_at_a_time() {
    let bar = Soundbar::new(true, 0);
    let device = MockDevice::start(bar.script()).await;
    let client = connected(&device, test_config()).await;

    client
        .ramp_volume(23, Duration::from_millis(10))
        .await
        .unwrap();

    let steps: Vec<_> = device
        .requests_for("main.volumestep")
        .into_iter()
        .filter(|r| r["type"] == "set")
        .map(|r| r["value"].clone())
        .collect();
    assert_eq!(steps, vec![json!(21), json!(22), json!(23)]);
    assert_eq!(bar.value("main.volumestep"), Some(json!(23)));
}

#[tokio::test]
async fn typed_setters_check_ranges_locally() {
    let bar = Soundbar::new(true, 0);
    let device = MockDevice::start(bar.script()).await;
    let client = connected(&device, test_config()).await;

    assert!(matches!(
        client.set_volume(101).await,
        Err(BraviaError::OutOfRange { value: 101, .. })
    ));
    assert!(matches!(
        client.set_rear_level(-11).await,
        Err(BraviaError::OutOfRange { min: -10, max: 10, .. })
    ));
    assert!(device.requests().is_empty());

    client.set_power(true).await.unwrap();
    client.set_voice_enhancer(true).await.unwrap();
    assert_eq!(bar.value("main.power"), Some(json!("on")));
    assert_eq!(bar.value("audio.voiceenhancer"), Some(json!("upon")));
}

#[tokio::test]
async fn bluetooth_pairing_switches_input_and_cycles_mode() {
    let bar = Soundbar::new(true, 0);
    let device = MockDevice::start(bar.script()).await;
    let client = connected(&device, test_config()).await;

    client.start_bluetooth_pairing().await.unwrap();

    assert_eq!(bar.value("main.input"), Some(json!(Input::Bluetooth.as_str())));
    let modes: Vec<_> = device
        .requests_for("bluetooth.mode")
        .into_iter()
        .map(|r| r["value"].clone())
        .collect();
    assert_eq!(modes, vec![json!("Off"), json!("RX")]);
}

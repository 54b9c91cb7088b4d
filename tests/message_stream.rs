use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

mod common;
use common::{
    event_json, is_heartbeat, open_stream, spawn_bridge, text_packet, MockDriver, SseReader,
};

#[tokio::test]
async fn stream_starts_with_connected_event_then_relays_text() {
    let driver = MockDriver::new();
    driver.add_node(0xbeef, "Ridge Relay", "RR");
    let bridge = spawn_bridge(driver, Duration::from_secs(30)).await;
    let mut stream = open_stream(&bridge).await;

    bridge
        .driver
        .inject(&text_packet("!0000beef", "!0a0b0c0d", 0, "direct hello"));
    let block = stream
        .next_event_within(Duration::from_secs(2))
        .await
        .expect("message event");
    let msg = event_json(&block).expect("json data");
    assert_eq!(msg["type"], "text");
    assert_eq!(msg["from"], "!0000beef");
    assert_eq!(msg["fromName"], "Ridge Relay");
    assert_eq!(msg["to"], "!0a0b0c0d");
    assert_eq!(msg["text"], "direct hello");
    assert_eq!(msg["timestamp"], 1_700_000_500);
    assert_eq!(msg["channel"], 0);
    assert_eq!(msg["isDirect"], true);
}

#[tokio::test]
async fn silent_stream_heartbeats_then_resumes() {
    let bridge = spawn_bridge(MockDriver::new(), Duration::from_millis(200)).await;
    let mut stream = open_stream(&bridge).await;

    let block = stream
        .next_event_within(Duration::from_secs(2))
        .await
        .expect("heartbeat");
    assert!(is_heartbeat(&block), "expected heartbeat, got {:?}", block);

    bridge
        .driver
        .inject(&text_packet("!00000001", "^all", 1, "after the quiet"));
    let deadline = Instant::now() + Duration::from_secs(2);
    let msg = loop {
        let block = tokio::time::timeout_at(deadline, stream.next_event())
            .await
            .expect("message before deadline")
            .expect("stream open");
        if is_heartbeat(&block) {
            continue;
        }
        break event_json(&block).expect("json data");
    };
    assert_eq!(msg["text"], "after the quiet");
    assert_eq!(msg["isDirect"], false);
}

#[tokio::test]
async fn non_text_packets_never_reach_clients() {
    let bridge = spawn_bridge(MockDriver::new(), Duration::from_millis(100)).await;
    let mut stream = open_stream(&bridge).await;

    let mut telemetry = text_packet("!00000001", "^all", 0, "\u{8}\u{1}");
    if let Some(decoded) = telemetry.decoded.as_mut() {
        decoded.portnum = meshbridge::protobuf::PortNum::TelemetryApp as i32;
    }
    bridge.driver.inject(&telemetry);
    assert!(bridge.relay.is_empty());

    let block = stream
        .next_event_within(Duration::from_secs(1))
        .await
        .expect("event");
    assert!(is_heartbeat(&block));
}

async fn collect_texts(mut stream: SseReader, window: Duration) -> Vec<String> {
    let deadline = Instant::now() + window;
    let mut texts = Vec::new();
    while let Ok(Some(block)) = tokio::time::timeout_at(deadline, stream.next_event()).await {
        if let Some(msg) = event_json(&block) {
            if let Some(text) = msg["text"].as_str() {
                texts.push(text.to_string());
            }
        }
    }
    texts
}

#[tokio::test]
async fn concurrent_streams_share_one_drain() {
    let bridge = spawn_bridge(MockDriver::new(), Duration::from_millis(100)).await;
    let first = open_stream(&bridge).await;
    let second = open_stream(&bridge).await;

    let a = tokio::spawn(collect_texts(first, Duration::from_millis(1500)));
    let b = tokio::spawn(collect_texts(second, Duration::from_millis(1500)));

    // make sure the session exists before injecting
    assert!(bridge.supervisor.status().connected);
    for n in 0..20 {
        bridge
            .driver
            .inject(&text_packet("!00000001", "^all", 0, &format!("m{}", n)));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let a = a.await.unwrap();
    let b = b.await.unwrap();
    let seen_a: HashSet<_> = a.iter().cloned().collect();
    let seen_b: HashSet<_> = b.iter().cloned().collect();
    assert!(
        seen_a.is_disjoint(&seen_b),
        "a message reached both streams: a={:?} b={:?}",
        a,
        b
    );
    let all: HashSet<_> = seen_a.union(&seen_b).cloned().collect();
    let expected: HashSet<_> = (0..20).map(|n| format!("m{}", n)).collect();
    assert_eq!(all, expected);
}

#[tokio::test]
async fn shutdown_signal_ends_open_streams() {
    let bridge = spawn_bridge(MockDriver::new(), Duration::from_secs(30)).await;
    let mut stream = open_stream(&bridge).await;

    bridge.shutdown.send(true).unwrap();
    let end = tokio::time::timeout(Duration::from_secs(2), stream.next_event())
        .await
        .expect("stream closed before the heartbeat interval");
    assert!(end.is_none(), "stream should close, got {:?}", end);

    let served = tokio::time::timeout(Duration::from_secs(2), bridge.server)
        .await
        .expect("server stopped")
        .unwrap();
    assert!(served.is_ok());
}

#[tokio::test]
async fn stream_is_unavailable_when_device_is() {
    let driver = MockDriver::new();
    driver.fail_opens(1);
    let bridge = spawn_bridge(driver, Duration::from_secs(30)).await;
    let resp = reqwest::get(bridge.url("/messages")).await.unwrap();
    assert_eq!(resp.status(), 503);
}

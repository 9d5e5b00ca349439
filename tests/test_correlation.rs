//! Command/response correlation tests
//!
//! Drive the bridge through a mock link whose replies arrive as soon as a
//! command is published, and check what the caller gets back and what
//! happens to the reply-topic subscription afterwards.


use iotbridge::testing::MockLink;
use iotbridge::transport::InboundMessage;
use iotbridge::{Bridge, BridgeError, Resolution};
use serde_json::json;
use std::time::{Duration, Instant};
use test_helpers::*;

async fn wait_for_holders(bridge: &Bridge, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while bridge
        .correlator()
        .subscriptions()
        .holders(RESPONSE_TOPIC)
        .await
        != expected
    {
        assert!(
            Instant::now() < deadline,
            "expected {expected} holders of {RESPONSE_TOPIC}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn count(calls: &[String], topic: &str) -> usize {
    calls.iter().filter(|t| t.as_str() == topic).count()
}

#[tokio::test]
async fn test_allow_listed_response_is_returned() {
    let link = MockLink::replying(
        COMMAND_TOPIC,
        RESPONSE_TOPIC,
        json!({"command_id": "CMD00011", "status": "ok"}),
    );
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let data = bridge.send_command(&control_device_body()).await.unwrap();

    assert_eq!(data, Some(json!({"command_id": "CMD00011", "status": "ok"})));
    assert_eq!(
        link.published_json(COMMAND_TOPIC).await,
        vec![control_device_body()]
    );
}

#[tokio::test]
async fn test_reply_topic_released_after_response() {
    let link = MockLink::replying(
        COMMAND_TOPIC,
        RESPONSE_TOPIC,
        json!({"command_id": "CMD00021"}),
    );
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    bridge.send_command(&control_device_body()).await.unwrap();

    assert_eq!(count(&link.subscribe_calls().await, RESPONSE_TOPIC), 1);
    assert_eq!(count(&link.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
    assert!(!link
        .active_subscriptions()
        .await
        .contains(&RESPONSE_TOPIC.to_string()));
    assert_eq!(
        bridge
            .correlator()
            .subscriptions()
            .holders(RESPONSE_TOPIC)
            .await,
        0
    );
}

#[tokio::test]
async fn test_first_reply_decides_even_when_unmatched() {
    let link = MockLink::with_responder(|topic, _| {
        if topic != COMMAND_TOPIC {
            return Vec::new();
        }
        vec![
            InboundMessage::new(RESPONSE_TOPIC, r#"{"command_id":"CMD00010"}"#),
            InboundMessage::new(RESPONSE_TOPIC, r#"{"command_id":"CMD00011"}"#),
        ]
    });
    let (bridge, _) = test_bridge(link);
    bridge.connect().await.unwrap();

    let data = bridge.send_command(&control_device_body()).await.unwrap();
    assert_eq!(data, None);
}

#[tokio::test]
async fn test_messages_on_other_topics_are_ignored() {
    let link = MockLink::with_responder(|topic, _| {
        if topic != COMMAND_TOPIC {
            return Vec::new();
        }
        vec![
            InboundMessage::new(TELEMETRY_TOPIC, r#"{"command_id":"CMD00010"}"#),
            InboundMessage::new(RESPONSE_TOPIC, r#"{"command_id":"CMD00031"}"#),
        ]
    });
    let (bridge, _) = test_bridge(link);
    bridge.connect().await.unwrap();

    let data = bridge.send_command(&control_device_body()).await.unwrap();
    assert_eq!(data, Some(json!({"command_id": "CMD00031"})));
}

#[tokio::test]
async fn test_invalid_reply_resolves_without_data() {
    let link = MockLink::with_responder(|topic, _| {
        if topic == COMMAND_TOPIC {
            vec![InboundMessage::new(RESPONSE_TOPIC, "definitely not json")]
        } else {
            Vec::new()
        }
    });
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let data = bridge.send_command(&control_device_body()).await.unwrap();

    assert_eq!(data, None);
    assert_eq!(count(&link.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
}

#[tokio::test]
async fn test_timeout_resolves_without_data() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let started = Instant::now();
    let data = bridge.send_command(&control_device_body()).await.unwrap();

    assert_eq!(data, None);
    assert!(started.elapsed() >= bridge.correlator().response_timeout());
    assert_eq!(count(&link.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
}

#[tokio::test]
async fn test_wait_for_response_times_out() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link);

    let resolution = bridge
        .correlator()
        .wait_for_response(RESPONSE_TOPIC, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::TimedOut);
}

#[tokio::test]
async fn test_telemetry_never_waits() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let started = Instant::now();
    bridge.publish_telemetry(&telemetry_body()).await.unwrap();

    assert!(started.elapsed() < bridge.correlator().response_timeout());
    assert_eq!(count(&link.subscribe_calls().await, RESPONSE_TOPIC), 0);
    assert_eq!(
        link.published_json(TELEMETRY_TOPIC).await,
        vec![telemetry_body()]
    );
}

#[tokio::test]
async fn test_concurrent_waiters_share_one_subscription() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let bridge = bridge.clone();
        waiters.push(tokio::spawn(async move {
            bridge
                .correlator()
                .wait_for_response(RESPONSE_TOPIC, Duration::from_secs(2))
                .await
        }));
    }
    wait_for_holders(&bridge, 2).await;

    assert_eq!(
        link.inject(RESPONSE_TOPIC, r#"{"command_id":"CMD00011"}"#),
        2
    );

    for waiter in waiters {
        let resolution = waiter.await.unwrap().unwrap();
        assert_eq!(resolution, Resolution::Matched(json!({"command_id": "CMD00011"})));
    }

    assert_eq!(count(&link.subscribe_calls().await, RESPONSE_TOPIC), 1);
    assert_eq!(count(&link.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
    wait_for_holders(&bridge, 0).await;
}

#[tokio::test]
async fn test_closed_connection_ends_the_wait() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let waiter = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge
                .correlator()
                .wait_for_response(RESPONSE_TOPIC, Duration::from_secs(5))
                .await
        })
    };
    wait_for_holders(&bridge, 1).await;
    link.close_inbound();

    let resolution = waiter.await.unwrap().unwrap();
    assert_eq!(resolution, Resolution::ConnectionClosed);
    assert_eq!(count(&link.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
}

#[tokio::test]
async fn test_publish_failure_releases_subscription() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();
    link.set_fail_publish(true);

    let result = bridge.send_command(&control_device_body()).await;

    assert!(matches!(result, Err(BridgeError::PublishFailed(_))));
    assert_eq!(count(&link.subscribe_calls().await, RESPONSE_TOPIC), 1);
    assert_eq!(count(&link.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
    wait_for_holders(&bridge, 0).await;
}

#[tokio::test]
async fn test_cancelled_request_releases_subscription() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let waiter = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge
                .correlator()
                .wait_for_response(RESPONSE_TOPIC, Duration::from_secs(30))
                .await
        })
    };
    wait_for_holders(&bridge, 1).await;

    waiter.abort();
    let _ = waiter.await;

    wait_for_holders(&bridge, 0).await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while count(&link.unsubscribe_calls().await, RESPONSE_TOPIC) == 0 {
        assert!(Instant::now() < deadline, "reply topic never unsubscribed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_command_publish_connects_on_demand() {
    let link = MockLink::replying(
        COMMAND_TOPIC,
        RESPONSE_TOPIC,
        json!({"command_id": "CMD00011"}),
    );
    let (bridge, connector) = test_bridge(link);

    let data = bridge.send_command(&control_device_body()).await.unwrap();

    assert!(data.is_some());
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test]
async fn test_invalid_command_is_not_published() {
    let link = MockLink::new();
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    let result = bridge
        .send_command(&json!({"command_name": "CONTROL_DEVICE"}))
        .await;

    assert!(matches!(result, Err(BridgeError::MissingRequiredFields)));
    assert!(link.published_json(COMMAND_TOPIC).await.is_empty());
    assert_eq!(count(&link.subscribe_calls().await, RESPONSE_TOPIC), 0);
}

#[tokio::test]
async fn test_custom_response_ids() {
    let mut config = test_config();
    config.correlation.response_ids = vec!["ACK".to_string()];
    let link = MockLink::replying(COMMAND_TOPIC, RESPONSE_TOPIC, json!({"command_id": "ACK"}));
    let (bridge, _) = test_bridge_with_config(&config, link);

    let data = bridge.send_command(&control_device_body()).await.unwrap();
    assert_eq!(data, Some(json!({"command_id": "ACK"})));
}

#[tokio::test]
async fn test_waiters_are_independent_per_request() {
    let link = MockLink::replying(
        COMMAND_TOPIC,
        RESPONSE_TOPIC,
        json!({"command_id": "CMD00011"}),
    );
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();

    for _ in 0..3 {
        let data = bridge.send_command(&control_device_body()).await.unwrap();
        assert!(data.is_some());
    }

    assert_eq!(count(&link.subscribe_calls().await, RESPONSE_TOPIC), 3);
    assert_eq!(count(&link.unsubscribe_calls().await, RESPONSE_TOPIC), 3);
}

#[tokio::test]
async fn test_reconnect_subscribes_reply_topic_on_new_link() {
    let first = MockLink::new();
    let (bridge, connector) = test_bridge(first.clone());
    bridge.connect().await.unwrap();

    // A wait still pending on the first link when the connection is replaced
    let stale_waiter = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge
                .correlator()
                .wait_for_response(RESPONSE_TOPIC, Duration::from_secs(5))
                .await
        })
    };
    wait_for_holders(&bridge, 1).await;

    bridge.disconnect().await.unwrap();
    let second = MockLink::replying(
        COMMAND_TOPIC,
        RESPONSE_TOPIC,
        json!({"command_id": "CMD00011"}),
    );
    connector.replace_link(second.clone());
    bridge.connect().await.unwrap();

    let data = bridge.send_command(&control_device_body()).await.unwrap();

    assert_eq!(data, Some(json!({"command_id": "CMD00011"})));
    assert_eq!(count(&second.subscribe_calls().await, RESPONSE_TOPIC), 1);
    assert_eq!(count(&second.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
    assert!(first.unsubscribe_calls().await.is_empty());

    first.close_inbound();
    let resolution = stale_waiter.await.unwrap().unwrap();
    assert_eq!(resolution, Resolution::ConnectionClosed);

    wait_for_holders(&bridge, 0).await;
    assert_eq!(count(&first.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
    assert_eq!(count(&second.unsubscribe_calls().await, RESPONSE_TOPIC), 1);
}

#[tokio::test]
async fn test_explicit_subscription_survives_command() {
    let link = MockLink::replying(
        COMMAND_TOPIC,
        RESPONSE_TOPIC,
        json!({"command_id": "CMD00021"}),
    );
    let (bridge, _) = test_bridge(link.clone());
    bridge.connect().await.unwrap();
    bridge.subscribe(Some(RESPONSE_TOPIC)).await.unwrap();
    link.clear_history().await;

    for _ in 0..2 {
        let data = bridge.send_command(&control_device_body()).await.unwrap();
        assert_eq!(data, Some(json!({"command_id": "CMD00021"})));
    }

    assert!(link.subscribe_calls().await.is_empty());
    assert!(link.unsubscribe_calls().await.is_empty());
    assert!(link
        .active_subscriptions()
        .await
        .contains(&RESPONSE_TOPIC.to_string()));
    wait_for_holders(&bridge, 0).await;
}

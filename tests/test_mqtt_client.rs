//! MQTT client tests against a local fake broker
//!
//! These exercise the real `rumqttc` event loop end to end: handshake,
//! token resolution per QoS level, observer callbacks, connection loss and
//! teardown.


use mqtt_integration_helpers::{
    fake_broker_config, FakeBroker, FakeBrokerOptions, Observed, RecordingObserver,
};
use mqtt_loadpub::error::{ConnectionError, PublishError};
use mqtt_loadpub::observer::DeliveryListener;
use mqtt_loadpub::publisher::{DeliveryPolicy, LoopState, PublishLoop, PublishSettings};
use mqtt_loadpub::transport::mqtt::{ConnectionState, MqttClient};
use mqtt_loadpub::transport::{Message, QosLevel, Transport};
use rumqttc::ConnectReturnCode;
use std::sync::Arc;
use std::time::Duration;

fn will() -> Message {
    Message::new("TestTopic", "This is my last will", QosLevel::ExactlyOnce, false)
}

fn message(i: u64, qos: QosLevel) -> Message {
    Message::new("TestTopic", format!("Sending message {i}"), qos, true)
}

#[tokio::test]
async fn test_connect_registers_will_and_clean_session() {
    let broker = FakeBroker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let persist_dir = dir.path().join("persist");
    let config = fake_broker_config(&broker, &persist_dir)
        .will(will())
        .build()
        .unwrap();

    let mut client = MqttClient::connect_with(config, RecordingObserver::new())
        .await
        .unwrap();

    assert!(client.is_connected());
    assert!(persist_dir.is_dir());

    let connects = broker.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].client_id, "loadpub-test-client");
    assert!(connects[0].clean_session);
    let registered = connects[0].will.clone().unwrap();
    assert_eq!(registered.topic, "TestTopic");
    assert_eq!(registered.payload, b"This is my last will");
    assert_eq!(registered.qos, 2);
    assert!(!registered.retain);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_qos1_token_resolves_on_puback() {
    let broker = FakeBroker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let observer = RecordingObserver::new();
    let config = fake_broker_config(&broker, dir.path()).build().unwrap();
    let mut client = MqttClient::connect_with(config, observer.clone()).await.unwrap();

    let listener = Arc::new(DeliveryListener::new());
    let mut token = client
        .publish_with_listener(message(0, QosLevel::AtLeastOnce), Some(listener.clone()))
        .await
        .unwrap();

    let message_id = tokio::time::timeout(Duration::from_secs(5), token.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(message_id, Some(1));
    assert!(listener.succeeded());
    assert!(observer
        .events()
        .contains(&Observed::DeliveryComplete(Some(1))));

    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].payload, b"Sending message 0");
    assert_eq!(publishes[0].qos, 1);
    assert!(publishes[0].retain);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_qos2_token_resolves_after_full_handshake() {
    let broker = FakeBroker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = fake_broker_config(&broker, dir.path()).build().unwrap();
    let mut client = MqttClient::connect_with(config, RecordingObserver::new())
        .await
        .unwrap();

    for i in 0..3 {
        let mut token = client
            .publish(message(i, QosLevel::ExactlyOnce))
            .await
            .unwrap();
        let message_id = tokio::time::timeout(Duration::from_secs(5), token.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(message_id.is_some());
    }

    // One PUBREL per message proves PUBREC was answered before PUBCOMP resolved the token.
    assert_eq!(broker.pubrels().len(), 3);
    assert_eq!(client.pending_deliveries(), 0);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_qos0_token_resolves_without_message_id() {
    let broker = FakeBroker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let observer = RecordingObserver::new();
    let config = fake_broker_config(&broker, dir.path()).build().unwrap();
    let mut client = MqttClient::connect_with(config, observer.clone()).await.unwrap();

    let mut token = client.publish(message(0, QosLevel::AtMostOnce)).await.unwrap();
    let message_id = tokio::time::timeout(Duration::from_secs(5), token.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(message_id, None);
    assert!(observer.events().contains(&Observed::DeliveryComplete(None)));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_refused_connack_fails_connect() {
    let broker = FakeBroker::start_with(FakeBrokerOptions {
        connack: ConnectReturnCode::NotAuthorized,
        ..Default::default()
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let config = fake_broker_config(&broker, dir.path()).build().unwrap();
    let mut client = MqttClient::new(config, RecordingObserver::new());

    let result = client.connect().await;

    assert!(
        matches!(&result, Err(ConnectionError::Refused(reason)) if reason == "not authorized"),
        "unexpected result: {result:?}"
    );
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_disconnect_writes_disconnect_packet() {
    let broker = FakeBroker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = fake_broker_config(&broker, dir.path()).build().unwrap();
    let mut client = MqttClient::connect_with(config, RecordingObserver::new())
        .await
        .unwrap();

    client.disconnect().await.unwrap();

    assert!(broker.wait_until(Duration::from_secs(2), |b| b.disconnects() == 1).await);
    assert!(matches!(
        client.connection_state(),
        Some(ConnectionState::Disconnected(_))
    ));

    let result = client.publish(message(0, QosLevel::AtLeastOnce)).await;
    assert!(matches!(result, Err(PublishError::NotConnected { .. })));
}

#[tokio::test]
async fn test_lost_connection_fails_pending_tokens_without_reconnect() {
    let broker = FakeBroker::start_with(FakeBrokerOptions {
        drop_first_connection_after: Some(1),
        ..Default::default()
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let observer = RecordingObserver::new();
    let config = fake_broker_config(&broker, dir.path())
        .automatic_reconnect(false)
        .build()
        .unwrap();
    let mut client = MqttClient::connect_with(config, observer.clone()).await.unwrap();

    let listener = Arc::new(DeliveryListener::new());
    let mut token = client
        .publish_with_listener(message(0, QosLevel::AtLeastOnce), Some(listener.clone()))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), token.wait())
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(PublishError::Failed {
            message_id: Some(1),
            ..
        })
    ));
    assert!(listener.is_done());
    assert!(!listener.succeeded());
    assert_eq!(observer.connections_lost(), 1);
    assert!(!client.is_connected());

    // The event loop already stopped; disconnect is a no-op.
    assert!(client.disconnect().await.is_ok());
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_automatic_reconnect_after_connection_loss() {
    let broker = FakeBroker::start_with(FakeBrokerOptions {
        drop_first_connection_after: Some(1),
        ..Default::default()
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let observer = RecordingObserver::new();
    let config = fake_broker_config(&broker, dir.path())
        .automatic_reconnect(true)
        .build()
        .unwrap();
    let mut client = MqttClient::connect_with(config, observer.clone()).await.unwrap();

    client.publish(message(0, QosLevel::AtMostOnce)).await.unwrap();

    assert!(broker.wait_until(Duration::from_secs(5), |b| b.connects().len() >= 2).await);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !client.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(client.is_connected());
    assert_eq!(observer.connections_lost(), 1);

    let mut token = client.publish(message(1, QosLevel::AtLeastOnce)).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), token.wait())
        .await
        .unwrap();
    assert!(result.is_ok());

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publishing_continues_across_reconnect() {
    let broker = FakeBroker::start_with(FakeBrokerOptions {
        drop_first_connection_after: Some(1),
        ..Default::default()
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let observer = RecordingObserver::new();
    let config = fake_broker_config(&broker, dir.path())
        .automatic_reconnect(true)
        .build()
        .unwrap();
    let mut client = MqttClient::connect_with(config, observer.clone()).await.unwrap();

    let mut tokens = Vec::new();
    for i in 0..10 {
        let token = client
            .publish(message(i, QosLevel::AtLeastOnce))
            .await
            .expect("publish accepted while the session is restored");
        tokens.push(token);
        assert!(!matches!(
            client.connection_state(),
            Some(ConnectionState::Disconnected(_))
        ));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut message_ids = Vec::new();
    for token in &mut tokens {
        let message_id = tokio::time::timeout(Duration::from_secs(5), token.wait())
            .await
            .unwrap()
            .unwrap();
        message_ids.push(message_id);
    }

    // The first message went out again after the reconnect under its own id.
    assert_eq!(message_ids, (1..=10).map(Some).collect::<Vec<_>>());
    assert_eq!(observer.connections_lost(), 1);
    assert_eq!(client.pending_deliveries(), 0);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_drop_without_disconnect_is_unclean() {
    let broker = FakeBroker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = fake_broker_config(&broker, dir.path())
        .will(will())
        .build()
        .unwrap();
    let client = MqttClient::connect_with(config, RecordingObserver::new())
        .await
        .unwrap();

    drop(client);

    assert!(broker.wait_until(Duration::from_secs(2), |b| b.unclean_closes() == 1).await);
    assert_eq!(broker.disconnects(), 0);
}

#[tokio::test]
async fn test_publish_loop_over_real_client() {
    let broker = FakeBroker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = fake_broker_config(&broker, dir.path())
        .will(will())
        .build()
        .unwrap();
    let client = MqttClient::new(config, RecordingObserver::new());

    let settings = PublishSettings {
        count: 20,
        interval: Duration::ZERO,
        qos: QosLevel::ExactlyOnce,
        policy: DeliveryPolicy::FireAndForget,
        drain_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let mut publish_loop = PublishLoop::new(client, settings);

    let report = publish_loop.run().await.unwrap();

    assert_eq!(report.submitted, 20);
    assert_eq!(report.confirmed, 20);
    assert_eq!(report.final_state, LoopState::Done);
    assert_eq!(broker.publishes().len(), 20);
    assert!(broker.wait_until(Duration::from_secs(2), |b| b.disconnects() == 1).await);
}

//! Whole-service behavior over the in-memory broker client


use eventbus_service::broker::ConnectionState;
use eventbus_service::service::ServiceLifecycle;
use eventbus_service::supervisor::WorkerState;
use eventbus_service::testing::MockBrokerClient;
use eventbus_service::workers::{FixedProducer, PUBLISHER, SUBSCRIBER};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{test_config, wait_until};

#[tokio::test]
async fn test_service_publishes_and_receives_its_own_history() {
    let client = Arc::new(MockBrokerClient::new());
    let mut service = ServiceLifecycle::new(test_config(), client.clone())
        .with_producer(Arc::new(FixedProducer::from_json(json!({"value[degC]": 20.5}))));

    service.start().await.unwrap();

    let mock = client.clone();
    wait_until("history published", move || {
        let mock = mock.clone();
        async move { mock.published_to("history/test-service").await.len() >= 2 }
    })
    .await;

    assert_eq!(client.active_patterns().await, vec!["history/#"]);
    let published = client.published_to("history/test-service").await;
    let event: Value = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(
        event,
        json!({"key": "test-service", "data": {"value[degC]": 20.5}})
    );

    let report = service.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(client.disconnect_calls().await, 1);
    for name in [PUBLISHER, SUBSCRIBER] {
        assert_eq!(
            service.supervisor().status(name).await.unwrap().state,
            WorkerState::Stopped
        );
    }
}

#[tokio::test]
async fn test_service_recovers_from_broker_restart() {
    let client = Arc::new(MockBrokerClient::new());
    let mut service = ServiceLifecycle::new(test_config(), client.clone());
    service.start().await.unwrap();
    service
        .connection()
        .wait_ready(Duration::from_secs(2))
        .await
        .unwrap();

    client.drop_connection("broker restarted").await;

    let mock = client.clone();
    let connection = service.connection().clone();
    wait_until("reconnected with subscriptions", move || {
        let mock = mock.clone();
        let connection = connection.clone();
        async move {
            connection.is_connected() && mock.active_patterns().await == vec!["history/#"]
        }
    })
    .await;

    // Workers were never restarted
    for status in service.supervisor().statuses().await {
        assert_eq!(status.runs, 1, "{}", status.name);
        assert_eq!(status.state, WorkerState::Running, "{}", status.name);
    }

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_without_broker() {
    let client = Arc::new(MockBrokerClient::new());
    client.fail_next_connects(usize::MAX).await;

    let mut service = ServiceLifecycle::new(test_config(), client.clone());
    service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(service.connection().state(), ConnectionState::Connecting);

    let report = service.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(service.connection().state(), ConnectionState::Disconnected);
    assert!(client.published().await.is_empty());
}

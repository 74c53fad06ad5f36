//! Publisher and subscriber running under the supervisor over a loopback broker


use eventbus_service::routing::{HandlerError, HandlerFn, Message};
use eventbus_service::supervisor::{TaskSupervisor, WorkerOptions, WorkerState};
use eventbus_service::workers::{FixedProducer, PublishingWorker, SubscribingWorker};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{mock_connection, test_config, wait_until};

const READY: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_publisher_sends_history_events_on_interval() {
    let (client, connection) = mock_connection();
    connection.connect_and_wait(READY).await.unwrap();

    let mut config = test_config();
    config.name = "sensor".to_string();
    let (_config_tx, config_rx) = config.into_watch();

    let supervisor = TaskSupervisor::new();
    supervisor
        .register(
            "publisher",
            Arc::new(PublishingWorker::new(
                connection.clone(),
                config_rx,
                Arc::new(FixedProducer::from_json(json!({"value": 42}))),
            )),
            WorkerOptions::default(),
        )
        .await
        .unwrap();
    supervisor.start("publisher").await.unwrap();

    let mock = client.clone();
    wait_until("three publishes", move || {
        let mock = mock.clone();
        async move { mock.published_to("history/sensor").await.len() >= 3 }
    })
    .await;

    supervisor.stop("publisher", Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        supervisor.status("publisher").await.unwrap().state,
        WorkerState::Stopped
    );

    for payload in client.published_to("history/sensor").await {
        let event: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(event, json!({"key": "sensor", "data": {"value": 42}}));
    }

    connection.disconnect().await;
}

#[tokio::test]
async fn test_zero_interval_stops_without_publishing() {
    let (client, connection) = mock_connection();
    connection.connect_and_wait(READY).await.unwrap();

    let mut config = test_config();
    config.publish_interval_secs = 0.0;
    let (_config_tx, config_rx) = config.into_watch();

    let supervisor = TaskSupervisor::new();
    supervisor
        .register(
            "publisher",
            Arc::new(PublishingWorker::new(
                connection.clone(),
                config_rx,
                Arc::new(FixedProducer::from_json(json!({"value": 1}))),
            )),
            WorkerOptions::default(),
        )
        .await
        .unwrap();
    supervisor.start("publisher").await.unwrap();

    let mut status = supervisor.watch("publisher").await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == WorkerState::Stopped),
    )
    .await
    .unwrap()
    .unwrap();

    let status = supervisor.status("publisher").await.unwrap();
    assert_eq!(status.last_error, None);
    assert!(client.published().await.is_empty());

    connection.disconnect().await;
}

#[tokio::test]
async fn test_publisher_keeps_running_while_disconnected() {
    let (client, connection) = mock_connection();
    let (_config_tx, config_rx) = test_config().into_watch();

    let supervisor = TaskSupervisor::new();
    supervisor
        .register(
            "publisher",
            Arc::new(PublishingWorker::new(
                connection.clone(),
                config_rx,
                Arc::new(FixedProducer::from_json(json!({"value": 1}))),
            )),
            WorkerOptions::default(),
        )
        .await
        .unwrap();
    supervisor.start("publisher").await.unwrap();

    // Several ticks fail fast with NotConnected
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        supervisor.status("publisher").await.unwrap().state,
        WorkerState::Running
    );
    assert!(client.published().await.is_empty());

    // Publishing resumes once connected, without restarting the worker
    connection.connect_and_wait(READY).await.unwrap();
    let mock = client.clone();
    wait_until("publish after connect", move || {
        let mock = mock.clone();
        async move { !mock.published().await.is_empty() }
    })
    .await;
    assert_eq!(supervisor.status("publisher").await.unwrap().runs, 1);

    supervisor.stop_all(Duration::from_secs(1)).await;
    connection.disconnect().await;
}

#[tokio::test]
async fn test_subscriber_receives_each_message_once() {
    let (_client, connection) = mock_connection();
    let received = Arc::new(Mutex::new(Vec::<(String, Value)>::new()));

    let log = received.clone();
    let handler = HandlerFn::arc(move |message: Message| {
        let decoded = message.json::<Value>();
        let topic = message.topic.clone();
        let log = log.clone();
        async move {
            log.lock().unwrap().push((topic, decoded?));
            Ok::<(), HandlerError>(())
        }
    });

    let supervisor = TaskSupervisor::new();
    supervisor
        .register(
            "subscriber",
            Arc::new(SubscribingWorker::new(
                connection.clone(),
                vec!["history/#".to_string()],
                handler,
            )),
            WorkerOptions::default(),
        )
        .await
        .unwrap();
    supervisor.start("subscriber").await.unwrap();

    let conn = connection.clone();
    wait_until("subscription registered", move || {
        let conn = conn.clone();
        async move { conn.subscriptions().await.len() == 1 }
    })
    .await;
    connection.connect_and_wait(READY).await.unwrap();

    connection
        .publish("history/sensor1", r#"{"a":1}"#)
        .await
        .unwrap();

    let seen = received.clone();
    wait_until("message delivered", move || {
        let seen = seen.clone();
        async move { !seen.lock().unwrap().is_empty() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(
        received.lock().unwrap().clone(),
        vec![("history/sensor1".to_string(), json!({"a": 1}))]
    );

    supervisor.stop_all(Duration::from_secs(1)).await;
    assert!(connection.subscriptions().await.is_empty());
    connection.disconnect().await;
}

//! HTTP surface of a running service


use eventbus_service::http::{routes, HttpState};
use eventbus_service::service::ServiceLifecycle;
use eventbus_service::supervisor::WorkerState;
use eventbus_service::testing::MockBrokerClient;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{test_config, wait_until};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use warp::http::StatusCode;

async fn running_service() -> ServiceLifecycle<MockBrokerClient> {
    let mut config = test_config();
    config.name = "svc".to_string();
    config.publish_interval_secs = 60.0;

    let mut service = ServiceLifecycle::new(config, Arc::new(MockBrokerClient::new()));
    service.start().await.unwrap();
    service
        .connection()
        .wait_ready(Duration::from_secs(2))
        .await
        .unwrap();

    let supervisor = service.supervisor().clone();
    wait_until("workers running", move || {
        let supervisor = supervisor.clone();
        async move {
            supervisor
                .statuses()
                .await
                .iter()
                .all(|s| s.state == WorkerState::Running)
        }
    })
    .await;
    service
}

fn state(service: &ServiceLifecycle<MockBrokerClient>) -> Arc<HttpState<MockBrokerClient>> {
    HttpState::new(
        "svc",
        service.connection().clone(),
        service.supervisor().clone(),
    )
}

#[tokio::test]
async fn test_probes_report_healthy_when_connected() {
    let mut service = running_service().await;
    let filter = routes(state(&service));

    let ready = warp::test::request().path("/svc/ready").reply(&filter).await;
    assert_eq!(ready.status(), StatusCode::OK);

    let health = warp::test::request().path("/svc/health").reply(&filter).await;
    assert_eq!(health.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(health.body()).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connection"], "connected");
    assert_eq!(body["workers"].as_array().unwrap().len(), 2);

    service.shutdown().await.unwrap();

    let ready = warp::test::request().path("/svc/ready").reply(&filter).await;
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_and_api_doc() {
    let mut service = running_service().await;
    let filter = routes(state(&service));

    let metrics = warp::test::request().path("/svc/metrics").reply(&filter).await;
    assert_eq!(metrics.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(metrics.body()).unwrap();
    assert!(body["mqtt"]["connection_attempts"].as_u64().unwrap() >= 1);
    assert!(body["workers"]["starts"].as_u64().unwrap() >= 2);

    let doc = warp::test::request().path("/svc/api/doc").reply(&filter).await;
    let body: Value = serde_json::from_slice(doc.body()).unwrap();
    assert!(body["endpoints"]
        .as_object()
        .unwrap()
        .contains_key("POST /svc/example/endpoint"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_served_over_tcp() {
    let mut service = running_service().await;
    let addr = service.start_http().await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let body = json!({"content": "ping"}).to_string();
    let request = format!(
        "POST /svc/example/endpoint HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with(r#"{"content":"Hi! You said `ping`."}"#), "{response}");

    service.shutdown().await.unwrap();
    assert!(service.http_addr().is_none());
}

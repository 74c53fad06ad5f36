//! Route table and handlers
//!
//! Every route lives under `/{service name}`.

use crate::broker::{BrokerConnection, ConnectionState};
use crate::models::ExampleMessage;
use crate::observability::metrics::metrics;
use crate::supervisor::{TaskSupervisor, WorkerState, WorkerStatus};
use crate::transport::BrokerClient;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Largest accepted request body
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// What the handlers can see of the running service
pub struct HttpState<C: BrokerClient> {
    pub name: String,
    pub connection: Arc<BrokerConnection<C>>,
    pub supervisor: Arc<TaskSupervisor>,
}

impl<C: BrokerClient> HttpState<C> {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<BrokerConnection<C>>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            connection,
            supervisor,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceStatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub connection: String,
    pub workers: Vec<WorkerStatus>,
    pub uptime_seconds: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub connection: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    service: String,
    endpoints: BTreeMap<String, String>,
}

/// Healthy means connected with no failed worker
pub fn is_healthy(connection: &ConnectionState, workers: &[WorkerStatus]) -> bool {
    *connection == ConnectionState::Connected
        && workers.iter().all(|w| w.state != WorkerState::Failed)
}

/// Build the full route table for one service
pub fn routes<C: BrokerClient>(
    state: Arc<HttpState<C>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static {
    let base = warp::path(state.name.clone());

    let echo = base
        .clone()
        .and(warp::path!("example" / "endpoint"))
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and_then(echo);

    let service_status = base
        .clone()
        .and(warp::path!("_service" / "status"))
        .and(warp::get())
        .and_then(service_status);

    let health = base
        .clone()
        .and(warp::path!("health"))
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(health::<C>);

    let ready = base
        .clone()
        .and(warp::path!("ready"))
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(ready::<C>);

    let live = base
        .clone()
        .and(warp::path!("live"))
        .and(warp::get())
        .and_then(live);

    let metrics_route = base
        .clone()
        .and(warp::path!("metrics"))
        .and(warp::get())
        .and_then(metrics_snapshot);

    let api_doc = base
        .and(warp::path!("api" / "doc"))
        .and(warp::get())
        .and(with_state(state))
        .and_then(api_doc::<C>);

    echo.or(service_status)
        .or(health)
        .or(ready)
        .or(live)
        .or(metrics_route)
        .or(api_doc)
        .with(warp::cors().allow_any_origin())
}

fn with_state<C: BrokerClient>(
    state: Arc<HttpState<C>>,
) -> impl Filter<Extract = (Arc<HttpState<C>>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

async fn echo(message: ExampleMessage) -> Result<impl Reply, Infallible> {
    tracing::debug!(content = %message.content, "Echo request");
    Ok(warp::reply::json(&message.reply()))
}

async fn service_status() -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&ServiceStatusResponse { status: "ok" }))
}

async fn health<C: BrokerClient>(state: Arc<HttpState<C>>) -> Result<impl Reply, Infallible> {
    let connection = state.connection.state();
    let workers = state.supervisor.statuses().await;
    let healthy = is_healthy(&connection, &workers);

    let status = HealthStatus {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        service: state.name.clone(),
        connection: connection.to_string(),
        workers,
        uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
        timestamp: timestamp(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&status), code))
}

async fn ready<C: BrokerClient>(state: Arc<HttpState<C>>) -> Result<impl Reply, Infallible> {
    let connection = state.connection.state();
    let ready = connection == ConnectionState::Connected;

    let response = ReadinessResponse {
        ready,
        connection: connection.to_string(),
        timestamp: timestamp(),
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&response), code))
}

async fn live() -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&LivenessResponse {
        alive: true,
        timestamp: timestamp(),
    }))
}

async fn metrics_snapshot() -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&metrics().get_metrics()))
}

async fn api_doc<C: BrokerClient>(state: Arc<HttpState<C>>) -> Result<impl Reply, Infallible> {
    let prefix = format!("/{}", state.name);
    let endpoints = [
        ("POST", "/example/endpoint", "Echo a message"),
        ("GET", "/_service/status", "Static service status"),
        ("GET", "/health", "Connection and worker health"),
        ("GET", "/ready", "Readiness probe, 200 only while connected"),
        ("GET", "/live", "Liveness probe"),
        ("GET", "/metrics", "Metrics snapshot"),
        ("GET", "/api/doc", "This document"),
    ]
    .into_iter()
    .map(|(method, path, what)| (format!("{method} {prefix}{path}"), what.to_string()))
    .collect();

    Ok(warp::reply::json(&ApiDocumentationResponse {
        service: state.name.clone(),
        endpoints,
    }))
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBrokerClient;
    use crate::transport::Endpoint;

    fn state() -> Arc<HttpState<MockBrokerClient>> {
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(MockBrokerClient::new()),
            Endpoint {
                host: "localhost".to_string(),
                port: 1883,
                tls: false,
            },
        ));
        HttpState::new("svc", connection, Arc::new(TaskSupervisor::new()))
    }

    #[tokio::test]
    async fn test_echo() {
        let response = warp::test::request()
            .method("POST")
            .path("/svc/example/endpoint")
            .json(&serde_json::json!({"content": "hello"}))
            .reply(&routes(state()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body, serde_json::json!({"content": "Hi! You said `hello`."}));
    }

    #[tokio::test]
    async fn test_echo_rejects_malformed_body() {
        let response = warp::test::request()
            .method("POST")
            .path("/svc/example/endpoint")
            .header("content-type", "application/json")
            .body(r#"{"text": 1}"#)
            .reply(&routes(state()))
            .await;

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_probes_while_disconnected() {
        let filter = routes(state());

        let live = warp::test::request().path("/svc/live").reply(&filter).await;
        assert_eq!(live.status(), StatusCode::OK);

        let ready = warp::test::request().path("/svc/ready").reply(&filter).await;
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        let health = warp::test::request().path("/svc/health").reply(&filter).await;
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(health.body()).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["connection"], "disconnected");
    }

    #[tokio::test]
    async fn test_routes_are_scoped_by_name() {
        let filter = routes(state());

        let status = warp::test::request()
            .path("/svc/_service/status")
            .reply(&filter)
            .await;
        assert_eq!(status.status(), StatusCode::OK);
        assert_eq!(status.body().as_ref(), br#"{"status":"ok"}"#);

        let other = warp::test::request()
            .path("/other/_service/status")
            .reply(&filter)
            .await;
        assert_eq!(other.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_is_healthy() {
        let running = WorkerStatus {
            name: "publisher".to_string(),
            state: WorkerState::Running,
            last_error: None,
            runs: 1,
        };
        let failed = WorkerStatus {
            state: WorkerState::Failed,
            last_error: Some("boom".to_string()),
            ..running.clone()
        };

        assert!(is_healthy(&ConnectionState::Connected, &[running.clone()]));
        assert!(!is_healthy(&ConnectionState::Connecting, &[running.clone()]));
        assert!(!is_healthy(&ConnectionState::Connected, &[running, failed]));
    }
}

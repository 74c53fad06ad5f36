//! Event-bus service runtime
//!
//! A small service scaffold for MQTT-based systems: one managed broker
//! connection with automatic reconnect, a supervisor for long-running
//! background workers, and an HTTP surface with health probes.
//!
//! # Overview
//!
//! - [`broker`] - connect/reconnect state machine, readiness, publish/subscribe
//! - [`routing`] - MQTT topic matching and handler dispatch
//! - [`supervisor`] - worker start/stop with drain timeouts and crash isolation
//! - [`workers`] - periodic history publisher and history subscriber
//! - [`transport`] - broker client seam and its rumqttc implementation
//! - [`http`] - echo endpoint and health/readiness/liveness probes
//! - [`service`] - wiring and shutdown ordering
//!
//! # Quick Start
//!
//! ```rust
//! use eventbus_service::broker::BrokerConnection;
//! use eventbus_service::routing::{HandlerError, HandlerFn, Message};
//! use eventbus_service::testing::MockBrokerClient;
//! use eventbus_service::transport::Endpoint;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let endpoint = Endpoint { host: "localhost".to_string(), port: 1883, tls: false };
//! let connection = Arc::new(BrokerConnection::new(Arc::new(MockBrokerClient::new()), endpoint));
//!
//! connection
//!     .subscribe("sensors/#", HandlerFn::arc(|message: Message| async move {
//!         println!("{} -> {} bytes", message.topic, message.payload.len());
//!         Ok::<(), HandlerError>(())
//!     }))
//!     .await
//!     .unwrap();
//!
//! connection.connect_and_wait(Duration::from_secs(1)).await.unwrap();
//! connection.publish("sensors/kitchen", "21.5").await.unwrap();
//! connection.disconnect().await;
//! # });
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod observability;
pub mod routing;
pub mod service;
pub mod supervisor;
pub mod testing;
pub mod transport;
pub mod workers;

pub use broker::{BrokerConnection, BrokerError, ConnectionState};
pub use config::*;
pub use error::{ServiceError, ServiceResult};
pub use routing::{Message, MessageHandler, TopicRouter};
pub use service::ServiceLifecycle;
pub use supervisor::{TaskSupervisor, Worker, WorkerError, WorkerState};
pub use transport::mqtt::MqttTransport;

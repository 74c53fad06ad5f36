//! MQTT transport over rumqttc
//!
//! Pure functions are kept apart from I/O for testability:
//!
//! - [`options`] - Pure construction of connection options
//! - [`events`] - Pure classification of rumqttc events
//! - [`client`] - Impure session management and event pumping
//!
//! # Usage
//!
//! ```rust,no_run
//! use eventbus_service::config::MqttSection;
//! use eventbus_service::transport::{BrokerClient, MqttTransport};
//!
//! # tokio_test::block_on(async {
//! let transport = MqttTransport::new("my-service", MqttSection::default());
//! let (events_tx, _events_rx) = tokio::sync::mpsc::channel(64);
//! transport.connect(events_tx).await?;
//! transport.subscribe("brewcast/history/#").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod events;
pub mod options;

pub use client::MqttTransport;
pub use events::{classify, EventRoute};
pub use options::configure_mqtt_options;

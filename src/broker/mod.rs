//! Managed broker connection
//!
//! - [`connection`] - connect/reconnect state machine, publish/subscribe, readiness
//! - [`retry`] - pure backoff and retry-exhaustion decisions

pub mod connection;
pub mod retry;

pub use connection::{BrokerConnection, BrokerError, ConnectionState};
pub use retry::{RetryDecision, RetryPolicy};

//! Example workers built on the supervisor and the broker connection
//!
//! - [`publisher`] - periodic history publisher
//! - [`producer`] - payload sources for the publisher
//! - [`subscriber`] - subscription-owning worker and the history logger

pub mod producer;
pub mod publisher;
pub mod subscriber;

pub use producer::{FixedProducer, Producer, ProducerError, RandomWalk};
pub use publisher::{PublishPlan, PublishingWorker};
pub use subscriber::{HistoryLogger, SubscribingWorker};

/// Supervisor name of the publishing worker
pub const PUBLISHER: &str = "publisher";

/// Supervisor name of the subscribing worker
pub const SUBSCRIBER: &str = "subscriber";

//! Topic matching and inbound message routing
//!
//! - [`topic`] - MQTT wildcard grammar: validation and matching
//! - [`topic_router`] - registration of handlers and fan-out dispatch

pub mod topic;
pub mod topic_router;

pub use topic::{join_topic, topic_matches, validate_pattern, validate_topic, TopicError};
pub use topic_router::{
    DispatchReport, HandlerError, HandlerFn, Message, MessageHandler, Subscription,
    SubscriptionId, TopicRouter,
};

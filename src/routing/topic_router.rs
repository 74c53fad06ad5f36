//! Dispatch of inbound messages to registered topic handlers
//!
//! The router owns every [`Subscription`] and the handler bound to it.
//! It is transport-agnostic: the broker connection feeds it
//! `(topic, payload)` pairs and it fans them out to every matching handler
//! in registration order.

use super::topic::{topic_matches, validate_pattern, TopicError};
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Callback invoked for every message matching a subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

/// Closure-backed [`MessageHandler`].
///
/// Each invocation creates a fresh future from the closure.
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }

    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self.f)(message).await
    }
}

/// Unique identifier of one subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle returned for every registered topic pattern.
///
/// Registering the same pattern twice yields two independent handles,
/// and a matching message is delivered once per handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: String,
}

struct Registration {
    subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
}

/// Outcome of a single dispatch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Number of handlers whose pattern matched the topic
    pub matched: usize,
    /// Number of matched handlers that returned an error or panicked
    pub failed: usize,
}

/// Maps inbound topics to registered handlers
#[derive(Default)]
pub struct TopicRouter {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every topic matched by `pattern`
    pub async fn add(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TopicError> {
        validate_pattern(pattern)?;

        let subscription = Subscription {
            id: SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1),
            pattern: pattern.to_string(),
        };

        self.registrations.write().await.push(Registration {
            subscription: subscription.clone(),
            handler,
        });

        debug!(subscription = %subscription.id, pattern = %pattern, "Registered topic handler");
        Ok(subscription)
    }

    /// Remove one handle. Returns false when the id is unknown.
    pub async fn remove(&self, id: SubscriptionId) -> bool {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|r| r.subscription.id != id);
        before != registrations.len()
    }

    /// All live subscriptions in registration order
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.registrations
            .read()
            .await
            .iter()
            .map(|r| r.subscription.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }

    /// Deliver `message` to every handler whose pattern matches its topic.
    ///
    /// Handlers run sequentially in registration order. A handler that
    /// fails or panics is logged and counted; the remaining handlers still run.
    pub async fn dispatch(&self, message: Message) -> DispatchReport {
        let targets: Vec<(Subscription, Arc<dyn MessageHandler>)> = {
            let registrations = self.registrations.read().await;
            registrations
                .iter()
                .filter(|r| topic_matches(&r.subscription.pattern, &message.topic))
                .map(|r| (r.subscription.clone(), Arc::clone(&r.handler)))
                .collect()
        };

        let mut report = DispatchReport {
            matched: targets.len(),
            failed: 0,
        };

        if targets.is_empty() {
            debug!(topic = %message.topic, "No handler registered for topic");
            return report;
        }

        for (subscription, handler) in targets {
            let outcome = AssertUnwindSafe(handler.handle(message.clone()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    metrics().handler_failed();
                    warn!(
                        topic = %message.topic,
                        pattern = %subscription.pattern,
                        subscription = %subscription.id,
                        error = %e,
                        "Message handler failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    metrics().handler_failed();
                    error!(
                        topic = %message.topic,
                        pattern = %subscription.pattern,
                        subscription = %subscription.id,
                        "Message handler panicked"
                    );
                }
            }
        }

        report
    }
}

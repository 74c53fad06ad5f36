//! Connection-state-aware broker client
//!
//! [`BrokerConnection`] owns the lifecycle of one connection to the bus. A
//! background link task establishes the transport session, re-issues every
//! recorded subscription, then pumps inbound events into the
//! [`TopicRouter`] until the session is lost, at which point it reconnects.
//!
//! Locking: `link` serializes connect/disconnect; `inner` serializes the
//! subscription records, the outbox and every wire-level publish/subscribe,
//! so a reconnect's re-subscription never races a concurrent `subscribe()`.

use super::retry::{RetryDecision, RetryPolicy};
use crate::config::ServiceConfig;
use crate::observability::metrics::metrics;
use crate::routing::{
    validate_topic, MessageHandler, Subscription, SubscriptionId, TopicError, TopicRouter,
};
use crate::transport::{BrokerClient, Endpoint, InboundEvent};
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Buffer between the transport session and the dispatch loop
const INBOUND_CAPACITY: usize = 256;

/// Time the link task gets to unwind on disconnect before it is aborted
const LINK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Establishing the session, initially or after a loss
    Connecting,
    /// Session up and every recorded subscription re-issued
    Connected,
    Disconnecting,
    /// Retries exhausted; readiness will never be signaled
    Failed(String),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Broker connection errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscription to '{pattern}' failed: {reason}")]
    SubscriptionFailed { pattern: String, reason: String },
    #[error("Connection not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error("Outbox full ({capacity} messages queued)")]
    OutboxFull { capacity: usize },
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

struct Inner {
    /// Every live subscription handle with its pattern, in registration order
    records: Vec<(SubscriptionId, String)>,
    outbox: VecDeque<(String, Bytes)>,
    outbox_capacity: usize,
}

impl Inner {
    fn distinct_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for (_, pattern) in &self.records {
            if !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
        patterns
    }

    fn discard_outbox(&mut self) {
        if !self.outbox.is_empty() {
            warn!(discarded = self.outbox.len(), "Discarding queued publishes");
            self.outbox.clear();
        }
    }
}

struct Link {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Managed connection to the message bus
pub struct BrokerConnection<C: BrokerClient> {
    client: Arc<C>,
    endpoint: Endpoint,
    retry: RetryPolicy,
    router: Arc<TopicRouter>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
    link: Mutex<Option<Link>>,
}

impl<C: BrokerClient> BrokerConnection<C> {
    /// Create a disconnected connection with the default retry policy and no outbox
    pub fn new(client: Arc<C>, endpoint: Endpoint) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            client,
            endpoint,
            retry: RetryPolicy::default(),
            router: Arc::new(TopicRouter::new()),
            state,
            inner: Mutex::new(Inner {
                records: Vec::new(),
                outbox: VecDeque::new(),
                outbox_capacity: 0,
            }),
            link: Mutex::new(None),
        }
    }

    pub fn from_config(client: Arc<C>, config: &ServiceConfig) -> Self {
        Self::new(client, config.endpoint())
            .with_retry_policy(RetryPolicy::from(&config.reconnect))
            .with_outbox_capacity(config.mqtt.outbox_capacity)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Queue up to `capacity` publishes while connecting; 0 disables queueing
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.inner.get_mut().outbox_capacity = capacity;
        self
    }

    pub fn with_router(mut self, router: Arc<TopicRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.router.subscriptions().await
    }

    /// Start connecting in the background.
    ///
    /// Idempotent: returns immediately when already connecting or connected.
    /// Use [`Self::wait_ready`] to await the outcome.
    pub async fn connect(self: &Arc<Self>) {
        let mut link = self.link.lock().await;

        let current = self.state();
        if matches!(
            current,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(state = %current, "connect() ignored, link already active");
            return;
        }

        // A link left over from a failed run has already exited
        if let Some(stale) = link.take() {
            stale.cancel.cancel();
            stale.handle.abort();
        }

        self.set_state(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let span = crate::mqtt_span!(endpoint = %self.endpoint);
        let handle = tokio::spawn(Arc::clone(self).run_link(cancel.clone()).instrument(span));

        *link = Some(Link { cancel, handle });
    }

    /// Connect and wait until ready or `timeout` elapses
    pub async fn connect_and_wait(self: &Arc<Self>, timeout: Duration) -> Result<(), BrokerError> {
        self.connect().await;
        self.wait_ready(timeout).await
    }

    /// Wait until the state is `Connected`.
    ///
    /// Fails early with `ConnectionFailed` when retries are exhausted.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), BrokerError> {
        let mut rx = self.state.subscribe();

        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed(reason) => {
                        return Err(BrokerError::ConnectionFailed(reason))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(BrokerError::ConnectionFailed(
                        "Connection dropped".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BrokerError::ReadyTimeout(timeout))?
    }

    /// Publish `payload` to `topic`.
    ///
    /// Fails fast with `NotConnected` unless connected. When an outbox is
    /// configured, publishes made while connecting are queued instead and
    /// flushed in order before the state becomes `Connected`.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        validate_topic(topic)?;
        let payload = payload.into();

        let mut inner = self.inner.lock().await;
        match self.state() {
            ConnectionState::Connected => match self.client.publish(topic, payload).await {
                Ok(()) => {
                    metrics().mqtt_message_published();
                    debug!(topic = %topic, "Published message");
                    Ok(())
                }
                Err(e) => {
                    metrics().mqtt_publish_failed();
                    Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })
                }
            },
            ConnectionState::Connecting if inner.outbox_capacity > 0 => {
                if inner.outbox.len() >= inner.outbox_capacity {
                    return Err(BrokerError::OutboxFull {
                        capacity: inner.outbox_capacity,
                    });
                }
                inner.outbox.push_back((topic.to_string(), payload));
                debug!(topic = %topic, queued = inner.outbox.len(), "Queued publish until connected");
                Ok(())
            }
            state => Err(BrokerError::NotConnected { state }),
        }
    }

    /// Serialize `value` as JSON and publish it
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload).await
    }

    /// Register `handler` for `pattern`.
    ///
    /// Valid in any state. The pattern is re-issued to the broker on every
    /// (re)connect; when already connected it is issued immediately.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError> {
        let mut inner = self.inner.lock().await;
        let subscription = self.router.add(pattern, handler).await?;

        let on_wire = inner.records.iter().any(|(_, p)| p == pattern);
        inner.records.push((subscription.id, pattern.to_string()));

        // The record stays on a wire failure: the session is going down and
        // the next activation re-issues every recorded pattern.
        if !on_wire && self.is_connected() {
            if let Err(e) = self.client.subscribe(pattern).await {
                warn!(pattern = %pattern, error = %e, "Subscribe not issued, deferring to reconnect");
            }
        }

        info!(pattern = %pattern, subscription = %subscription.id, "Subscribed");
        Ok(subscription)
    }

    /// Remove one subscription handle. Returns false for an unknown handle.
    ///
    /// The broker-side filter is removed only once no other handle uses it.
    /// A failed broker-side removal is logged; the local handle is gone
    /// either way and the filter is not re-issued on reconnect.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut inner = self.inner.lock().await;

        let before = inner.records.len();
        inner.records.retain(|(id, _)| *id != subscription.id);
        if inner.records.len() == before {
            return false;
        }
        self.router.remove(subscription.id).await;

        let still_used = inner
            .records
            .iter()
            .any(|(_, pattern)| *pattern == subscription.pattern);

        if !still_used && self.is_connected() {
            if let Err(e) = self.client.unsubscribe(&subscription.pattern).await {
                warn!(pattern = %subscription.pattern, error = %e, "Broker-side unsubscribe failed");
            }
        }

        debug!(pattern = %subscription.pattern, subscription = %subscription.id, "Unsubscribed");
        true
    }

    /// Stop the link task, close the transport and discard the outbox.
    /// Idempotent.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if link.is_none() && self.state() == ConnectionState::Disconnected {
            return;
        }

        self.set_state(ConnectionState::Disconnecting);

        if let Some(active) = link.take() {
            active.cancel.cancel();
            let mut handle = active.handle;
            if tokio::time::timeout(LINK_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Connection link didn't stop gracefully, forcing abort");
                handle.abort();
            }
        }

        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Transport disconnect reported an error");
        }

        {
            let mut inner = self.inner.lock().await;
            inner.discard_outbox();
            self.set_state(ConnectionState::Disconnected);
        }

        metrics().mqtt_disconnected();
        info!(endpoint = %self.endpoint, "Disconnected from broker");
    }

    /// Connect/reconnect loop followed by the inbound dispatch loop
    async fn run_link(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures = 0u32;

        loop {
            let mut events = loop {
                metrics().mqtt_connection_attempt();
                let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

                let attempt = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.client.connect(tx) => result,
                };

                let failure = match attempt {
                    Ok(()) => match self.activate().await {
                        Ok(()) => break rx,
                        Err(e) => {
                            if let Err(close) = self.client.disconnect().await {
                                debug!(error = %close, "Closing half-open session failed");
                            }
                            e.to_string()
                        }
                    },
                    Err(e) => e.to_string(),
                };

                failures += 1;
                metrics().mqtt_connection_failed();

                match self.retry.decide(failures) {
                    RetryDecision::Proceed { attempt, delay } => {
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Connection attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    RetryDecision::Exhausted => {
                        error!(attempts = failures, error = %failure, "Connection retries exhausted");
                        self.fail(failure).await;
                        return;
                    }
                }
            };

            failures = 0;

            let reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(InboundEvent::Message(message)) => {
                            metrics().mqtt_message_received();
                            self.router.dispatch(message).await;
                        }
                        Some(InboundEvent::ConnectionLost(reason)) => break reason,
                        None => break "Transport event channel closed".to_string(),
                    }
                }
            };

            metrics().mqtt_connection_lost();
            warn!(reason = %reason, "Connection lost, reconnecting");

            let _inner = self.inner.lock().await;
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// Re-issue subscriptions and flush the outbox, then mark connected
    async fn activate(&self) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;

        let patterns = inner.distinct_patterns();
        for pattern in &patterns {
            self.client
                .subscribe(pattern)
                .await
                .map_err(|e| BrokerError::SubscriptionFailed {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
        }

        while let Some((topic, payload)) = inner.outbox.pop_front() {
            match self.client.publish(&topic, payload).await {
                Ok(()) => metrics().mqtt_message_published(),
                Err(e) => {
                    metrics().mqtt_publish_failed();
                    warn!(topic = %topic, error = %e, "Queued publish failed");
                }
            }
        }

        self.set_state(ConnectionState::Connected);
        metrics().mqtt_connection_established();
        info!(
            endpoint = %self.endpoint,
            subscriptions = patterns.len(),
            "Connected to broker"
        );
        Ok(())
    }

    async fn fail(&self, reason: String) {
        let mut inner = self.inner.lock().await;
        inner.discard_outbox();
        self.set_state(ConnectionState::Failed(reason));
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            log_state_transition(&previous, &next);
        }
    }
}

/// Log connection state transition
fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connected, ConnectionState::Connecting) => {
            warn!("Broker connection interrupted");
        }
        (_, ConnectionState::Failed(reason)) => {
            error!(reason = %reason, "Broker connection permanently failed");
        }
        _ => debug!("Broker connection state: {} -> {}", from, to),
    }
}

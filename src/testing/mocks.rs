//! Mock implementations for testing
//!
//! Provides an in-memory [`BrokerClient`] that records every call and can
//! loop published messages back to matching subscriptions, so the broker
//! connection, workers and service can be tested without a real broker.

use crate::routing::{topic_matches, Message};
use crate::transport::{BrokerClient, InboundEvent, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub type PublishedMessage = (String, Bytes);

#[derive(Debug, Default)]
struct MockState {
    events: Option<mpsc::Sender<InboundEvent>>,
    connected: bool,
    connect_calls: usize,
    disconnect_calls: usize,
    fail_connects: usize,
    fail_publish: bool,
    fail_subscribe: bool,
    subscribe_calls: Vec<String>,
    unsubscribe_calls: Vec<String>,
    active_patterns: Vec<String>,
    published: Vec<PublishedMessage>,
}

/// Mock broker client for testing
#[derive(Debug, Clone)]
pub struct MockBrokerClient {
    state: Arc<Mutex<MockState>>,
    loopback: bool,
}

impl Default for MockBrokerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrokerClient {
    /// Mock that echoes published messages to matching active subscriptions
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            loopback: true,
        }
    }

    /// Mock that only records publishes
    pub fn without_loopback() -> Self {
        Self {
            loopback: false,
            ..Self::new()
        }
    }

    /// Make the next `count` connect attempts fail
    pub async fn fail_next_connects(&self, count: usize) {
        self.state.lock().await.fail_connects = count;
    }

    pub async fn set_fail_publish(&self, fail: bool) {
        self.state.lock().await.fail_publish = fail;
    }

    pub async fn set_fail_subscribe(&self, fail: bool) {
        self.state.lock().await.fail_subscribe = fail;
    }

    /// Deliver a message as if the broker sent it.
    ///
    /// Returns false when there is no session or no active filter matches.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let sender = {
            let state = self.state.lock().await;
            if !state.connected
                || !state
                    .active_patterns
                    .iter()
                    .any(|pattern| topic_matches(pattern, topic))
            {
                return false;
            }
            state.events.clone()
        };

        match sender {
            Some(tx) => tx
                .send(InboundEvent::Message(Message::new(topic, payload)))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the broker dropping the session
    pub async fn drop_connection(&self, reason: &str) {
        let sender = {
            let mut state = self.state.lock().await;
            state.connected = false;
            state.active_patterns.clear();
            state.events.take()
        };

        if let Some(tx) = sender {
            let _ = tx.send(InboundEvent::ConnectionLost(reason.to_string())).await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn connect_calls(&self) -> usize {
        self.state.lock().await.connect_calls
    }

    pub async fn disconnect_calls(&self) -> usize {
        self.state.lock().await.disconnect_calls
    }

    pub async fn subscribe_calls(&self) -> Vec<String> {
        self.state.lock().await.subscribe_calls.clone()
    }

    pub async fn unsubscribe_calls(&self) -> Vec<String> {
        self.state.lock().await.unsubscribe_calls.clone()
    }

    /// Filters registered on the current session
    pub async fn active_patterns(&self) -> Vec<String> {
        self.state.lock().await.active_patterns.clone()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Published messages on `topic`
    pub async fn published_to(&self, topic: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub async fn clear_history(&self) {
        let mut state = self.state.lock().await;
        state.published.clear();
        state.subscribe_calls.clear();
        state.unsubscribe_calls.clear();
        state.connect_calls = 0;
        state.disconnect_calls = 0;
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn connect(&self, events: mpsc::Sender<InboundEvent>) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.connect_calls += 1;

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Connect("Mock connection refused".to_string()));
        }

        state.events = Some(events);
        state.connected = true;
        state.active_patterns.clear();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.disconnect_calls += 1;
        state.connected = false;
        state.active_patterns.clear();
        state.events = None;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_publish {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "Mock publish failure".to_string(),
            });
        }

        state.published.push((topic.to_string(), payload.clone()));

        // Never block the publisher on a full inbound queue
        if self.loopback
            && state
                .active_patterns
                .iter()
                .any(|pattern| topic_matches(pattern, topic))
        {
            if let Some(tx) = &state.events {
                let _ = tx.try_send(InboundEvent::Message(Message::new(topic, payload)));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribe {
            return Err(TransportError::Subscribe {
                pattern: pattern.to_string(),
                reason: "Mock subscribe failure".to_string(),
            });
        }

        state.subscribe_calls.push(pattern.to_string());
        if !state.active_patterns.iter().any(|p| p == pattern) {
            state.active_patterns.push(pattern.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }

        state.unsubscribe_calls.push(pattern.to_string());
        state.active_patterns.retain(|p| p != pattern);
        Ok(())
    }
}

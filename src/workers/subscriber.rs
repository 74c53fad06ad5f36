//! Reactive subscriber
//!
//! The worker only owns the subscriptions: it registers them when a run
//! starts and removes them when the run is cancelled. Messages are handled
//! on the connection's dispatch path, not in the worker's own task.

use crate::broker::BrokerConnection;
use crate::models::HistoryEvent;
use crate::routing::{HandlerError, Message, MessageHandler, Subscription};
use crate::supervisor::{Worker, WorkerError};
use crate::transport::BrokerClient;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SubscribingWorker<C: BrokerClient> {
    connection: Arc<BrokerConnection<C>>,
    patterns: Vec<String>,
    handler: Arc<dyn MessageHandler>,
}

impl<C: BrokerClient> SubscribingWorker<C> {
    pub fn new(
        connection: Arc<BrokerConnection<C>>,
        patterns: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            connection,
            patterns,
            handler,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Register every pattern; on failure the ones already added are removed
    pub async fn prepare(&self) -> Result<Vec<Subscription>, WorkerError> {
        let mut registrations = Registrations::new(Arc::clone(&self.connection));

        for pattern in &self.patterns {
            match self
                .connection
                .subscribe(pattern, Arc::clone(&self.handler))
                .await
            {
                Ok(subscription) => registrations.subscriptions.push(subscription),
                Err(e) => {
                    registrations.release().await;
                    return Err(e.into());
                }
            }
        }

        Ok(registrations.into_inner())
    }
}

#[async_trait]
impl<C: BrokerClient> Worker for SubscribingWorker<C> {
    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let mut registrations = Registrations::new(Arc::clone(&self.connection));
        registrations.subscriptions = self.prepare().await?;
        info!(patterns = ?self.patterns, "Listening for messages");

        cancel.cancelled().await;

        registrations.release().await;
        debug!("Subscriptions released");
        Ok(())
    }
}

/// Subscriptions owned by one run.
///
/// Whatever is still held when the guard drops, as when a drain timeout
/// aborts the run, is released on a spawned task.
struct Registrations<C: BrokerClient> {
    connection: Arc<BrokerConnection<C>>,
    subscriptions: Vec<Subscription>,
}

impl<C: BrokerClient> Registrations<C> {
    fn new(connection: Arc<BrokerConnection<C>>) -> Self {
        Self {
            connection,
            subscriptions: Vec::new(),
        }
    }

    fn into_inner(mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.subscriptions)
    }

    async fn release(&mut self) {
        while let Some(subscription) = self.subscriptions.pop() {
            self.connection.unsubscribe(&subscription).await;
        }
    }
}

impl<C: BrokerClient> Drop for Registrations<C> {
    fn drop(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }

        let subscriptions = std::mem::take(&mut self.subscriptions);
        let connection = Arc::clone(&self.connection);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(
                    count = subscriptions.len(),
                    "Releasing subscriptions of an interrupted run"
                );
                runtime.spawn(async move {
                    for subscription in &subscriptions {
                        connection.unsubscribe(subscription).await;
                    }
                });
            }
            Err(_) => warn!(
                count = subscriptions.len(),
                "No runtime left to release subscriptions"
            ),
        }
    }
}

/// Logs every history event it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct HistoryLogger;

#[async_trait]
impl MessageHandler for HistoryLogger {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let event: HistoryEvent = message.json()?;
        info!(topic = %message.topic, key = %event.key, "History event");
        debug!(key = %event.key, data = ?event.data, "History event data");
        Ok(())
    }
}

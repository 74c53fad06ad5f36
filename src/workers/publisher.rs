//! Periodic history publisher
//!
//! `Idle -> Preparing -> (Sleep -> Publish)* -> Stopped | Failed`
//!
//! The configuration snapshot is read once per start. A publish failure
//! is logged and the loop continues; a producer failure fails the run.

use super::producer::Producer;
use crate::broker::BrokerConnection;
use crate::config::ConfigWatch;
use crate::models::HistoryEvent;
use crate::supervisor::{Worker, WorkerError};
use crate::transport::BrokerClient;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one run publishes, where, and how often
#[derive(Debug, Clone, PartialEq)]
pub struct PublishPlan {
    pub key: String,
    pub topic: String,
    pub interval: Duration,
}

pub struct PublishingWorker<C: BrokerClient> {
    connection: Arc<BrokerConnection<C>>,
    config: ConfigWatch,
    producer: Arc<dyn Producer>,
}

impl<C: BrokerClient> PublishingWorker<C> {
    pub fn new(
        connection: Arc<BrokerConnection<C>>,
        config: ConfigWatch,
        producer: Arc<dyn Producer>,
    ) -> Self {
        Self {
            connection,
            config,
            producer,
        }
    }

    /// Take the configuration snapshot for one run.
    ///
    /// A non-positive interval requests an immediate clean stop.
    pub fn prepare(&self) -> Result<PublishPlan, WorkerError> {
        let config = Arc::clone(&self.config.borrow());

        let interval = match config.publish_interval() {
            Some(interval) => interval,
            None if config.publish_interval_secs > 0.0 => {
                return Err(WorkerError::failed(format!(
                    "publish interval {}s cannot be represented",
                    config.publish_interval_secs
                )));
            }
            None => {
                return Err(WorkerError::stop_requested(format!(
                    "publish interval {}s disables publishing",
                    config.publish_interval_secs
                )));
            }
        };

        Ok(PublishPlan {
            key: config.name.clone(),
            topic: config.publish_topic(),
            interval,
        })
    }
}

#[async_trait]
impl<C: BrokerClient> Worker for PublishingWorker<C> {
    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let plan = self.prepare()?;
        info!(
            topic = %plan.topic,
            interval_ms = plan.interval.as_millis() as u64,
            "Publishing history events"
        );

        let mut consecutive_failures = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(plan.interval) => {}
            }

            let data = self.producer.produce().await.map_err(WorkerError::failed)?;
            let event = HistoryEvent::new(plan.key.as_str(), data);

            match self.connection.publish_json(&plan.topic, &event).await {
                Ok(()) => {
                    if consecutive_failures > 0 {
                        info!(
                            topic = %plan.topic,
                            after_failures = consecutive_failures,
                            "Publishing recovered"
                        );
                    }
                    consecutive_failures = 0;
                    debug!(topic = %plan.topic, data = ?event.data, "Sent history event");
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        topic = %plan.topic,
                        error = %e,
                        consecutive_failures,
                        "Publish failed, continuing"
                    );
                }
            }
        }
    }
}

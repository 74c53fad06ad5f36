//! Impure I/O operations for the MQTT transport
//!
//! This module handles network communication and integration with the
//! rumqttc client. Each session owns one event-loop pump task; the session
//! resolves on ConnAck and reports its own end as
//! [`InboundEvent::ConnectionLost`]. It never reconnects by itself.

use super::events::{classify, EventRoute};
use super::options::configure_mqtt_options;
use crate::config::MqttSection;
use crate::routing::Message;
use crate::transport::{BrokerClient, InboundEvent, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Time granted to the pump task to finish after a shutdown signal
const PUMP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

struct Session {
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

/// MQTT implementation of [`BrokerClient`] on top of rumqttc v5
pub struct MqttTransport {
    service_name: String,
    config: MqttSection,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    pub fn new(service_name: &str, config: MqttSection) -> Self {
        Self {
            service_name: service_name.to_string(),
            config,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MqttSection {
        &self.config
    }

    /// Poll the event loop until shutdown, broker disconnect or error
    async fn pump_events(
        mut event_loop: EventLoop,
        events: mpsc::Sender<InboundEvent>,
        ready_tx: oneshot::Sender<Result<(), String>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ready_tx = Some(ready_tx);

        let lost_reason = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(target: "mqtt_transport", "Shutdown signal received, stopping event pump");
                        return;
                    }
                }

                polled = event_loop.poll() => match polled {
                    Ok(event) => match classify(&event) {
                        EventRoute::ConnectionAcknowledged => {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        EventRoute::MessageReceived { topic, payload, retain } => {
                            debug!(target: "mqtt_transport", topic = %topic, retain, "Received MQTT message");
                            let message = Message::new(topic, payload);
                            if events.send(InboundEvent::Message(message)).await.is_err() {
                                debug!(target: "mqtt_transport", "Event receiver dropped, stopping event pump");
                                return;
                            }
                        }
                        EventRoute::Disconnected => {
                            break "Broker disconnected".to_string();
                        }
                        EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                            if rejected > 0 {
                                warn!(packet_id, rejected, "Broker rejected subscription filters");
                            } else {
                                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                            }
                        }
                        EventRoute::InfrastructureEvent(event_str) => {
                            debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                        }
                        EventRoute::OutgoingEvent => {}
                    },
                    Err(e) => break e.to_string(),
                }
            }
        };

        match ready_tx.take() {
            // Failed before ConnAck: the pending connect() reports the error
            Some(tx) => {
                let _ = tx.send(Err(lost_reason));
            }
            None => {
                let _ = events.send(InboundEvent::ConnectionLost(lost_reason)).await;
            }
        }
    }

    /// Stop a session's pump task, aborting it if it does not finish in time
    async fn close_session(session: Session) {
        let _ = session.shutdown_tx.send(true);
        let mut pump = session.pump;

        match tokio::time::timeout(PUMP_SHUTDOWN_TIMEOUT, &mut pump).await {
            Ok(Ok(())) => debug!(target: "mqtt_transport", "Event pump shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event pump ended with error: {}", e),
            Err(_) => {
                warn!("Event pump didn't shut down gracefully, forcing abort");
                pump.abort();
            }
            _ => {}
        }
    }
}

#[async_trait]
impl BrokerClient for MqttTransport {
    async fn connect(&self, events: mpsc::Sender<InboundEvent>) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            Self::close_session(previous).await;
        }

        let options = configure_mqtt_options(&self.service_name, &self.config);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(Self::pump_events(event_loop, events, ready_tx, shutdown_rx));

        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
        let outcome = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::Connect(reason)),
            Ok(Err(_)) => Err(TransportError::Connect(
                "Event loop stopped before ConnAck".to_string(),
            )),
            Err(_) => Err(TransportError::Connect(format!(
                "ConnAck timeout after {}s",
                timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(()) => {
                info!(
                    host = %self.config.host,
                    port = self.config.port,
                    "MQTT session established"
                );
                *session = Some(Session {
                    client,
                    shutdown_tx,
                    pump,
                });
                Ok(())
            }
            Err(e) => {
                let _ = shutdown_tx.send(true);
                pump.abort();
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()));

        Self::close_session(session).await;
        info!("MQTT session closed");
        result
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;

        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;

        session
            .client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;

        session
            .client
            .unsubscribe(pattern)
            .await
            .map_err(|e| TransportError::Unsubscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }
}

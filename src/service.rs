//! Service lifecycle
//!
//! Wires the broker connection, the supervisor and the example workers, and
//! owns startup and shutdown ordering:
//!
//! 1. build the connection and register workers (`initialize`)
//! 2. start autostart workers, then connect in the background (`start`)
//! 3. optionally serve HTTP (`start_http`)
//! 4. on shutdown: drain workers, disconnect, stop HTTP
//!
//! Workers start before the connection is up. Subscriptions registered early
//! are issued once the session is established, and publishes made while
//! connecting fail fast unless an outbox is configured.

use crate::broker::{BrokerConnection, ConnectionState};
use crate::config::{ConfigWatch, ServiceConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::http::{HttpServer, HttpState};
use crate::observability::metrics::metrics;
use crate::supervisor::{StopReport, TaskSupervisor, WorkerOptions};
use crate::transport::BrokerClient;
use crate::workers::{
    HistoryLogger, Producer, PublishingWorker, RandomWalk, SubscribingWorker, PUBLISHER,
    SUBSCRIBER,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

pub struct ServiceLifecycle<C: BrokerClient> {
    config_tx: watch::Sender<Arc<ServiceConfig>>,
    config_rx: ConfigWatch,
    connection: Arc<BrokerConnection<C>>,
    supervisor: Arc<TaskSupervisor>,
    producer: Arc<dyn Producer>,
    http: Option<HttpServer>,
    initialized: bool,
}

impl<C: BrokerClient> ServiceLifecycle<C> {
    /// Build the service around `client`; nothing runs until [`Self::start`]
    pub fn new(config: ServiceConfig, client: Arc<C>) -> Self {
        let connection = Arc::new(BrokerConnection::from_config(client, &config));
        let (config_tx, config_rx) = config.into_watch();

        Self {
            config_tx,
            config_rx,
            connection,
            supervisor: Arc::new(TaskSupervisor::new()),
            producer: Arc::new(RandomWalk::temperature()),
            http: None,
            initialized: false,
        }
    }

    /// Replace the publisher's data source (before `initialize`)
    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = producer;
        self
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<ServiceConfig> {
        Arc::clone(&self.config_rx.borrow())
    }

    /// Swap the configuration; running workers keep their snapshot until restarted
    pub fn update_config(&self, config: ServiceConfig) -> ServiceResult<()> {
        config.validate()?;
        self.config_tx.send_replace(Arc::new(config));
        Ok(())
    }

    pub fn connection(&self) -> &Arc<BrokerConnection<C>> {
        &self.connection
    }

    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(HttpServer::local_addr)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Register the publishing and subscribing workers
    pub async fn initialize(&mut self) -> ServiceResult<()> {
        if self.initialized {
            return Ok(());
        }

        let config = self.config();
        info!(service = %config.name, endpoint = %self.connection.endpoint(), "Initializing service");
        metrics().set_service_state("initializing");

        let publisher = PublishingWorker::new(
            Arc::clone(&self.connection),
            self.config_rx.clone(),
            Arc::clone(&self.producer),
        );
        self.supervisor
            .register(PUBLISHER, Arc::new(publisher), WorkerOptions::default())
            .await?;

        let subscriber = SubscribingWorker::new(
            Arc::clone(&self.connection),
            vec![config.history_pattern()],
            Arc::new(HistoryLogger),
        );
        self.supervisor
            .register(SUBSCRIBER, Arc::new(subscriber), WorkerOptions::default())
            .await?;

        self.initialized = true;
        metrics().set_service_state("initialized");
        Ok(())
    }

    /// Start autostart workers and begin connecting
    pub async fn start(&mut self) -> ServiceResult<()> {
        self.initialize().await?;

        let span = crate::lifecycle_span!(phase = "start");
        async {
            let started = self.supervisor.start_all().await;
            info!(workers = ?started, "Workers started");

            self.connection.connect().await;
            metrics().set_service_state("running");
        }
        .instrument(span)
        .await;

        Ok(())
    }

    /// Serve the HTTP routes on the configured address
    pub async fn start_http(&mut self) -> ServiceResult<SocketAddr> {
        if let Some(addr) = self.http_addr() {
            return Ok(addr);
        }

        let config = self.config();
        let state = HttpState::new(
            config.name.clone(),
            Arc::clone(&self.connection),
            Arc::clone(&self.supervisor),
        );
        let server = HttpServer::spawn(state, &config.http.host, config.http.port)?;
        let addr = server.local_addr();
        self.http = Some(server);
        Ok(addr)
    }

    /// Resolves with the reason once the connection gives up reconnecting
    pub async fn connection_failed(&self) -> String {
        let mut states = self.connection.state_receiver();
        loop {
            if let ConnectionState::Failed(reason) = &*states.borrow_and_update() {
                return reason.clone();
            }
            if states.changed().await.is_err() {
                return "connection dropped".to_string();
            }
        }
    }

    /// Drain workers, disconnect, then stop HTTP.
    ///
    /// Workers that overrun the drain timeout are aborted and listed in the
    /// report; the remaining steps still run.
    pub async fn shutdown(&mut self) -> ServiceResult<StopReport> {
        let config = self.config();
        let span = crate::lifecycle_span!(phase = "shutdown");

        async {
            info!(service = %config.name, "Shutting down service");
            metrics().set_service_state("stopping");

            let report = self.supervisor.stop_all(config.drain_timeout()).await;
            if !report.is_clean() {
                warn!(
                    timed_out = ?report.timed_out,
                    drain_timeout_secs = config.shutdown.drain_timeout_secs,
                    "Workers did not drain in time"
                );
            }

            self.connection.disconnect().await;

            if let Some(server) = self.http.take() {
                server.shutdown().await;
            }

            metrics().set_service_state("stopped");
            info!("Service shutdown complete");
            Ok::<_, ServiceError>(report)
        }
        .instrument(span)
        .await
    }
}

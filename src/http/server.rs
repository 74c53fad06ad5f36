//! HTTP server task
//!
//! Binds the warp routes on the configured address and serves them until
//! shutdown. Binding port 0 picks an ephemeral port; [`HttpServer::local_addr`]
//! reports the one actually bound.

use super::routes::{routes, HttpState};
use crate::error::{ServiceError, ServiceResult};
use crate::transport::BrokerClient;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Time in-flight requests get after shutdown is requested
const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Running HTTP server with graceful shutdown
pub struct HttpServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HttpServer {
    /// Bind `host:port` and serve the routes of `state` in a background task.
    ///
    /// Port 0 binds an ephemeral port; see [`HttpServer::local_addr`].
    pub fn spawn<C: BrokerClient>(
        state: Arc<HttpState<C>>,
        host: &str,
        port: u16,
    ) -> ServiceResult<Self> {
        let ip: IpAddr = host
            .parse()
            .map_err(|e| ServiceError::http_error(format!("invalid bind address '{host}': {e}")))?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();

        let (addr, server) = warp::serve(routes(state))
            .try_bind_with_graceful_shutdown((ip, port), async move {
                shutdown.cancelled().await;
            })
            .map_err(|e| ServiceError::http_error(e.to_string()))?;

        info!(%addr, "HTTP server listening");
        let handle = tokio::spawn(server);

        Ok(Self {
            addr,
            cancel,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn shutdown(self) {
        self.cancel.cancel();

        let mut handle = self.handle;
        if tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!(addr = %self.addr, "HTTP server did not stop in time, aborting");
            handle.abort();
        }
        info!(addr = %self.addr, "HTTP server stopped");
    }
}

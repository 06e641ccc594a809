//! HTTP runtime: listeners, handlers and shutdown sequencing.

pub mod body;
pub mod config;
pub mod handlers;
pub mod router;
pub mod shutdown;
pub mod types;

pub use config::{HttpServerConfig, HttpServerConfigBuilder};
pub use shutdown::shutdown_signal;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use gilgate_core::Gateway;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Serves a [`Gateway`] over HTTP.
#[derive(Debug, Clone)]
pub struct GatewayServer {
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Bind both listeners and serve until `shutdown` completes.
    ///
    /// In-flight requests get up to the request timeout to finish, then the
    /// worker pool is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if either address cannot be bound.
    pub async fn serve<F>(self, config: HttpServerConfig, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let public = TcpListener::bind(config.listen_addr).await?;
        let admin = TcpListener::bind(config.admin_addr).await?;
        info!(
            listen_addr = %public.local_addr()?,
            admin_addr = %admin.local_addr()?,
            "Gateway listening"
        );

        let stop = CancellationToken::new();
        let public_server = {
            let app = self
                .router()
                .into_make_service_with_connect_info::<SocketAddr>();
            let stop = stop.clone();
            tokio::spawn(async move {
                axum::serve(public, app)
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
            })
        };
        let admin_server = {
            let app = self.admin_router();
            let stop = stop.clone();
            tokio::spawn(async move {
                axum::serve(admin, app)
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
            })
        };

        shutdown.await;
        stop.cancel();

        let grace = self.gateway.config().request_timeout;
        let drain = async {
            for (name, server) in [("public", public_server), ("admin", admin_server)] {
                match server.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(listener = name, error = %e, "Listener failed"),
                    Err(e) => error!(listener = name, error = %e, "Listener task failed"),
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "In-flight requests still open after grace period"
            );
        }

        if tokio::time::timeout(grace, self.gateway.shutdown())
            .await
            .is_err()
        {
            warn!("Workers did not stop within the grace period");
        }
        info!("Gateway stopped");
        Ok(())
    }
}

//! Router setup for the public gateway and the admin API

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::runtime::{
    GatewayServer,
    handlers::{dispatch, health_check, metrics_endpoint, notify, retry},
};

impl GatewayServer {
    /// Public router: every method and path is scheduled
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::clone(self.gateway()))
            .layer(TraceLayer::new_for_http())
    }

    /// Admin router, meant for a private address
    pub fn admin_router(&self) -> Router {
        Router::new()
            .route("/notify", post(notify))
            .route("/retry/{id}", post(retry))
            .route("/health", get(health_check))
            .route("/metrics", get(metrics_endpoint))
            .with_state(Arc::clone(self.gateway()))
            .layer(TraceLayer::new_for_http())
    }
}

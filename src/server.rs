use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::error::LoadError;
use crate::metrics::RunMetrics;

/// Serves the run's Prometheus metrics at `/metrics` while a test is running.
pub struct MetricsServer {
    metrics: Arc<RunMetrics>,
}

impl MetricsServer {
    pub fn new(metrics: Arc<RunMetrics>) -> Self {
        Self { metrics }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(Self::metrics_handler))
            .with_state(self.metrics.clone())
    }

    pub async fn run(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), LoadError> {
        let listener = TcpListener::bind(addr)?;
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` is cancelled.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), LoadError> {
        info!("Serving metrics on: {}", listener.local_addr()?);

        let app = self.router();

        axum::Server::from_tcp(listener)
            .map_err(|e| LoadError::Server(e.to_string()))?
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| LoadError::Server(e.to_string()))
    }

    async fn metrics_handler(State(metrics): State<Arc<RunMetrics>>) -> Response {
        match metrics.encode() {
            Ok(body) => (StatusCode::OK, body).into_response(),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::Router;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use frontreport_common::{FrontReportError, Service};

use crate::handler::handle_request;
use crate::state::AppState;

const STOP_CEILING: Duration = Duration::from_secs(10);

/// The ingestion pipeline: binds an HTTP listener, routes every request
/// through [`handle_request`], and wraps the server in a graceful shutdown
/// with a 10s grace window.
pub struct IngestionPipeline {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionPipeline {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            state,
            shutdown: CancellationToken::new(),
            server_task: Mutex::new(None),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
    }
}

#[async_trait]
impl Service for IngestionPipeline {
    async fn start(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| FrontReportError::Startup(format!("failed to bind {}: {e}", self.addr)))?;

        tracing::info!(addr = %self.addr, "ingestion pipeline listening");

        let router = self.router();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "ingestion server exited with an error");
            }
        });

        *self.server_task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        let Some(handle) = self.server_task.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(STOP_CEILING, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FrontReportError::StopTimeout(format!("server task panicked: {e}")).into()),
            Err(_) => Err(FrontReportError::StopTimeout(
                "graceful server shutdown exceeded the 10s grace window".to_string(),
            )
            .into()),
        }
    }
}

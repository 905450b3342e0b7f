mod cli;
mod coordinator;
mod logging;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use frontreport_amqp::{AmqpBatchPublisher, HttpDirectSink, PublisherConfig};
use frontreport_common::{FrontReportError, ReportSink, Service};
use frontreport_ingest::{AppState, IngestConfig, IngestionPipeline};
use frontreport_metrics::{GraphiteConfig, MetricsRegistry};
use frontreport_sourcemap::Processor;

use cli::{Cli, SinkKind};
use coordinator::Coordinator;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "frontreport exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let metrics_registry = Arc::new(MetricsRegistry::new(
        cli.graphite.clone().map(|address| GraphiteConfig {
            address,
            prefix: cli.graphite_prefix.clone(),
        }),
    ));

    let sourcemap = Arc::new(Processor::new(&cli.sourcemap_whitelist, &metrics_registry)?);

    let (sink, sink_service): (Arc<dyn ReportSink>, Arc<dyn Service>) = match cli.sink {
        SinkKind::Amqp => {
            let config = PublisherConfig {
                connection_string: cli.amqp.clone(),
                exchange: cli.amqp_exchange.clone(),
                routing_key: cli.amqp_routing_key.clone(),
                max_batch_size: cli.max_batch_size,
                batch_timeout: Duration::from_millis(cli.batch_timeout_ms),
                max_concurrent_batches: cli.max_concurrent_batches,
                pending_work_capacity: cli.pending_work_capacity,
                cacert: cli.amqp_cacert.clone(),
            };
            let publisher = Arc::new(AmqpBatchPublisher::new(config, &metrics_registry));
            (publisher.clone(), publisher)
        }
        SinkKind::HttpDirect => {
            let endpoint = cli.adapter_endpoint.clone().ok_or_else(|| {
                FrontReportError::Startup("--adapter-endpoint is required when --sink=http-direct".to_string())
            })?;
            let http_sink = Arc::new(HttpDirectSink::new(endpoint, cli.adapter_token.clone(), &metrics_registry));
            (http_sink.clone(), http_sink)
        }
    };

    let ingest_config = IngestConfig {
        service_whitelist: cli.service_whitelist.iter().cloned().collect::<HashSet<_>>(),
        domain_whitelist: cli.domain_whitelist.iter().cloned().collect::<HashSet<_>>(),
        static_root: cli.static_root.clone(),
    };
    let state = AppState::new(ingest_config, sink, sourcemap.clone(), &metrics_registry);
    let addr: SocketAddr = ([0, 0, 0, 0], cli.port).into();
    let pipeline = Arc::new(IngestionPipeline::new(addr, state));

    let coordinator = Coordinator::new(vec![
        ("metrics-registry", metrics_registry.clone() as Arc<dyn Service>),
        ("batching-publisher", sink_service),
        ("sourcemap-processor", sourcemap.clone() as Arc<dyn Service>),
        ("ingestion-pipeline", pipeline.clone() as Arc<dyn Service>),
    ]);

    coordinator.start_all().await?;

    tracing::info!("frontreport is up");
    wait_for_shutdown_signal().await;

    coordinator.stop_all().await
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

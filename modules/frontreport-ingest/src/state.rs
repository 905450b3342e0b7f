use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tower_http::services::ServeDir;

use frontreport_common::ReportSink;
use frontreport_metrics::MetricsRegistry;
use frontreport_sourcemap::Processor;

use crate::metrics::DecodeMetrics;

/// Admission-control and routing configuration for the ingestion pipeline.
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub service_whitelist: HashSet<String>,
    pub domain_whitelist: HashSet<String>,
    /// Root directory served for GET requests that don't match a report
    /// route.
    pub static_root: Option<PathBuf>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IngestConfig>,
    pub sink: Arc<dyn ReportSink>,
    pub sourcemap: Arc<Processor>,
    pub decode_metrics: Arc<DecodeMetrics>,
    pub static_service: Option<ServeDir>,
}

impl AppState {
    pub fn new(
        config: IngestConfig,
        sink: Arc<dyn ReportSink>,
        sourcemap: Arc<Processor>,
        metrics_registry: &MetricsRegistry,
    ) -> Self {
        let static_service = config.static_root.clone().map(ServeDir::new);
        Self {
            config: Arc::new(config),
            sink,
            sourcemap,
            decode_metrics: Arc::new(DecodeMetrics::new(metrics_registry)),
            static_service,
        }
    }
}

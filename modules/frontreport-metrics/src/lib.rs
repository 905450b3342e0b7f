mod graphite;
mod recorder;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use frontreport_common::Service;
use recorder::{RegistryRecorder, Storage};

/// A handle to a named counter, cheap to clone and pass into request handlers.
#[derive(Clone)]
pub struct CounterHandle(metrics::Counter);

impl CounterHandle {
    pub fn inc(&self, delta: u64) {
        self.0.increment(delta);
    }
}

/// A handle to a named histogram backed by a uniform 1000-sample reservoir.
#[derive(Clone)]
pub struct HistogramHandle(metrics::Histogram);

impl HistogramHandle {
    pub fn update(&self, value: i64) {
        self.0.record(value as f64);
    }
}

/// Optional Graphite TCP exporter configuration.
pub struct GraphiteConfig {
    pub address: String,
    pub prefix: String,
}

/// The process-wide metrics registry. Installs itself as the global
/// `metrics` recorder as soon as it's constructed — every other component
/// (`Processor`, `AmqpBatchPublisher`, `HttpDirectSink`, `DecodeMetrics`, ...)
/// registers its counter/histogram handles during its own construction, all
/// of which happen before [`start`](Service::start) is ever called, so the
/// recorder must already be live by the time `MetricsRegistry::new` returns
/// or every handle registered before `start()` binds to the no-op default
/// recorder permanently. [`start`](Service::start) only spawns the optional
/// Graphite flush loop.
///
/// Failure to resolve the Graphite address degrades silently to in-memory
/// only tracking; nothing here blocks ingestion.
pub struct MetricsRegistry {
    storage: Arc<Storage>,
    graphite: Option<GraphiteConfig>,
    flush_stop: Arc<Notify>,
    flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MetricsRegistry {
    pub fn new(graphite: Option<GraphiteConfig>) -> Self {
        let storage = Arc::new(Storage::default());

        let recorder = RegistryRecorder {
            storage: storage.clone(),
        };
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("metrics recorder already installed, skipping");
        }

        Self {
            storage,
            graphite,
            flush_stop: Arc::new(Notify::new()),
            flush_task: std::sync::Mutex::new(None),
        }
    }

    pub fn register_counter(&self, name: &'static str) -> CounterHandle {
        CounterHandle(metrics::counter!(name))
    }

    pub fn register_histogram(&self, name: &'static str) -> HistogramHandle {
        HistogramHandle(metrics::histogram!(name))
    }
}

#[async_trait]
impl Service for MetricsRegistry {
    async fn start(&self) -> anyhow::Result<()> {
        if let Some(cfg) = &self.graphite {
            let storage = self.storage.clone();
            let stop = self.flush_stop.clone();
            let address = cfg.address.clone();
            let prefix = cfg.prefix.clone();
            let handle = tokio::spawn(async move {
                graphite::run(address, prefix, storage, stop).await;
            });
            *self.flush_task.lock().expect("poisoned") = Some(handle);
            tracing::info!(address = %cfg.address, "graphite metrics export enabled");
        } else {
            tracing::info!("no graphite address configured, metrics stay in-memory only");
        }

        Ok(())
    }

    /// No graceful flush is promised on shutdown: the Graphite task is
    /// simply notified to stop so the process can exit promptly.
    async fn stop(&self) -> anyhow::Result<()> {
        self.flush_stop.notify_one();
        if let Some(handle) = self.flush_task.lock().expect("poisoned").take() {
            handle.abort();
        }
        Ok(())
    }
}

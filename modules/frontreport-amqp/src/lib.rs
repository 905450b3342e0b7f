mod batch;
mod config;
mod connection;
mod http_sink;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use frontreport_common::{FrontReportError, Report, ReportSink, Service};
use frontreport_metrics::{CounterHandle, MetricsRegistry};

pub use config::PublisherConfig;
pub use http_sink::HttpDirectSink;

use batch::PublisherMetrics;

const STOP_CEILING: Duration = Duration::from_secs(10);

/// The batching publisher: accepts encoded records, assembles them into
/// size/time-bounded batches, and dispatches each batch concurrently to an
/// AMQP exchange while surviving broker disconnects.
pub struct AmqpBatchPublisher {
    config: Arc<PublisherConfig>,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    channel_tx: watch::Sender<Option<lapin::Channel>>,
    channel_rx: watch::Receiver<Option<lapin::Channel>>,
    fire_semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    metrics: Arc<PublisherMetrics>,
    encode_errors: CounterHandle,
    assembler_task: Mutex<Option<JoinHandle<()>>>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpBatchPublisher {
    pub fn new(config: PublisherConfig, metrics_registry: &MetricsRegistry) -> Self {
        let (tx, rx) = mpsc::channel(config.pending_work_capacity);
        let (channel_tx, channel_rx) = watch::channel(None);
        let fire_semaphore = Arc::new(Semaphore::new(config.max_concurrent_batches));

        Self {
            config: Arc::new(config),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            channel_tx,
            channel_rx,
            fire_semaphore,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            metrics: Arc::new(PublisherMetrics::new(metrics_registry)),
            encode_errors: metrics_registry.register_counter("report_encoding.errors"),
            assembler_task: Mutex::new(None),
            supervisor_task: Mutex::new(None),
        }
    }

    /// Builds the index-header line plus JSON body:
    /// `{"index": {"_index": "<kind>-report[-<service>]-<date>", "_type":
    /// "<kind>-report"}}\n<json>\n`.
    fn encode(&self, report: &Report) -> Result<Vec<u8>, FrontReportError> {
        let date = frontreport_common::format_index_date(chrono::Utc::now());
        let header = serde_json::json!({
            "index": {
                "_index": report.index_name(&date),
                "_type": report.index_type(),
            }
        });
        let mut record = serde_json::to_vec(&header).map_err(|e| FrontReportError::Encode(e.to_string()))?;
        record.push(b'\n');
        let mut body = report.to_json().map_err(|e| FrontReportError::Encode(e.to_string()))?;
        record.append(&mut body);
        record.push(b'\n');
        Ok(record)
    }
}

#[async_trait]
impl ReportSink for AmqpBatchPublisher {
    async fn add_report(&self, report: Report) {
        let record = match self.encode(&report) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode report for publishing");
                self.encode_errors.inc(1);
                return;
            }
        };

        let tx = self.tx.lock().await.clone();
        if let Some(tx) = tx {
            // Blocks (backpressure) when the work queue is full; never
            // silently drops.
            if tx.send(record).await.is_err() {
                tracing::warn!("publisher ingress closed while a report was being queued");
            }
        } else {
            tracing::warn!("publisher ingress already closed, dropping report");
        }
    }
}

#[async_trait]
impl Service for AmqpBatchPublisher {
    async fn start(&self) -> anyhow::Result<()> {
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| FrontReportError::Startup("publisher already started".to_string()))?;

        let supervisor = connection::Supervisor::new(&self.config);
        let supervisor_handle = tokio::spawn(supervisor.run(self.channel_tx.clone(), self.cancel.clone()));
        *self.supervisor_task.lock().await = Some(supervisor_handle);

        let assembler_handle = tokio::spawn(batch::run_assembler(
            rx,
            self.channel_rx.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.fire_semaphore.clone(),
            self.tracker.clone(),
            self.cancel.clone(),
        ));
        *self.assembler_task.lock().await = Some(assembler_handle);

        Ok(())
    }

    /// Closes the ingress, flushes any open batch and awaits in-flight
    /// publishes subject to a 10s hard ceiling, then tears down the
    /// supervisor. Returns a composite error if either the flush or the
    /// supervisor teardown overran the ceiling.
    async fn stop(&self) -> anyhow::Result<()> {
        self.tx.lock().await.take();

        let mut timeout_reasons = Vec::new();

        if let Some(handle) = self.assembler_task.lock().await.take() {
            match tokio::time::timeout(STOP_CEILING, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => timeout_reasons.push(format!("assembler task panicked: {e}")),
                Err(_) => {
                    self.cancel.cancel();
                    timeout_reasons.push("batch flush exceeded the 10s shutdown ceiling".to_string());
                }
            }
        }

        self.tracker.close();
        if tokio::time::timeout(STOP_CEILING, self.tracker.wait()).await.is_err() {
            timeout_reasons.push("in-flight publishes exceeded the 10s shutdown ceiling".to_string());
        }

        self.cancel.cancel();
        if let Some(handle) = self.supervisor_task.lock().await.take() {
            handle.abort();
        }

        if timeout_reasons.is_empty() {
            Ok(())
        } else {
            Err(FrontReportError::StopTimeout(timeout_reasons.join("; ")).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frontreport_common::{CspBody, CspReport, ReportBase};

    fn sample_report() -> Report {
        Report::Csp(CspReport {
            base: ReportBase {
                service: "checkout".to_string(),
                ..Default::default()
            },
            body: CspBody {
                document_uri: Some("https://x.test/".to_string()),
                ..Default::default()
            },
        })
    }

    #[test]
    fn encode_produces_index_header_then_json_then_newlines() {
        let registry = MetricsRegistry::new(None);
        let publisher = AmqpBatchPublisher::new(PublisherConfig::default(), &registry);
        let record = publisher.encode(&sample_report()).unwrap();
        let text = String::from_utf8(record).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with(r#"{"index":{"#) || header.starts_with(r#"{"index": {"#));
        assert!(header.contains("csp-report-checkout-"));
        assert!(header.contains(r#""_type":"csp-report""#) || header.contains(r#""_type": "csp-report""#));
        let body = lines.next().unwrap();
        assert!(body.contains("document-uri"));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn add_report_after_stop_is_dropped_not_blocked() {
        let registry = MetricsRegistry::new(None);
        let publisher = AmqpBatchPublisher::new(PublisherConfig::default(), &registry);
        publisher.start().await.unwrap();
        publisher.stop().await.ok();
        // Ingress is closed; this must return promptly rather than hang.
        tokio::time::timeout(Duration::from_secs(1), publisher.add_report(sample_report()))
            .await
            .expect("add_report should not block once the sink is stopped");
    }
}

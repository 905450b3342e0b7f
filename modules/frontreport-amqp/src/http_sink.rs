use async_trait::async_trait;
use reqwest::StatusCode;

use frontreport_common::{format_index_date, Report, Service};
use frontreport_metrics::{CounterHandle, MetricsRegistry};

/// Unbatched HTTP adapter egress: posts each report individually to a
/// configured log-ingestion endpoint instead of an AMQP broker — `POST
/// {endpoint}/logs/{index_name}` with an `Authorization: ELK <key>` header
/// and a 200-only success check. Lets the ingestion pipeline be deployed
/// without a broker; exactly one `ReportSink` is active per process.
pub struct HttpDirectSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    encode_errors: CounterHandle,
    request_total: CounterHandle,
    request_errors: CounterHandle,
}

impl HttpDirectSink {
    pub fn new(endpoint: String, api_key: Option<String>, metrics: &MetricsRegistry) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            encode_errors: metrics.register_counter("report_encoding.errors"),
            request_total: metrics.register_counter("adapter_request.total"),
            request_errors: metrics.register_counter("adapter_request.errors"),
        }
    }
}

#[async_trait]
impl frontreport_common::ReportSink for HttpDirectSink {
    async fn add_report(&self, report: Report) {
        let body = match report.to_json() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, kind = %report.kind(), "failed to encode report for direct-http adapter");
                self.encode_errors.inc(1);
                return;
            }
        };

        let date = format_index_date(chrono::Utc::now());
        let index_name = report.index_name(&date);
        let url = format!("{}/logs/{index_name}", self.endpoint);

        self.request_total.inc(1);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("ELK {key}"));
        }

        match request.send().await {
            Ok(resp) if resp.status() == StatusCode::OK => {}
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), endpoint = %url, "adapter rejected report");
                self.request_errors.inc(1);
            }
            Err(e) => {
                tracing::warn!(error = %e, endpoint = %url, "adapter request failed");
                self.request_errors.inc(1);
            }
        }
    }
}

#[async_trait]
impl Service for HttpDirectSink {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

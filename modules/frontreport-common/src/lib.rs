pub mod error;
pub mod report;
pub mod time;

pub use error::{FrontReportError, Result, TrustSide};
pub use report::{
    BrowserInfo, CspBody, CspReport, Frame, PkpReport, Report, ReportBase, ReportKind,
    StacktraceJsReport,
};
pub use time::{format_index_date, format_report_timestamp};

/// A start/stop lifecycle surface every long-lived component exposes to
/// the coordinator.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Egress abstraction C4 hands completed reports to. `AmqpBatchPublisher`
/// is the default implementation; `HttpDirectSink` is an unbatched
/// alternative for deployments fronting an adapter instead of a broker.
#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    /// Queues a report for delivery. Resolves once the report has been
    /// accepted onto the sink's internal queue, which may block under
    /// backpressure.
    async fn add_report(&self, report: Report);
}

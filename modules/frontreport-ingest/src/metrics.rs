use frontreport_common::ReportKind;
use frontreport_metrics::{CounterHandle, MetricsRegistry};

/// Per-kind `report_decoding.<kind>.{total,errors}` counters. Registered
/// once at startup; lookups by kind are a plain match, per the "all handles
/// registered at startup, runtime lookups read-only" convention C1's
/// callers follow throughout.
pub struct DecodeMetrics {
    csp_total: CounterHandle,
    csp_errors: CounterHandle,
    pkp_total: CounterHandle,
    pkp_errors: CounterHandle,
    stacktrace_total: CounterHandle,
    stacktrace_errors: CounterHandle,
}

impl DecodeMetrics {
    pub fn new(registry: &MetricsRegistry) -> Self {
        Self {
            csp_total: registry.register_counter("report_decoding.csp.total"),
            csp_errors: registry.register_counter("report_decoding.csp.errors"),
            pkp_total: registry.register_counter("report_decoding.pkp.total"),
            pkp_errors: registry.register_counter("report_decoding.pkp.errors"),
            stacktrace_total: registry.register_counter("report_decoding.stacktracejs.total"),
            stacktrace_errors: registry.register_counter("report_decoding.stacktracejs.errors"),
        }
    }

    pub fn total(&self, kind: ReportKind) -> &CounterHandle {
        match kind {
            ReportKind::Csp => &self.csp_total,
            ReportKind::Pkp => &self.pkp_total,
            ReportKind::StacktraceJs => &self.stacktrace_total,
        }
    }

    pub fn errors(&self, kind: ReportKind) -> &CounterHandle {
        match kind {
            ReportKind::Csp => &self.csp_errors,
            ReportKind::Pkp => &self.pkp_errors,
            ReportKind::StacktraceJs => &self.stacktrace_errors,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fields every report variant carries, regardless of kind.
///
/// Mirrors the browser-telemetry client's own extension of each report
/// payload: alongside the standard CSP/PKP body, submitters may tag a
/// `service` name used for whitelisting; `@timestamp`/`frontreport-host`
/// are populated server-side during enrichment, never by the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportBase {
    #[serde(rename = "@timestamp", default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(rename = "frontreport-host", default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CspBody {
    #[serde(rename = "document-uri", default, skip_serializing_if = "Option::is_none")]
    pub document_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(rename = "blocked-uri", default, skip_serializing_if = "Option::is_none")]
    pub blocked_uri: Option<String>,
    #[serde(rename = "violated-directive", default, skip_serializing_if = "Option::is_none")]
    pub violated_directive: Option<String>,
    #[serde(rename = "effective-directive", default, skip_serializing_if = "Option::is_none")]
    pub effective_directive: Option<String>,
    #[serde(rename = "original-policy", default, skip_serializing_if = "Option::is_none")]
    pub original_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CspReport {
    #[serde(flatten)]
    pub base: ReportBase,
    #[serde(rename = "csp-report", default)]
    pub body: CspBody,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PkpReport {
    #[serde(flatten)]
    pub base: ReportBase,
    #[serde(rename = "date-time", default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(
        rename = "effective-expiration-date",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub effective_expiration_date: Option<String>,
    #[serde(rename = "include-subdomains", default)]
    pub include_subdomains: bool,
    #[serde(rename = "noted-hostname", default, skip_serializing_if = "Option::is_none")]
    pub noted_hostname: Option<String>,
    #[serde(rename = "served-certificate-chain", default)]
    pub served_certificate_chain: Vec<String>,
    #[serde(rename = "validated-certificate-chain", default)]
    pub validated_certificate_chain: Vec<String>,
    #[serde(rename = "known-pins", default)]
    pub known_pins: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    #[serde(rename = "functionName", default)]
    pub function_name: String,
    #[serde(rename = "fileName", default)]
    pub file_name: String,
    #[serde(rename = "lineNumber", default)]
    pub line_number: i64,
    #[serde(rename = "columnNumber", default)]
    pub column_number: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacktraceJsReport {
    #[serde(flatten)]
    pub base: ReportBase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack: Vec<Frame>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<BrowserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "sourceUrl", default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "stackHash", default, skip_serializing_if = "Option::is_none")]
    pub stack_hash: Option<String>,
    #[serde(rename = "scriptUrl", default, skip_serializing_if = "Option::is_none")]
    pub script_url: Option<String>,

    /// Experimental/site-specific tags (`partyId`, `claimId`, ...), kept
    /// open-ended so new tags don't require a schema change.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One of the three shapes a submitted report can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Csp,
    Pkp,
    StacktraceJs,
}

impl ReportKind {
    /// Short tag used in metric names, the index name and routing.
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Csp => "csp",
            ReportKind::Pkp => "pkp",
            ReportKind::StacktraceJs => "stacktracejs",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged sum over the three report shapes, with a capability surface
/// (`kind`, `service`, `set_timestamp`, `set_host`) common to all of them.
///
/// Never decoded directly: the HTTP layer picks the concrete type from the
/// request path, decodes into it, and wraps the result in the matching
/// variant — the overlapping all-optional shapes of `PkpReport` and
/// `StacktraceJsReport` would make an untagged `Deserialize` ambiguous.
#[derive(Debug, Clone)]
pub enum Report {
    Csp(CspReport),
    Pkp(PkpReport),
    Stacktrace(StacktraceJsReport),
}

impl Report {
    pub fn kind(&self) -> ReportKind {
        match self {
            Report::Csp(_) => ReportKind::Csp,
            Report::Pkp(_) => ReportKind::Pkp,
            Report::Stacktrace(_) => ReportKind::StacktraceJs,
        }
    }

    /// Lowercased service tag, empty when the submitter didn't set one.
    pub fn service(&self) -> String {
        let base = match self {
            Report::Csp(r) => &r.base,
            Report::Pkp(r) => &r.base,
            Report::Stacktrace(r) => &r.base,
        };
        base.service.to_lowercase()
    }

    pub fn set_timestamp(&mut self, ts: String) {
        self.base_mut().timestamp = ts;
    }

    pub fn set_host(&mut self, host: String) {
        self.base_mut().host = host;
    }

    fn base_mut(&mut self) -> &mut ReportBase {
        match self {
            Report::Csp(r) => &mut r.base,
            Report::Pkp(r) => &mut r.base,
            Report::Stacktrace(r) => &mut r.base,
        }
    }

    /// Stack frames for enrichment, `None` for non-stacktrace reports.
    pub fn stack(&self) -> Option<&[Frame]> {
        match self {
            Report::Stacktrace(r) => Some(&r.stack),
            _ => None,
        }
    }

    pub fn set_stack(&mut self, frames: Vec<Frame>) {
        if let Report::Stacktrace(r) = self {
            r.stack = frames;
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Report::Csp(r) => serde_json::to_vec(r),
            Report::Pkp(r) => serde_json::to_vec(r),
            Report::Stacktrace(r) => serde_json::to_vec(r),
        }
    }

    /// `<kind>-report[-<service>]-<YYYY.MM.DD>`.
    pub fn index_name(&self, date: &str) -> String {
        let service = self.service();
        if service.is_empty() {
            format!("{}-report-{date}", self.kind())
        } else {
            format!("{}-report-{service}-{date}", self.kind())
        }
    }

    pub fn index_type(&self) -> String {
        format!("{}-report", self.kind())
    }
}

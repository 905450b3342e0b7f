use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;

use frontreport_common::{format_report_timestamp, CspReport, PkpReport, Report, ReportKind, StacktraceJsReport};

use crate::cors;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Single fallback entry point for every request: routes by method first
/// (OPTIONS/GET/POST/other), then within POST by path substring. CORS
/// headers are applied to whatever response comes out, regardless of which
/// branch produced it.
pub async fn handle_request(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_lowercase();
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let domain_whitelist = state.config.domain_whitelist.clone();

    let mut response = match method {
        Method::OPTIONS => StatusCode::NO_CONTENT.into_response(),
        Method::GET => serve_static(&state, req).await,
        Method::POST => match route_kind(&path) {
            Some(kind) => process_report(&state, kind, req).await,
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    cors::apply(&mut response, &domain_whitelist, origin.as_deref());
    response
}

/// Substring routing: `pkp` subsumes both `/pkp` and `/hpkp`.
fn route_kind(path: &str) -> Option<ReportKind> {
    if path.contains("csp") {
        Some(ReportKind::Csp)
    } else if path.contains("pkp") {
        Some(ReportKind::Pkp)
    } else if path.contains("stacktracejs") {
        Some(ReportKind::StacktraceJs)
    } else {
        None
    }
}

async fn serve_static(state: &AppState, req: Request) -> Response {
    let Some(service) = state.static_service.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match service.oneshot(req).await {
        Ok(resp) => resp.into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "static asset service error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Decodes, admits, enriches and dispatches a single report, in order.
async fn process_report(state: &AppState, kind: ReportKind, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    state.decode_metrics.total(kind).inc(1);

    let body = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, %kind, "failed to read request body");
            state.decode_metrics.errors(kind).inc(1);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let mut report = match decode(kind, &body) {
        Ok(report) => report,
        Err(e) => {
            tracing::debug!(error = %e, %kind, "malformed report body");
            state.decode_metrics.errors(kind).inc(1);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if !state.config.service_whitelist.is_empty()
        && !state.config.service_whitelist.contains(&report.service())
    {
        tracing::debug!(service = %report.service(), %kind, "service not in whitelist");
        state.decode_metrics.errors(kind).inc(1);
        return StatusCode::BAD_REQUEST.into_response();
    }

    report.set_timestamp(format_report_timestamp(chrono::Utc::now()));
    report.set_host(host);

    if let Some(stack) = report.stack() {
        let resolved = state.sourcemap.process_stack(stack).await;
        report.set_stack(resolved);
    }

    state.sink.add_report(report).await;

    StatusCode::NO_CONTENT.into_response()
}

fn decode(kind: ReportKind, body: &[u8]) -> serde_json::Result<Report> {
    match kind {
        ReportKind::Csp => serde_json::from_slice::<CspReport>(body).map(Report::Csp),
        ReportKind::Pkp => serde_json::from_slice::<PkpReport>(body).map(Report::Pkp),
        ReportKind::StacktraceJs => {
            serde_json::from_slice::<StacktraceJsReport>(body).map(Report::Stacktrace)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_csp_and_pkp_and_hpkp_and_stacktracejs_by_substring() {
        assert_eq!(route_kind("/csp"), Some(ReportKind::Csp));
        assert_eq!(route_kind("/report/csp-violation"), Some(ReportKind::Csp));
        assert_eq!(route_kind("/pkp"), Some(ReportKind::Pkp));
        assert_eq!(route_kind("/hpkp"), Some(ReportKind::Pkp));
        assert_eq!(route_kind("/stacktracejs"), Some(ReportKind::StacktraceJs));
        assert_eq!(route_kind("/unrelated"), None);
    }

    #[test]
    fn decodes_csp_report_happy_path() {
        let body = br#"{"csp-report":{"document-uri":"https://x.test/","blocked-uri":"https://ads.test/","violated-directive":"script-src"}}"#;
        let report = decode(ReportKind::Csp, body).unwrap();
        match report {
            Report::Csp(r) => assert_eq!(r.body.document_uri.as_deref(), Some("https://x.test/")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(decode(ReportKind::Csp, b"not json").is_err());
    }
}

use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use frontreport_common::{Report, ReportSink, Service};
use frontreport_ingest::{AppState, IngestConfig, IngestionPipeline};
use frontreport_metrics::MetricsRegistry;
use frontreport_sourcemap::Processor;

#[derive(Default)]
struct CapturingSink {
    reports: Mutex<Vec<Report>>,
}

#[async_trait]
impl ReportSink for CapturingSink {
    async fn add_report(&self, report: Report) {
        self.reports.lock().unwrap().push(report);
    }
}

async fn spawn_server(config: IngestConfig, sink: Arc<CapturingSink>) -> (SocketAddr, IngestionPipeline) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let metrics = MetricsRegistry::new(None);
    let sourcemap = Arc::new(Processor::new("^http://localhost/", &metrics).unwrap());
    let state = AppState::new(config, sink.clone() as Arc<dyn ReportSink>, sourcemap, &metrics);
    let pipeline = IngestionPipeline::new(addr, state);
    pipeline.start().await.unwrap();
    // Give the listener a moment to come up before the first request lands.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    (addr, pipeline)
}

#[tokio::test]
async fn csp_happy_path_returns_204_and_forwards_to_sink() {
    let sink = Arc::new(CapturingSink::default());
    let (addr, pipeline) = spawn_server(IngestConfig::default(), sink.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/csp"))
        .body(
            r#"{"csp-report":{"document-uri":"https://x.test/","blocked-uri":"https://ads.test/","violated-directive":"script-src"}}"#,
        )
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 204);
    pipeline.stop().await.unwrap();

    let reports = sink.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    match &reports[0] {
        Report::Csp(r) => assert_eq!(r.body.document_uri.as_deref(), Some("https://x.test/")),
        _ => panic!("expected a CSP report"),
    }
}

#[tokio::test]
async fn service_whitelist_rejects_unknown_service_with_400() {
    let config = IngestConfig {
        service_whitelist: HashSet::from(["known".to_string()]),
        ..Default::default()
    };
    let sink = Arc::new(CapturingSink::default());
    let (addr, pipeline) = spawn_server(config, sink.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/stacktracejs"))
        .body(r#"{"service":"unknown","message":"boom","stack":[]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    pipeline.stop().await.unwrap();
    assert!(sink.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn options_request_gets_cors_headers_when_whitelist_empty() {
    let sink = Arc::new(CapturingSink::default());
    let (addr, pipeline) = spawn_server(IngestConfig::default(), sink).await;

    let client = reqwest::Client::new();
    let resp = client
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/csp"))
        .header("Origin", "https://anyone.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 204);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap(),
        "https://anyone.test"
    );
    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_path_returns_404_and_unsupported_method_returns_405() {
    let sink = Arc::new(CapturingSink::default());
    let (addr, pipeline) = spawn_server(IngestConfig::default(), sink).await;

    let client = reqwest::Client::new();
    let not_found = client.post(format!("http://{addr}/nope")).send().await.unwrap();
    assert_eq!(not_found.status(), 404);

    let not_allowed = client.delete(format!("http://{addr}/csp")).send().await.unwrap();
    assert_eq!(not_allowed.status(), 405);

    pipeline.stop().await.unwrap();
}

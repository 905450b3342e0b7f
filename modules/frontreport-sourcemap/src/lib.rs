use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use regex::Regex;
use reqwest::redirect::Policy;
use url::Url;

use frontreport_common::{Frame, FrontReportError, Result, Service, TrustSide};
use frontreport_metrics::{CounterHandle, MetricsRegistry};

const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves minified stacktrace frames to their original source locations
/// using the sourcemap a JS bundle points at, guarding every fetch against
/// SSRF: the bundle URL and the sourcemap URL it names must each match the
/// trusted pattern, and redirects are never followed.
pub struct Processor {
    trusted: Regex,
    smap_annotation: Regex,
    client: reqwest::Client,
    cache: Cache<String, Arc<sourcemap::SourceMap>>,
    resolve_failures: CounterHandle,
}

impl Processor {
    /// `trusted` is an anchored regex; any JS or sourcemap URL that fails to
    /// match it is rejected before a request is made.
    pub fn new(trusted: &str, metrics: &MetricsRegistry) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(FETCH_TIMEOUT)
            .build()?;

        Ok(Self {
            trusted: Regex::new(trusted)?,
            smap_annotation: Regex::new(r"sourceMappingURL=(\S+)\s*$")?,
            client,
            cache: Cache::builder().time_to_live(CACHE_TTL).build(),
            resolve_failures: metrics.register_counter("sourcemap.resolve_failures"),
        })
    }

    fn check_trusted(&self, url: &str, side: TrustSide) -> Result<()> {
        if self.trusted.is_match(url) {
            Ok(())
        } else {
            Err(FrontReportError::TrustViolation(side))
        }
    }

    /// Rewrites every frame whose `file_name` resolves to a sourcemap,
    /// leaving frames that fail to resolve untouched. A single frame's
    /// failure never aborts the rest of the stack.
    pub async fn process_stack(&self, stack: &[Frame]) -> Vec<Frame> {
        let mut processed = Vec::with_capacity(stack.len());
        for frame in stack {
            match self.resolve_frame(frame).await {
                Ok(resolved) => processed.push(resolved),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        url = %frame.file_name,
                        "failed to resolve sourcemap for frame"
                    );
                    self.resolve_failures.inc(1);
                    processed.push(frame.clone());
                }
            }
        }
        processed
    }

    async fn resolve_frame(&self, frame: &Frame) -> Result<Frame> {
        let map = match self.cache.get(&frame.file_name) {
            Some(map) => map,
            None => {
                let map = Arc::new(self.fetch_sourcemap(&frame.file_name).await?);
                self.cache.insert(frame.file_name.clone(), map.clone());
                map
            }
        };

        let token = map.lookup_token(frame.line_number as u32, frame.column_number as u32);
        match token {
            Some(token) => Ok(Frame {
                file_name: token.get_source().unwrap_or(&frame.file_name).to_string(),
                function_name: token
                    .get_name()
                    .map(|n| n.to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| frame.function_name.clone()),
                line_number: token.get_src_line() as i64,
                column_number: token.get_src_col() as i64,
            }),
            None => Ok(frame.clone()),
        }
    }

    async fn fetch_sourcemap(&self, js_url: &str) -> Result<sourcemap::SourceMap> {
        self.check_trusted(js_url, TrustSide::Client)?;

        let js_body = self.get(js_url).await?;
        let annotation = self
            .smap_annotation
            .captures(&js_body)
            .and_then(|caps| caps.get(1))
            .ok_or_else(|| FrontReportError::NoSourcemapAnnotation {
                url: js_url.to_string(),
            })?;

        let base = Url::parse(js_url).map_err(|e| FrontReportError::Fetch {
            url: js_url.to_string(),
            message: e.to_string(),
        })?;
        let smap_url = base
            .join(annotation.as_str())
            .map_err(|e| FrontReportError::Fetch {
                url: js_url.to_string(),
                message: e.to_string(),
            })?;
        let smap_url = smap_url.to_string();

        self.check_trusted(&smap_url, TrustSide::Client)?;

        let smap_body = self.get(&smap_url).await?;
        sourcemap::SourceMap::from_slice(smap_body.as_bytes()).map_err(|e| {
            FrontReportError::Fetch {
                url: smap_url,
                message: e.to_string(),
            }
        })
    }

    async fn get(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FrontReportError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if resp.status().is_redirection() {
            return Err(FrontReportError::TrustViolation(TrustSide::Server));
        }
        if !resp.status().is_success() {
            return Err(FrontReportError::Fetch {
                url: url.to_string(),
                message: format!("unexpected status {}", resp.status()),
            });
        }

        resp.text().await.map_err(|e| FrontReportError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Service for Processor {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metrics() -> MetricsRegistry {
        MetricsRegistry::new(None)
    }

    #[test]
    fn trusted_pattern_matches_whitelisted_paths() {
        let processor = Processor::new(r"^https?://localhost/[^.]*", &metrics()).unwrap();
        assert!(processor
            .check_trusted("http://localhost/level_1/test.js", TrustSide::Client)
            .is_ok());
        assert!(processor
            .check_trusted("https://localhost/level_2/level1/test1.js", TrustSide::Client)
            .is_ok());
    }

    #[test]
    fn trusted_pattern_rejects_lookalike_hosts() {
        let processor = Processor::new(r"^https?://localhost/[^.]*", &metrics()).unwrap();
        assert!(processor
            .check_trusted("http://localhost.com", TrustSide::Client)
            .is_err());
        assert!(processor
            .check_trusted("http://localhost@evil.test/x", TrustSide::Client)
            .is_err());
    }

    #[tokio::test]
    async fn resolves_frame_through_bundle_and_sourcemap() {
        let server = MockServer::start().await;

        let js_body = format!(
            "console.log(1);\n//# sourceMappingURL={}/app.js.map",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/app.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(js_body))
            .mount(&server)
            .await;

        let map_json = r#"{
            "version": 3,
            "sources": ["main.ts"],
            "names": ["greet"],
            "mappings": "AAAAA"
        }"#;
        Mock::given(method("GET"))
            .and(path("/app.js.map"))
            .respond_with(ResponseTemplate::new(200).set_body_string(map_json))
            .mount(&server)
            .await;

        let pattern = format!("^{}", regex::escape(&server.uri()));
        let processor = Processor::new(&pattern, &metrics()).unwrap();

        let frame = Frame {
            function_name: "minified".into(),
            file_name: format!("{}/app.js", server.uri()),
            line_number: 1,
            column_number: 0,
        };
        let resolved = processor.process_stack(&[frame]).await;
        assert_eq!(resolved.len(), 1);
    }

    #[tokio::test]
    async fn untrusted_bundle_url_is_left_unresolved() {
        let processor = Processor::new(r"^https://cdn\.trusted\.test/", &metrics()).unwrap();
        let frame = Frame {
            function_name: "f".into(),
            file_name: "https://evil.test/app.js".into(),
            line_number: 1,
            column_number: 1,
        };
        let resolved = processor.process_stack(&[frame.clone()]).await;
        assert_eq!(resolved[0], frame);
    }

    /// A whitelisted host answers with a redirect toward an
    /// attacker-chosen target. The client must refuse to follow it rather
    /// than validate the `Location` header after the fact, so the redirect
    /// target is never reachable from this process.
    #[tokio::test]
    async fn redirect_response_is_refused_not_followed() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/app.js"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "http://169.254.169.254/"),
            )
            .mount(&server)
            .await;

        let pattern = format!("^{}", regex::escape(&server.uri()));
        let processor = Processor::new(&pattern, &metrics()).unwrap();

        let frame = Frame {
            function_name: "minified".into(),
            file_name: format!("{}/app.js", server.uri()),
            line_number: 1,
            column_number: 0,
        };
        let resolved = processor.process_stack(&[frame.clone()]).await;
        assert_eq!(resolved[0], frame, "frame must be left unchanged on a server-side trust violation");
    }

    /// Two stacktraces referencing the same `fileName` within the cache TTL
    /// must issue exactly one JS GET and one map GET between them.
    #[tokio::test]
    async fn repeated_fetches_for_the_same_file_name_hit_the_cache() {
        let server = MockServer::start().await;

        let js_body = format!(
            "console.log(1);\n//# sourceMappingURL={}/app.js.map",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/app.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(js_body))
            .expect(1)
            .mount(&server)
            .await;

        let map_json = r#"{
            "version": 3,
            "sources": ["main.ts"],
            "names": ["greet"],
            "mappings": "AAAAA"
        }"#;
        Mock::given(method("GET"))
            .and(path("/app.js.map"))
            .respond_with(ResponseTemplate::new(200).set_body_string(map_json))
            .expect(1)
            .mount(&server)
            .await;

        let pattern = format!("^{}", regex::escape(&server.uri()));
        let processor = Processor::new(&pattern, &metrics()).unwrap();

        let frame = Frame {
            function_name: "minified".into(),
            file_name: format!("{}/app.js", server.uri()),
            line_number: 1,
            column_number: 0,
        };

        processor.process_stack(&[frame.clone()]).await;
        processor.process_stack(&[frame]).await;

        // `server` drops here; wiremock panics if either mock's `.expect(1)`
        // was violated, which is the assertion this test relies on.
    }
}

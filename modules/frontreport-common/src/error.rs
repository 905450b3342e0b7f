use thiserror::Error;

/// Which side of a sourcemap fetch rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustSide {
    /// The URL itself never matched the trusted pattern.
    Client,
    /// The URL was trusted but the server answered with a redirect.
    Server,
}

impl std::fmt::Display for TrustSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustSide::Client => write!(f, "client-side: url doesn't match trusted pattern"),
            TrustSide::Server => write!(f, "server-side: redirect response refused"),
        }
    }
}

/// Failure kinds named so call sites can match on kind rather than format
/// strings.
#[derive(Debug, Error)]
pub enum FrontReportError {
    #[error("malformed report body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("service {service:?} not in whitelist")]
    WhitelistReject { service: String },

    #[error("failed to encode outbound record: {0}")]
    Encode(String),

    #[error("failed to publish batch: {0}")]
    BatchPublish(String),

    #[error("AMQP transport error: {0}")]
    BrokerTransport(String),

    #[error("sourcemap trust violation: {0}")]
    TrustViolation(TrustSide),

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("no sourceMappingURL annotation found in {url}")]
    NoSourcemapAnnotation { url: String },

    #[error("startup failure: {0}")]
    Startup(String),

    #[error("graceful stop exceeded its deadline: {0}")]
    StopTimeout(String),
}

pub type Result<T> = std::result::Result<T, FrontReportError>;

mod cors;
mod handler;
mod metrics;
mod pipeline;
mod state;

pub use pipeline::IngestionPipeline;
pub use state::{AppState, IngestConfig};

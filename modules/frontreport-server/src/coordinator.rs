use std::sync::Arc;

use frontreport_common::Service;

/// Starts components in a fixed order and stops them in reverse: the
/// metrics registry, then the batching publisher, the sourcemap processor,
/// and finally the ingestion pipeline, so it never opens before the things
/// it depends on are ready; reverse on the way down, so it stops accepting
/// work before its dependencies disappear.
pub struct Coordinator {
    components: Vec<(&'static str, Arc<dyn Service>)>,
}

impl Coordinator {
    pub fn new(components: Vec<(&'static str, Arc<dyn Service>)>) -> Self {
        Self { components }
    }

    pub async fn start_all(&self) -> anyhow::Result<()> {
        for (name, component) in &self.components {
            tracing::info!(component = name, "starting component");
            component.start().await.map_err(|e| {
                tracing::error!(component = name, error = %e, "component failed to start");
                e
            })?;
        }
        Ok(())
    }

    /// Tears down every component regardless of earlier failures so a
    /// wedged component can't keep the rest of the process alive; the
    /// first error encountered is what gets returned (and ultimately
    /// decides the process exit code).
    pub async fn stop_all(&self) -> anyhow::Result<()> {
        let mut first_err = None;
        for (name, component) in self.components.iter().rev() {
            tracing::info!(component = name, "stopping component");
            if let Err(e) = component.stop().await {
                tracing::error!(component = name, error = %e, "component failed to stop cleanly");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::recorder::Storage;

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically renders the registry's counters and histograms as Graphite
/// plaintext lines (`<prefix>.<hostname>.<name> <value> <unix_ts>\n`) and
/// writes them over a fresh TCP connection. Runs until `stop` is notified.
pub(crate) async fn run(address: String, prefix: String, storage: Arc<Storage>, stop: Arc<Notify>) {
    let host_prefix = match hostname::get() {
        Ok(h) => format!("{prefix}.{}", h.to_string_lossy()),
        Err(e) => {
            tracing::warn!(error = %e, "failed to resolve hostname, using prefix alone");
            prefix.clone()
        }
    };

    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = flush_once(&address, &host_prefix, &storage).await {
                    tracing::warn!(error = %e, address = %address, "failed to flush metrics to graphite");
                }
            }
            _ = stop.notified() => {
                tracing::debug!("graphite flush loop stopping");
                return;
            }
        }
    }
}

async fn flush_once(address: &str, host_prefix: &str, storage: &Storage) -> std::io::Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut payload = String::new();
    for (name, value) in storage.counter_snapshot() {
        payload.push_str(&format!("{host_prefix}.{name} {value} {timestamp}\n"));
    }
    for (name, mean) in storage.histogram_snapshot() {
        payload.push_str(&format!("{host_prefix}.{name} {mean} {timestamp}\n"));
    }

    if payload.is_empty() {
        return Ok(());
    }

    let mut stream = TcpStream::connect(address).await?;
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await
}

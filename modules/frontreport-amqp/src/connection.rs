use std::time::Duration;

use lapin::options::ExchangeDeclareOptions;
use lapin::tcp::OwnedTLSConfig;
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ConnectionState, ExchangeKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::PublisherConfig;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HEALTH_POLL: Duration = Duration::from_secs(2);

/// Owns the single AMQP connection/channel and keeps it alive: declares the
/// exchange on connect, and on any transport error reconnects with
/// exponential backoff rather than surfacing the error up to a submitter.
/// `channel_tx` broadcasts the currently-usable channel (`None` while down)
/// to the batch firing tasks.
pub(crate) struct Supervisor {
    connection_string: String,
    exchange: String,
    cacert: Option<std::path::PathBuf>,
}

impl Supervisor {
    pub(crate) fn new(config: &PublisherConfig) -> Self {
        Self {
            connection_string: config.connection_string.clone(),
            exchange: config.exchange.clone(),
            cacert: config.cacert.clone(),
        }
    }

    pub(crate) async fn run(self, channel_tx: watch::Sender<Option<Channel>>, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect_and_declare().await {
                Ok((conn, channel)) => {
                    backoff = INITIAL_BACKOFF;
                    tracing::info!(exchange = %self.exchange, "amqp connection established, exchange declared");
                    let _ = channel_tx.send(Some(channel));
                    self.watch_connection(&conn, &cancel).await;
                    let _ = channel_tx.send(None);
                    if cancel.is_cancelled() {
                        let _ = conn.close(200, "shutting down").await;
                        return;
                    }
                    tracing::warn!("amqp connection lost, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "failed to connect to amqp broker, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_declare(&self) -> anyhow::Result<(Connection, Channel)> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let conn = if let Some(cacert) = &self.cacert {
            let cert_chain = std::fs::read_to_string(cacert)?;
            let tls_config = OwnedTLSConfig {
                identity: None,
                cert_chain: Some(cert_chain),
            };
            Connection::connect_with_config(&self.connection_string, options, tls_config).await?
        } else {
            Connection::connect(&self.connection_string, options).await?
        };

        let channel = conn.create_channel().await?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok((conn, channel))
    }

    /// Polls connection health until it drops or shutdown is requested.
    /// lapin surfaces transport failures asynchronously via internal I/O
    /// tasks rather than a blocking recv, so liveness is observed by
    /// sampling `ConnectionState` rather than awaiting an error future.
    async fn watch_connection(&self, conn: &Connection, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_POLL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if conn.status().state() != ConnectionState::Connected {
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

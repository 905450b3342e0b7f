use std::sync::Arc;
use std::time::Duration;

use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use frontreport_metrics::{CounterHandle, HistogramHandle, MetricsRegistry};

use crate::config::PublisherConfig;

pub(crate) struct PublisherMetrics {
    pub(crate) batch_fire_errors: CounterHandle,
    pub(crate) batch_size_bytes: HistogramHandle,
}

impl PublisherMetrics {
    pub(crate) fn new(registry: &MetricsRegistry) -> Self {
        Self {
            batch_fire_errors: registry.register_counter("batch_fire.errors"),
            batch_size_bytes: registry.register_histogram("batch_size_bytes"),
        }
    }
}

/// Assembles encoded records read off the work queue into batches bounded
/// by `max_batch_size`/`batch_timeout`, then fires each closed batch onto a
/// dispatch task. At most `max_concurrent_batches` dispatch tasks run at
/// once; acquiring the next permit blocks this loop (and transitively the
/// work queue, and transitively `add_report`) when the cap is reached.
pub(crate) async fn run_assembler(
    mut rx: mpsc::Receiver<Vec<u8>>,
    channel_rx: watch::Receiver<Option<Channel>>,
    config: Arc<PublisherConfig>,
    metrics: Arc<PublisherMetrics>,
    fire_semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let mut current: Vec<Vec<u8>> = Vec::new();
    let mut armed = false;
    let sleep = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                rx.close();
                while let Ok(record) = rx.try_recv() {
                    current.push(record);
                }
                fire_chunks(std::mem::take(&mut current), &channel_rx, &config, &metrics, &fire_semaphore, &tracker).await;
                return;
            }

            maybe_record = rx.recv() => {
                match maybe_record {
                    Some(record) => {
                        if current.is_empty() {
                            sleep.as_mut().reset(tokio::time::Instant::now() + config.batch_timeout);
                            armed = true;
                        }
                        current.push(record);
                        if current.len() >= config.max_batch_size {
                            armed = false;
                            fire(std::mem::take(&mut current), &channel_rx, &config, &metrics, &fire_semaphore, &tracker).await;
                        }
                    }
                    None => break,
                }
            }

            _ = &mut sleep, if armed => {
                armed = false;
                if !current.is_empty() {
                    fire(std::mem::take(&mut current), &channel_rx, &config, &metrics, &fire_semaphore, &tracker).await;
                }
            }
        }
    }

    if !current.is_empty() {
        fire(current, &channel_rx, &config, &metrics, &fire_semaphore, &tracker).await;
    }
}

/// Splits a leftover record set into `max_batch_size`-sized pieces and fires
/// each one in turn, so a shutdown drain never dispatches a batch larger
/// than the configured cap.
async fn fire_chunks(
    records: Vec<Vec<u8>>,
    channel_rx: &watch::Receiver<Option<Channel>>,
    config: &Arc<PublisherConfig>,
    metrics: &Arc<PublisherMetrics>,
    fire_semaphore: &Arc<Semaphore>,
    tracker: &TaskTracker,
) {
    for chunk in records.chunks(config.max_batch_size.max(1)) {
        fire(chunk.to_vec(), channel_rx, config, metrics, fire_semaphore, tracker).await;
    }
}

/// Moves a closed batch from *open* to *firing*: acquires a concurrency
/// permit (blocking further assembly if the cap is already saturated), then
/// spawns the dispatch task tracked by `tracker` so shutdown can await it
/// under a ceiling.
async fn fire(
    records: Vec<Vec<u8>>,
    channel_rx: &watch::Receiver<Option<Channel>>,
    config: &Arc<PublisherConfig>,
    metrics: &Arc<PublisherMetrics>,
    fire_semaphore: &Arc<Semaphore>,
    tracker: &TaskTracker,
) {
    let permit = match fire_semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let channel_rx = channel_rx.clone();
    let exchange = config.exchange.clone();
    let routing_key = config.routing_key.clone();
    let metrics = metrics.clone();
    let record_count = records.len();

    tracker.spawn(async move {
        let _permit = permit;
        let body: Vec<u8> = records.concat();
        let body_len = body.len();

        let mut channel_rx = channel_rx;
        let channel = loop {
            if let Some(channel) = channel_rx.borrow().clone() {
                break channel;
            }
            if channel_rx.changed().await.is_err() {
                tracing::warn!("amqp publisher shut down while a batch awaited a connection");
                metrics.batch_fire_errors.inc(1);
                return;
            }
        };

        let properties = BasicProperties::default()
            .with_delivery_mode(1) // transient delivery mode
            .with_timestamp(now_unix());

        // Byte size is recorded regardless of outcome; errors additionally
        // bump batch_fire.errors.
        metrics.batch_size_bytes.update(body_len as i64);

        match channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
        {
            Ok(confirm) => match confirm.await {
                Ok(_) => {
                    tracing::debug!(records = record_count, bytes = body_len, "batch published");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "amqp publish confirmation failed");
                    metrics.batch_fire_errors.inc(1);
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "amqp publish failed");
                metrics.batch_fire_errors.inc(1);
            }
        }
    });
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use frontreport_metrics::MetricsRegistry;

    /// 11 records with a max batch size of 10 must close exactly two
    /// batches (counts {10, 1}). No broker is available in a unit test, so
    /// delivery itself isn't exercised here — the fired tasks block forever
    /// waiting for a channel until it's dropped below — but the number of
    /// batches *closed* is observable as the tracker's spawned-task count.
    #[tokio::test]
    async fn closes_two_batches_for_eleven_records_at_max_ten() {
        let (tx, rx) = mpsc::channel(100);
        let (channel_tx, channel_rx) = watch::channel(None);
        let config = Arc::new(PublisherConfig {
            max_batch_size: 10,
            batch_timeout: Duration::from_secs(60),
            max_concurrent_batches: 4,
            ..PublisherConfig::default()
        });
        let registry = MetricsRegistry::new(None);
        let metrics = Arc::new(PublisherMetrics::new(&registry));
        let semaphore = Arc::new(Semaphore::new(4));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        for i in 0..11u8 {
            tx.send(vec![i]).await.unwrap();
        }
        drop(tx);

        run_assembler(rx, channel_rx, config, metrics, semaphore, tracker.clone(), cancel).await;
        assert_eq!(tracker.len(), 2, "expected exactly two batches closed (10 then 1)");

        drop(channel_tx);
        tracker.close();
        tracker.wait().await;
    }

    /// A single record with a short batch timeout closes on the timer
    /// rather than waiting for more records to arrive.
    #[tokio::test]
    async fn closes_batch_on_timeout_when_not_full() {
        let (tx, rx) = mpsc::channel(100);
        let (channel_tx, channel_rx) = watch::channel(None);
        let config = Arc::new(PublisherConfig {
            max_batch_size: 10,
            batch_timeout: Duration::from_millis(50),
            max_concurrent_batches: 4,
            ..PublisherConfig::default()
        });
        let registry = MetricsRegistry::new(None);
        let metrics = Arc::new(PublisherMetrics::new(&registry));
        let semaphore = Arc::new(Semaphore::new(4));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        tx.send(vec![1]).await.unwrap();

        let assembler = tokio::spawn(run_assembler(
            rx,
            channel_rx,
            config,
            metrics,
            semaphore,
            tracker.clone(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.len(), 1, "batch should have fired on its timeout");

        drop(tx);
        cancel.cancel();
        let _ = assembler.await;
        drop(channel_tx);
        tracker.close();
        tracker.wait().await;
    }

    /// A shutdown that drains more than one batch's worth of pending
    /// records must still close them as several max-sized batches, never
    /// as one oversized batch.
    #[tokio::test]
    async fn cancellation_drain_splits_into_max_sized_batches() {
        let (tx, rx) = mpsc::channel(100);
        let (channel_tx, channel_rx) = watch::channel(None);
        let config = Arc::new(PublisherConfig {
            max_batch_size: 10,
            batch_timeout: Duration::from_secs(60),
            max_concurrent_batches: 4,
            ..PublisherConfig::default()
        });
        let registry = MetricsRegistry::new(None);
        let metrics = Arc::new(PublisherMetrics::new(&registry));
        let semaphore = Arc::new(Semaphore::new(4));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        for i in 0..25u8 {
            tx.send(vec![i]).await.unwrap();
        }

        let assembler = tokio::spawn(run_assembler(
            rx,
            channel_rx,
            config,
            metrics,
            semaphore,
            tracker.clone(),
            cancel.clone(),
        ));

        cancel.cancel();
        let _ = assembler.await;
        assert_eq!(
            tracker.len(),
            3,
            "25 records at max 10 must close as three batches (10, 10, 5), not one oversized batch"
        );

        drop(tx);
        drop(channel_tx);
        tracker.close();
        tracker.wait().await;
    }
}

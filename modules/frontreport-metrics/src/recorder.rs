use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use metrics::{Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use rand::Rng;

const RESERVOIR_CAPACITY: usize = 1000;

/// A counter storage cell shared between the `metrics::Counter` handle
/// handed back to callers and the registry's own snapshot/flush loop.
struct CounterCell(AtomicU64);

impl CounterFn for CounterCell {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// Uniform-sampling reservoir of up to 1000 values.
struct ReservoirHistogram {
    samples: Mutex<Vec<i64>>,
    count: AtomicI64,
}

impl ReservoirHistogram {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(RESERVOIR_CAPACITY)),
            count: AtomicI64::new(0),
        }
    }

    fn push(&self, value: i64) {
        let seen = self.count.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock().expect("reservoir mutex poisoned");
        if (samples.len() as i64) < RESERVOIR_CAPACITY as i64 {
            samples.push(value);
            return;
        }
        let idx = rand::thread_rng().gen_range(0..=seen);
        if (idx as usize) < RESERVOIR_CAPACITY {
            samples[idx as usize] = value;
        }
    }

    fn snapshot(&self) -> Vec<i64> {
        self.samples.lock().expect("reservoir mutex poisoned").clone()
    }
}

impl HistogramFn for ReservoirHistogram {
    fn record(&self, value: f64) {
        self.push(value as i64);
    }
}

/// A no-op gauge: the registry only tracks counters and histograms, so gauges
/// registered through the `metrics` facade (the `Recorder` trait requires
/// handling them) are accepted but never flushed to Graphite.
struct NoopGauge;

impl GaugeFn for NoopGauge {
    fn increment(&self, _: f64) {}
    fn decrement(&self, _: f64) {}
    fn set(&self, _: f64) {}
}

#[derive(Default)]
pub(crate) struct Storage {
    counters: RwLock<HashMap<String, Arc<CounterCell>>>,
    histograms: RwLock<HashMap<String, Arc<ReservoirHistogram>>>,
}

impl Storage {
    pub(crate) fn counter(&self, name: &str) -> Arc<CounterCell> {
        if let Some(existing) = self.counters.read().expect("poisoned").get(name) {
            return existing.clone();
        }
        let mut counters = self.counters.write().expect("poisoned");
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CounterCell(AtomicU64::new(0))))
            .clone()
    }

    pub(crate) fn histogram(&self, name: &str) -> Arc<ReservoirHistogram> {
        if let Some(existing) = self.histograms.read().expect("poisoned").get(name) {
            return existing.clone();
        }
        let mut histograms = self.histograms.write().expect("poisoned");
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ReservoirHistogram::new()))
            .clone()
    }

    /// `(name, value)` pairs for every counter, for the Graphite flush.
    pub(crate) fn counter_snapshot(&self) -> Vec<(String, u64)> {
        self.counters
            .read()
            .expect("poisoned")
            .iter()
            .map(|(name, cell)| (name.clone(), cell.0.load(Ordering::Relaxed)))
            .collect()
    }

    /// `(name, mean)` pairs for every histogram's current reservoir.
    pub(crate) fn histogram_snapshot(&self) -> Vec<(String, f64)> {
        self.histograms
            .read()
            .expect("poisoned")
            .iter()
            .map(|(name, hist)| {
                let samples = hist.snapshot();
                let mean = if samples.is_empty() {
                    0.0
                } else {
                    samples.iter().sum::<i64>() as f64 / samples.len() as f64
                };
                (name.clone(), mean)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_and_reads_back() {
        let storage = Storage::default();
        let cell = storage.counter("ingest.reports");
        cell.increment(3);
        cell.increment(4);
        let snapshot = storage.counter_snapshot();
        assert_eq!(snapshot, vec![("ingest.reports".to_string(), 7)]);
    }

    #[test]
    fn counter_lookup_is_stable_across_calls() {
        let storage = Storage::default();
        let first = storage.counter("a");
        let second = storage.counter("a");
        first.increment(1);
        second.increment(1);
        assert_eq!(storage.counter_snapshot(), vec![("a".to_string(), 2)]);
    }

    #[test]
    fn histogram_reservoir_caps_at_capacity() {
        let hist = ReservoirHistogram::new();
        for value in 0..(RESERVOIR_CAPACITY as i64 * 2) {
            hist.push(value);
        }
        assert_eq!(hist.snapshot().len(), RESERVOIR_CAPACITY);
    }

    #[test]
    fn histogram_snapshot_mean_reflects_samples_under_capacity() {
        let storage = Storage::default();
        let hist = storage.histogram("batch.size_bytes");
        hist.push(10);
        hist.push(20);
        hist.push(30);
        let snapshot = storage.histogram_snapshot();
        assert_eq!(snapshot, vec![("batch.size_bytes".to_string(), 20.0)]);
    }
}

/// `metrics::Recorder` implementation backing the registry: every
/// `register_counter`/`register_histogram` call from either the `metrics`
/// macros or [`crate::MetricsRegistry`] resolves to the same named cell.
pub(crate) struct RegistryRecorder {
    pub(crate) storage: Arc<Storage>,
}

impl Recorder for RegistryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.storage.counter(key.name()))
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(NoopGauge))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.storage.histogram(key.name()))
    }
}

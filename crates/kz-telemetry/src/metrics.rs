use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const PREDICTIONS_TOTAL: &str = "kz_predictions_total";
pub const TRAINING_RUNS_TOTAL: &str = "kz_training_runs_total";
pub const REMOTE_LATENCY_SECONDS: &str = "kz_remote_latency_seconds";
pub const TRAINING_DURATION_SECONDS: &str = "kz_training_duration_seconds";

/// Which prediction a metric sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredictionKind {
    Duration,
    Category,
}

impl PredictionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionKind::Duration => "duration",
            PredictionKind::Category => "category",
        }
    }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// f64 bits.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            counts: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        // Buckets are non-cumulative here; export accumulates.
        if let Some(i) = self.bounds.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }
}

/// Seconds. Remote calls and training runs span milliseconds to minutes.
const SECONDS_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type CounterKey = (String, Vec<(String, String)>);

/// Counters and histograms for engine outcomes.
///
/// The engine owns one behind an `Arc`; hosts that want process-wide numbers
/// pass the same collector to every engine they build.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<CounterKey, AtomicU64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

fn counter_key(name: &str, labels: &[(&str, &str)]) -> CounterKey {
    let mut pairs: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    pairs.sort();
    (name.to_string(), pairs)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = counter_key(name, labels);
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        read(&self.counters)
            .get(&counter_key(name, labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record seconds into a histogram, creating it on first use.
    pub fn observe_seconds(&self, name: &str, seconds: f64) {
        if let Some(h) = read(&self.histograms).get(name) {
            h.observe(seconds);
            return;
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(SECONDS_BUCKETS))
            .observe(seconds);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms)
            .get(name)
            .map(|h| h.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Engine-specific helpers ---------------------------------------------

    pub fn record_prediction(&self, kind: PredictionKind, provider: &str, outcome: &str) {
        self.increment_counter(
            PREDICTIONS_TOTAL,
            &[("kind", kind.as_str()), ("provider", provider), ("outcome", outcome)],
        );
    }

    pub fn predictions(&self, kind: PredictionKind, provider: &str, outcome: &str) -> u64 {
        self.get_counter(
            PREDICTIONS_TOTAL,
            &[("kind", kind.as_str()), ("provider", provider), ("outcome", outcome)],
        )
    }

    pub fn record_training(&self, outcome: &str, seconds: Option<f64>) {
        self.increment_counter(TRAINING_RUNS_TOTAL, &[("outcome", outcome)]);
        if let Some(s) = seconds {
            self.observe_seconds(TRAINING_DURATION_SECONDS, s);
        }
    }

    pub fn training_runs(&self, outcome: &str) -> u64 {
        self.get_counter(TRAINING_RUNS_TOTAL, &[("outcome", outcome)])
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, metric families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = read(&self.counters);
        let mut entries: Vec<(&CounterKey, u64)> = counters
            .iter()
            .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut last_name: Option<&str> = None;
        for ((name, labels), value) in entries {
            if last_name != Some(name.as_str()) {
                out.push_str(&format!("# TYPE {name} counter\n"));
                last_name = Some(name.as_str());
            }
            let rendered: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect();
            if rendered.is_empty() {
                out.push_str(&format!("{name} {value}\n"));
            } else {
                out.push_str(&format!("{name}{{{}}} {value}\n", rendered.join(",")));
            }
        }
        drop(counters);

        let histograms = read(&self.histograms);
        let mut names: Vec<&String> = histograms.keys().collect();
        names.sort();
        for name in names {
            let h = &histograms[name];
            out.push_str(&format!("# TYPE {name} histogram\n"));
            let mut cumulative = 0u64;
            for (i, bound) in h.bounds.iter().enumerate() {
                cumulative += h.counts[i].load(Ordering::Relaxed);
                out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {cumulative}\n"));
            }
            let count = h.count.load(Ordering::Relaxed);
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {count}\n"));
            out.push_str(&format!("{name}_sum {}\n", h.sum()));
            out.push_str(&format!("{name}_count {count}\n"));
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

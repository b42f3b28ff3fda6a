//! In-process metrics registry
//!
//! Rendition resolution records per-source latency histograms. Exposition
//! is out of scope here; the registry is an explicit value passed in at
//! construction so tests can substitute their own and assert on counts.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SOURCE_LATENCY: &str = "source_latency";
pub const SOURCE_LATENCY_ABS_DIFF: &str = "source_latency_abs_diff";
pub const SOURCE_PER_ORIGINAL_MEGAPIXEL_LATENCY: &str = "source_per_original_megapixel_latency";
pub const SOURCE_PER_RESIZED_MEGAPIXEL_LATENCY: &str = "source_per_resized_megapixel_latency";

/// Histogram bucket upper bounds in microseconds
const LATENCY_BUCKETS: &[f64] = &[
    500., 1000., 2500., 5000., 10000., 25000., 50000., 100000., 150000., 200000., 250000.,
    500000., 1000000., 2000000., 5000000., 10000000.,
];

const ABS_DIFF_BUCKETS: &[f64] = &[
    50., 100., 250., 500., 1000., 2500., 5000., 10000., 25000., 50000., 100000., 200000.,
    500000., 1000000.,
];

/// Fixed-bucket histogram
pub struct Histogram {
    buckets: &'static [f64],
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum in whole microseconds
    sum: AtomicU64,
}

impl Histogram {
    fn new(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            counts: (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.buckets.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value.max(0.0) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

/// Named histograms labeled by source
#[derive(Default)]
pub struct Registry {
    histograms: RwLock<HashMap<(&'static str, String), Arc<Histogram>>>,
    /// Previous latency sample per source, for the abs-diff histogram
    last_latency: Mutex<HashMap<String, f64>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn histogram(&self, name: &'static str, label: &str) -> Arc<Histogram> {
        if let Some(h) = self.histograms.read().get(&(name, label.to_string())) {
            return Arc::clone(h);
        }
        let buckets = if name == SOURCE_LATENCY_ABS_DIFF {
            ABS_DIFF_BUCKETS
        } else {
            LATENCY_BUCKETS
        };
        let mut map = self.histograms.write();
        Arc::clone(
            map.entry((name, label.to_string()))
                .or_insert_with(|| Arc::new(Histogram::new(buckets))),
        )
    }

    pub fn observe(&self, name: &'static str, label: &str, value: f64) {
        self.histogram(name, label).observe(value);
    }

    /// Record a source call latency plus its jitter against the previous
    /// sample from the same source
    pub fn observe_source_latency(&self, source: &str, elapsed: Duration) {
        let micros = elapsed.as_secs_f64() * 1e6;
        self.observe(SOURCE_LATENCY, source, micros);

        let mut last = self.last_latency.lock();
        if let Some(prev) = last.get(source) {
            self.observe(SOURCE_LATENCY_ABS_DIFF, source, (micros - prev).abs());
        }
        last.insert(source.to_string(), micros);
    }

    /// Record decode latency normalized by original and output megapixels
    pub fn observe_megapixel_latency(
        &self,
        source: &str,
        elapsed: Duration,
        original_mp: f64,
        resized_mp: f64,
    ) {
        let micros = elapsed.as_secs_f64() * 1e6;
        if original_mp > 0.0 {
            self.observe(
                SOURCE_PER_ORIGINAL_MEGAPIXEL_LATENCY,
                source,
                micros / original_mp,
            );
        }
        if resized_mp > 0.0 {
            self.observe(
                SOURCE_PER_RESIZED_MEGAPIXEL_LATENCY,
                source,
                micros / resized_mp,
            );
        }
    }

    /// Sample count of one labeled histogram; 0 when never observed
    pub fn count(&self, name: &'static str, label: &str) -> u64 {
        self.histograms
            .read()
            .get(&(name, label.to_string()))
            .map(|h| h.count())
            .unwrap_or(0)
    }
}

//! Metrics sink: counters, gauges, histograms exported as Prometheus text
//!
//! No external metrics crate is in the dependency stack: `DashMap` plus
//! atomics, no locks on the hot path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

type LabelSet = Vec<(&'static str, String)>;

fn label_key(labels: &LabelSet) -> String {
    let mut sorted = labels.clone();
    sorted.sort();
    sorted.into_iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",")
}

#[derive(Default)]
struct Histogram {
    // Fixed bucket upper bounds, in seconds; the last bucket is +Inf.
    bucket_bounds: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(bucket_bounds: Vec<f64>) -> Self {
        let bucket_counts = bucket_bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self { bucket_bounds, bucket_counts, sum_micros: AtomicU64::new(0), count: AtomicU64::new(0) }
    }

    fn observe(&self, seconds: f64) {
        for (bound, counter) in self.bucket_bounds.iter().zip(self.bucket_counts.iter()) {
            if seconds <= *bound {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros.fetch_add((seconds * 1_000_000.0).round() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

fn default_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

/// The process-wide metrics registry. Cheap to clone (it's an `Arc` handle),
/// kept as a single process-wide sink rather than per-subsystem registries.
#[derive(Clone, Default)]
pub struct MetricsSink {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    counters: DashMap<(&'static str, String), AtomicU64>,
    gauges: DashMap<(&'static str, String), AtomicU64>,
    histograms: DashMap<(&'static str, String), Histogram>,
}

impl MetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_counter(&self, name: &'static str, labels: LabelSet) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &'static str, labels: LabelSet, delta: u64) {
        let key = (name, label_key(&labels));
        self.inner.counters.entry(key).or_insert_with(|| AtomicU64::new(0)).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &'static str, labels: LabelSet, value: i64) {
        let key = (name, label_key(&labels));
        self.inner
            .gauges
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.max(0) as u64, Ordering::Relaxed);
    }

    pub fn observe_histogram(&self, name: &'static str, labels: LabelSet, seconds: f64) {
        let key = (name, label_key(&labels));
        self.inner
            .histograms
            .entry(key)
            .or_insert_with(|| Histogram::new(default_buckets()))
            .observe(seconds);
    }

    /// Renders every recorded series as Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut counters: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        for entry in &self.inner.counters {
            let ((name, labels), value) = (entry.key().clone(), entry.value().load(Ordering::Relaxed));
            counters.entry(name.to_string()).or_default().push((labels, value));
        }
        for (name, series) in counters {
            out.push_str(&format!("# TYPE {name} counter\n"));
            for (labels, value) in series {
                out.push_str(&render_line(&name, &labels, value as f64));
            }
        }

        let mut gauges: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        for entry in &self.inner.gauges {
            let ((name, labels), value) = (entry.key().clone(), entry.value().load(Ordering::Relaxed));
            gauges.entry(name.to_string()).or_default().push((labels, value));
        }
        for (name, series) in gauges {
            out.push_str(&format!("# TYPE {name} gauge\n"));
            for (labels, value) in series {
                out.push_str(&render_line(&name, &labels, value as f64));
            }
        }

        let mut histograms: Vec<(String, String, u64, u64, f64)> = Vec::new();
        for entry in &self.inner.histograms {
            let (name, labels) = entry.key().clone();
            let histogram = entry.value();
            let count = histogram.count.load(Ordering::Relaxed);
            let sum = histogram.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            histograms.push((name.to_string(), labels, count, 0, sum));
            for (bound, counter) in histogram.bucket_bounds.iter().zip(histogram.bucket_counts.iter()) {
                let c = counter.load(Ordering::Relaxed);
                let labels_with_le = if labels.is_empty() {
                    format!("le=\"{bound}\"")
                } else {
                    format!("{labels},le=\"{bound}\"")
                };
                out.push_str(&render_line(&format!("{name}_bucket"), &labels_with_le, c as f64));
            }
            let le_inf = if labels.is_empty() { "le=\"+Inf\"".to_string() } else { format!("{labels},le=\"+Inf\"") };
            out.push_str(&render_line(&format!("{name}_bucket"), &le_inf, count as f64));
            out.push_str(&render_line(&format!("{name}_sum"), &labels, sum));
            out.push_str(&render_line(&format!("{name}_count"), &labels, count as f64));
        }

        out
    }
}

fn render_line(name: &str, labels: &str, value: f64) -> String {
    if labels.is_empty() {
        format!("{name} {value}\n")
    } else {
        format!("{name}{{{labels}}} {value}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let sink = MetricsSink::new();
        sink.incr_counter("tasks_total", vec![("capability", "echo".to_string()), ("status", "succeeded".to_string())]);
        sink.incr_counter("tasks_total", vec![("capability", "echo".to_string()), ("status", "succeeded".to_string())]);
        let rendered = sink.render();
        assert!(rendered.contains("tasks_total{capability=\"echo\",status=\"succeeded\"} 2"));
    }

    #[test]
    fn gauge_overwrites() {
        let sink = MetricsSink::new();
        sink.set_gauge("mailbox_depth", vec![("agent", "a1".to_string())], 3);
        sink.set_gauge("mailbox_depth", vec![("agent", "a1".to_string())], 7);
        assert!(sink.render().contains("mailbox_depth{agent=\"a1\"} 7"));
    }

    #[test]
    fn histogram_records_count_and_sum() {
        let sink = MetricsSink::new();
        sink.observe_histogram("task_duration_seconds", vec![("capability", "echo".to_string())], 0.02);
        let rendered = sink.render();
        assert!(rendered.contains("task_duration_seconds_count{capability=\"echo\"} 1"));
    }
}

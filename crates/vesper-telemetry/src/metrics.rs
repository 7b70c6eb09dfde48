use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram series.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

/// Gauge values are f64 bit patterns.
#[derive(Default)]
struct Gauge(AtomicU64);

#[derive(Default)]
struct Histogram(Mutex<VecDeque<f64>>);

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.0.lock();
        if window.len() == HISTOGRAM_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut values: Vec<f64> = self.0.lock().iter().copied().collect();
        if values.is_empty() {
            return HistogramSummary::default();
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let rank = |q: f64| values[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: n as u64,
            mean: values.iter().sum::<f64>() / n as f64,
            p50: rank(0.5),
            p95: rank(0.95),
            max: values[n - 1],
        }
    }
}

/// All series of one metric kind.
struct Family<T> {
    series: RwLock<HashMap<MetricKey, T>>,
}

impl<T: Default> Family<T> {
    fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Run `f` on the series, creating it first if needed.
    fn update(&self, key: MetricKey, f: impl FnOnce(&T)) {
        if let Some(series) = self.series.read().get(&key) {
            f(series);
            return;
        }
        f(self.series.write().entry(key).or_default());
    }

    fn read<R>(&self, key: &MetricKey, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.series.read().get(key).map(f)
    }

    fn samples(&self, kind: MetricType, value: impl Fn(&T) -> f64) -> Vec<MetricSample> {
        self.series
            .read()
            .iter()
            .map(|(key, series)| MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: value(series),
                metric_type: kind.clone(),
            })
            .collect()
    }
}

/// In-process counters, gauges and latency histograms for the transport,
/// session and realtime layers.
///
/// A series is a name plus its labels; label order at the call site does
/// not matter.
pub struct MetricsRecorder {
    counters: Family<AtomicU64>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            counters: Family::new(),
            gauges: Family::new(),
            histograms: Family::new(),
        }
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters
            .update(MetricKey::new(name, labels), |c| {
                c.fetch_add(n, Ordering::Relaxed);
            });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read(&MetricKey::new(name, labels), |c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every label set of `name`.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .series
            .read()
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .update(MetricKey::new(name, labels), |g| g.0.store(value.to_bits(), Ordering::Relaxed));
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read(&MetricKey::new(name, labels), |g| f64::from_bits(g.0.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .update(MetricKey::new(name, labels), |h| h.observe(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read(&MetricKey::new(name, labels), Histogram::summary)
            .unwrap_or_default()
    }

    /// Every series, sorted by name then labels. Histograms report p50.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut out = self
            .counters
            .samples(MetricType::Counter, |c| c.load(Ordering::Relaxed) as f64);
        out.extend(
            self.gauges
                .samples(MetricType::Gauge, |g| f64::from_bits(g.0.load(Ordering::Relaxed))),
        );
        out.extend(
            self.histograms
                .samples(MetricType::Histogram, |h| h.summary().p50),
        );
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_by_label() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("transport.retries", &[("reason", "server")], 1);
        recorder.counter_inc("transport.retries", &[("reason", "server")], 1);
        recorder.counter_inc("transport.retries", &[("reason", "rate_limited")], 1);

        assert_eq!(recorder.counter_get("transport.retries", &[("reason", "server")]), 2);
        assert_eq!(recorder.counter_get("transport.retries", &[("reason", "rate_limited")]), 1);
        assert_eq!(recorder.counter_get("transport.retries", &[("reason", "auth")]), 0);
        assert_eq!(recorder.counter_total("transport.retries"), 3);
    }

    #[test]
    fn label_order_is_irrelevant() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("realtime.dropped_frames", &[("topic", "music"), ("reason", "malformed")], 1);
        recorder.counter_inc("realtime.dropped_frames", &[("reason", "malformed"), ("topic", "music")], 1);
        assert_eq!(
            recorder.counter_get("realtime.dropped_frames", &[("topic", "music"), ("reason", "malformed")]),
            2
        );
    }

    #[test]
    fn gauge_keeps_last_value() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("realtime.queue_depth", &[("topic", "music")], 4.0);
        recorder.gauge_set("realtime.queue_depth", &[("topic", "music")], 1.0);
        assert_eq!(recorder.gauge_get("realtime.queue_depth", &[("topic", "music")]), 1.0);
        assert_eq!(recorder.gauge_get("realtime.queue_depth", &[("topic", "care")]), 0.0);
    }

    #[test]
    fn latency_summary() {
        let recorder = MetricsRecorder::new();
        for v in 1..=10 {
            recorder.histogram_observe("transport.latency_ms", &[], f64::from(v) * 10.0);
        }

        let summary = recorder.histogram_summary("transport.latency_ms", &[]);
        assert_eq!(summary.count, 10);
        assert_eq!(summary.mean, 55.0);
        assert_eq!(summary.p50, 60.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(recorder.histogram_summary("session.check_ms", &[]), HistogramSummary::default());
    }

    #[test]
    fn histogram_window_drops_oldest() {
        let recorder = MetricsRecorder::new();
        for i in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], i as f64);
        }
        let summary = recorder.histogram_summary("h", &[]);
        assert_eq!(summary.count, HISTOGRAM_WINDOW as u64);
        assert_eq!(summary.max, (HISTOGRAM_WINDOW + 9) as f64);
    }

    #[test]
    fn snapshot_is_sorted() {
        let recorder = MetricsRecorder::new();
        recorder.histogram_observe("transport.latency_ms", &[], 12.0);
        recorder.counter_inc("session.checks", &[("outcome", "ok")], 3);
        recorder.gauge_set("realtime.queue_depth", &[("topic", "care")], 2.0);

        let snap = recorder.snapshot();
        let names: Vec<&str> = snap.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["realtime.queue_depth", "session.checks", "transport.latency_ms"]);
        assert_eq!(snap[1].value, 3.0);
        assert_eq!(snap[1].metric_type, MetricType::Counter);
        assert_eq!(snap[1].labels, vec![("outcome".to_string(), "ok".to_string())]);
        assert_eq!(snap[2].value, 12.0);
    }

    #[test]
    fn concurrent_increments() {
        use std::sync::Arc;

        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("session.checks", &[("outcome", "ok")], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("session.checks", &[("outcome", "ok")]), 8_000);
    }
}

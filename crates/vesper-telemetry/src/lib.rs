//! Structured logging and in-process metrics.

mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, WarningLog, WarningLogLayer};
pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "vesper_transport" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of the compact human format.
    pub json: bool,
    /// How many warn+ records the in-memory buffer keeps.
    pub warning_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            warning_capacity: 256,
        }
    }
}

impl TelemetryConfig {
    /// Build from the `logging` settings section. Unknown levels fall back to INFO.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            json,
            ..Self::default()
        }
    }
}

/// Handle to the telemetry sinks. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryGuard {
    warnings: Arc<WarningLog>,
    metrics: Arc<MetricsRecorder>,
    installed: bool,
}

impl TelemetryGuard {
    /// Recorder with no subscriber attached. Used by tests and embedders
    /// that install their own subscriber.
    pub fn detached() -> Self {
        Self {
            warnings: Arc::new(WarningLog::new(TelemetryConfig::default().warning_capacity)),
            metrics: Arc::new(MetricsRecorder::new()),
            installed: false,
        }
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    pub fn warnings(&self) -> &WarningLog {
        &self.warnings
    }

    /// False when another global subscriber was already installed.
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Install the global subscriber. Later calls keep the first subscriber
/// and return fresh, unattached sinks.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let warnings = Arc::new(WarningLog::new(config.warning_capacity));
    let installed = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(WarningLogLayer::new(warnings.clone()))
        .try_init()
        .is_ok();
    if !installed {
        eprintln!("vesper-telemetry: global subscriber already installed, keeping it");
    }

    TelemetryGuard {
        warnings,
        metrics: Arc::new(MetricsRecorder::new()),
        installed,
    }
}

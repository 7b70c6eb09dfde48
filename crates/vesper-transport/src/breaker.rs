//! Per-bucket circuit breakers.
//!
//! Closed → N consecutive failures → Open → cooldown → HalfOpen (one probe)
//! → success → Closed, or failure → Open with a fresh cooldown.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use vesper_core::errors::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
struct BreakerState {
    consecutive_failures: u32,
    phase: BreakerPhase,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            phase: BreakerPhase::Closed,
            open_until: None,
            probe_in_flight: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub bucket: String,
    pub consecutive_failures: u32,
    pub phase: BreakerPhase,
    /// Remaining cooldown while open.
    pub retry_in: Option<Duration>,
}

/// Whether an admitted call is an ordinary call or the half-open probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

/// Breakers keyed by endpoint bucket, created lazily on first failure.
pub struct CircuitBreakers {
    config: BreakerConfig,
    buckets: DashMap<String, BreakerState>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Admit or short-circuit a call. Never touches the network.
    pub fn check(&self, bucket: &str) -> Result<Admission, TransportError> {
        let Some(mut state) = self.buckets.get_mut(bucket) else {
            return Ok(Admission::Normal);
        };
        let now = Instant::now();
        match state.phase {
            BreakerPhase::Closed => Ok(Admission::Normal),
            BreakerPhase::Open => {
                let until = state.open_until.unwrap_or(now);
                if now >= until {
                    info!(bucket, "circuit breaker half-open, allowing probe");
                    state.phase = BreakerPhase::HalfOpen;
                    state.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    Err(TransportError::CircuitOpen {
                        bucket: bucket.to_string(),
                        retry_in: until - now,
                    })
                }
            }
            BreakerPhase::HalfOpen => {
                if state.probe_in_flight {
                    Err(TransportError::CircuitOpen {
                        bucket: bucket.to_string(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    pub fn record_success(&self, bucket: &str) {
        if let Some(mut state) = self.buckets.get_mut(bucket) {
            if state.phase != BreakerPhase::Closed {
                info!(bucket, "circuit breaker closed after successful request");
            }
            *state = BreakerState::new();
        }
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&self, bucket: &str) -> bool {
        let mut state = self
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(BreakerState::new);
        let now = Instant::now();
        match state.phase {
            BreakerPhase::HalfOpen => {
                warn!(bucket, "circuit breaker probe failed, reopening");
                state.phase = BreakerPhase::Open;
                state.open_until = Some(self.reopen_at(now));
                state.probe_in_flight = false;
                state.consecutive_failures += 1;
                true
            }
            BreakerPhase::Open => {
                state.consecutive_failures += 1;
                false
            }
            BreakerPhase::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.threshold {
                    warn!(
                        bucket,
                        failures = state.consecutive_failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit breaker opened"
                    );
                    state.phase = BreakerPhase::Open;
                    state.open_until = Some(self.reopen_at(now));
                    true
                } else {
                    false
                }
            }
        }
    }

    /// End of a fresh cooldown. Saturates at a year out.
    fn reopen_at(&self, now: Instant) -> Instant {
        now.checked_add(self.config.cooldown)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
    }

    /// Give back an admitted probe whose call never produced an outcome.
    pub fn release(&self, bucket: &str) {
        if let Some(mut state) = self.buckets.get_mut(bucket) {
            state.probe_in_flight = false;
        }
    }

    pub fn phase(&self, bucket: &str) -> BreakerPhase {
        self.buckets
            .get(bucket)
            .map_or(BreakerPhase::Closed, |s| s.phase)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<BreakerSnapshot> = self
            .buckets
            .iter()
            .map(|entry| {
                let state = entry.value();
                BreakerSnapshot {
                    bucket: entry.key().clone(),
                    consecutive_failures: state.consecutive_failures,
                    phase: state.phase,
                    retry_in: match state.phase {
                        BreakerPhase::Open => state
                            .open_until
                            .map(|until| until.saturating_duration_since(now)),
                        _ => None,
                    },
                }
            })
            .collect();
        out.sort_by(|a, b| a.bucket.cmp(&b.bucket));
        out
    }

    pub fn reset(&self) {
        self.buckets.clear();
    }
}

/// Logical endpoint bucket: the first two path segments, query stripped.
///
/// `/v1/whoami?x=1` → `/v1/whoami`, `/v1/music/queue/3` → `/v1/music`.
pub fn bucket_for(path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).take(2).collect();
    format!("/{}", segments.join("/"))
}

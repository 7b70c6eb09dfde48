//! Exponential backoff with symmetric jitter.
//!
//! Shared by transport retries and realtime reconnects:
//! `min(cap, base * 2^attempt)`, then scaled by a random factor in
//! `[1 - jitter, 1 + jitter]`.

use std::time::Duration;

use rand::Rng;

use crate::settings::MAX_WAIT_MS;

/// Backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay, e.g. `0.15` for ±15%.
    pub jitter: f64,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self { base, cap, jitter }
    }

    /// Un-jittered delay for a zero-based attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(31));
        Duration::from_millis(exp.min(self.cap.as_millis() as u64))
    }

    /// Jittered delay for a zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::thread_rng().gen::<f64>())
    }

    /// `random` must be in `[0.0, 1.0)`.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        apply_jitter(self.ceiling(attempt), self.jitter, random)
    }
}

/// Scale `delay` by `1 + (2 * random - 1) * jitter`.
pub fn apply_jitter(delay: Duration, jitter: f64, random: f64) -> Duration {
    let factor = 1.0 + (random * 2.0 - 1.0) * jitter.clamp(0.0, 1.0);
    let ms = (delay.as_millis() as f64 * factor).round().max(0.0);
    Duration::from_millis(ms as u64)
}

/// Parse a `Retry-After` value: integer seconds or an HTTP date. Capped at
/// [`MAX_WAIT_MS`].
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let delay = if let Ok(seconds) = value.parse::<u64>() {
        Duration::from_secs(seconds)
    } else if let Some(seconds) = value
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
    {
        Duration::from_millis((seconds * 1000.0) as u64)
    } else {
        let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
        let delta = date.signed_duration_since(chrono::Utc::now());
        delta.to_std().unwrap_or(Duration::ZERO)
    };
    Some(delay.min(Duration::from_millis(MAX_WAIT_MS)))
}

//! Flip detection for the session health signal.
//!
//! The signal is `whoami_ok && is_authenticated`. A flip is any change of
//! that signal between consecutive checks. Too many flips inside the rolling
//! window produce a warning and a cooldown; two healthy checks in a row
//! clear the history.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use vesper_core::settings::{clamped_millis, SessionSettings};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OscillationConfig {
    pub window: Duration,
    /// Flips tolerated inside `window`. One more triggers the cooldown.
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for OscillationConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

impl OscillationConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            window: clamped_millis(settings.oscillation_window_ms),
            threshold: settings.oscillation_threshold,
            cooldown: clamped_millis(settings.oscillation_cooldown_ms),
        }
    }
}

/// Non-fatal; logged and turned into a cooldown by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OscillationWarning {
    pub transitions: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

#[derive(Debug)]
pub struct OscillationDetector {
    config: OscillationConfig,
    last: Option<bool>,
    flips: VecDeque<Instant>,
}

impl OscillationDetector {
    pub fn new(config: OscillationConfig) -> Self {
        Self {
            config,
            last: None,
            flips: VecDeque::new(),
        }
    }

    pub fn record(&mut self, healthy: bool, now: Instant) -> Option<OscillationWarning> {
        let previous = self.last.replace(healthy);

        while let Some(&front) = self.flips.front() {
            if now.saturating_duration_since(front) > self.config.window {
                self.flips.pop_front();
            } else {
                break;
            }
        }

        match previous {
            Some(prev) if prev != healthy => self.flips.push_back(now),
            Some(true) if healthy => self.flips.clear(),
            _ => {}
        }

        if self.flips.len() > self.config.threshold as usize {
            let transitions = self.flips.len();
            self.flips.clear();
            return Some(OscillationWarning {
                transitions,
                window: self.config.window,
                cooldown: self.config.cooldown,
            });
        }
        None
    }

    pub fn transitions(&self) -> usize {
        self.flips.len()
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.flips.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: u32) -> OscillationDetector {
        OscillationDetector::new(OscillationConfig {
            window: Duration::from_secs(10),
            threshold,
            cooldown: Duration::from_secs(30),
        })
    }

    #[test]
    fn flapping_triggers_warning() {
        let mut d = detector(3);
        let t0 = Instant::now();
        let mut warning = None;
        for i in 0..5u64 {
            warning = d.record(i % 2 == 0, t0 + Duration::from_millis(i * 100));
        }
        let warning = warning.expect("fourth flip exceeds threshold");
        assert_eq!(warning.transitions, 4);
        assert_eq!(warning.cooldown, Duration::from_secs(30));
        assert_eq!(d.transitions(), 0);
    }

    #[test]
    fn stable_success_clears_history() {
        let mut d = detector(3);
        let t0 = Instant::now();
        d.record(true, t0);
        d.record(false, t0);
        d.record(true, t0);
        assert_eq!(d.transitions(), 2);
        d.record(true, t0);
        assert_eq!(d.transitions(), 0);
    }

    #[test]
    fn flips_outside_window_are_forgotten() {
        let mut d = detector(2);
        let t0 = Instant::now();
        d.record(true, t0);
        d.record(false, t0 + Duration::from_secs(1));
        d.record(true, t0 + Duration::from_secs(2));
        assert!(d.record(false, t0 + Duration::from_secs(20)).is_none());
        assert_eq!(d.transitions(), 1);
    }

    #[test]
    fn stable_failure_is_not_oscillation() {
        let mut d = detector(1);
        let t0 = Instant::now();
        for i in 0..10 {
            assert!(d.record(false, t0 + Duration::from_millis(i)).is_none());
        }
        assert_eq!(d.transitions(), 0);
    }
}

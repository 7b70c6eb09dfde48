use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Startup gate state owned by the bootstrap coordinator.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapState {
    pub is_initialized: bool,
    pub auth_finish_in_progress: bool,
    pub health_polling_active: bool,
    pub auth_bootstrap_active: bool,
    pub last_bootstrap_attempt: Option<DateTime<Utc>>,
    pub bootstrap_error: Option<String>,
    /// Last definitive health probe result. Timeouts leave it untouched.
    pub backend_reachable: Option<bool>,
}

impl BootstrapState {
    /// Whether a new health-polling or auth-bootstrap flow may start.
    pub fn can_start_flows(&self) -> bool {
        !self.auth_finish_in_progress
    }
}

/// Per-topic realtime connection status. Reused across reconnects.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_open: bool,
    pub is_connecting: bool,
    pub failure_reason: Option<String>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Set once the hub gave up on the topic; only an explicit restart clears it.
    pub terminal: bool,
}

impl ConnectionStatus {
    pub fn mark_connecting(&mut self) {
        self.is_connecting = true;
        self.is_open = false;
        self.terminal = false;
    }

    pub fn mark_open(&mut self) {
        self.is_open = true;
        self.is_connecting = false;
        self.failure_reason = None;
        self.retry_count = 0;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.is_open = false;
        self.is_connecting = false;
        self.failure_reason = Some(reason.into());
        self.last_failure_time = Some(now);
    }

    pub fn mark_closed(&mut self) {
        self.is_open = false;
        self.is_connecting = false;
    }
}

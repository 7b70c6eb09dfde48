//! Startup gate: one setup run, at most one health poller and at most one
//! auth bootstrap flow, all paused while an auth finish is in progress.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vesper_core::settings::{clamped_millis, BootstrapSettings};
use vesper_core::{BootstrapState, Observers, Subscription, TransportError};

/// Work the coordinator schedules but does not own.
#[async_trait]
pub trait BootstrapHooks: Send + Sync {
    /// One-time startup routine behind [`BootstrapCoordinator::initialize`].
    async fn setup(&self) -> anyhow::Result<()>;

    /// `Ok(false)` means the backend answered and is unhealthy.
    /// `Err` is a transient failure.
    async fn health_check(&self) -> Result<bool, TransportError>;

    /// Runs until done or until `cancel` fires, then returns. Work after the
    /// cancellation is awaited; the next run starts only once this one returns.
    async fn auth_bootstrap(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub health_interval: Duration,
    pub health_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self::from_settings(&BootstrapSettings::default())
    }
}

impl BootstrapConfig {
    pub fn from_settings(settings: &BootstrapSettings) -> Self {
        Self {
            health_interval: clamped_millis(settings.health_poll_interval_ms.max(1)),
            health_timeout: clamped_millis(settings.health_timeout_ms),
        }
    }
}

struct Flows {
    timers: CancellationToken,
    next_id: u64,
    health: Option<(u64, CancellationToken)>,
    auth: Option<(u64, CancellationToken)>,
    suspended_health: bool,
    suspended_auth: bool,
}

impl Flows {
    fn new() -> Self {
        Self {
            timers: CancellationToken::new(),
            next_id: 0,
            health: None,
            auth: None,
            suspended_health: false,
            suspended_auth: false,
        }
    }

    fn child(&mut self) -> (u64, CancellationToken) {
        self.next_id += 1;
        (self.next_id, self.timers.child_token())
    }
}

pub struct BootstrapCoordinator {
    hooks: Arc<dyn BootstrapHooks>,
    config: BootstrapConfig,
    state: Mutex<BootstrapState>,
    flows: Mutex<Flows>,
    /// Held for the whole of one auth bootstrap run.
    auth_run: Arc<tokio::sync::Mutex<()>>,
    init: Mutex<Arc<OnceCell<bool>>>,
    observers: Observers<BootstrapState>,
}

impl BootstrapCoordinator {
    pub fn new(hooks: Arc<dyn BootstrapHooks>, config: BootstrapConfig) -> Self {
        Self {
            hooks,
            config,
            state: Mutex::new(BootstrapState::default()),
            flows: Mutex::new(Flows::new()),
            auth_run: Arc::new(tokio::sync::Mutex::new(())),
            init: Mutex::new(Arc::new(OnceCell::new())),
            observers: Observers::new(),
        }
    }

    /// Run setup once. Concurrent and later callers get the same outcome.
    pub async fn initialize(&self) -> bool {
        let cell = Arc::clone(&*self.init.lock());
        *cell.get_or_init(|| self.run_setup()).await
    }

    pub fn get_state(&self) -> BootstrapState {
        self.state.lock().clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BootstrapState) + Send + Sync + 'static,
    {
        self.observers.subscribe_with_current(&self.get_state(), callback)
    }

    /// While set, both flows are suspended and new starts are refused.
    /// Clearing it restarts the flows it suspended.
    pub fn set_auth_finish_in_progress(self: &Arc<Self>, in_progress: bool) {
        if in_progress {
            let (health, auth) = {
                let mut flows = self.flows.lock();
                let health = flows.health.take().map(|(_, t)| t.cancel()).is_some();
                let auth = flows.auth.take().map(|(_, t)| t.cancel()).is_some();
                flows.suspended_health |= health;
                flows.suspended_auth |= auth;
                (health, auth)
            };
            self.mutate(|s| {
                s.auth_finish_in_progress = true;
                s.health_polling_active = false;
                s.auth_bootstrap_active = false;
            });
            if health || auth {
                info!(health, auth, "flows suspended while auth finish is in progress");
            }
            return;
        }

        self.mutate(|s| s.auth_finish_in_progress = false);
        let (health, auth) = {
            let mut flows = self.flows.lock();
            (
                std::mem::take(&mut flows.suspended_health),
                std::mem::take(&mut flows.suspended_auth),
            )
        };
        if health {
            self.start_health_polling();
        }
        if auth {
            self.start_auth_bootstrap();
        }
    }

    /// False if polling is already active or an auth finish is in progress.
    pub fn start_health_polling(self: &Arc<Self>) -> bool {
        if !self.claim(|s| &mut s.health_polling_active) {
            debug!("health polling not started");
            return false;
        }

        let token = {
            let mut flows = self.flows.lock();
            let (id, token) = flows.child();
            flows.health = Some((id, token.clone()));
            token
        };
        info!(
            interval_ms = self.config.health_interval.as_millis() as u64,
            "health polling started"
        );
        tokio::spawn(poll_health(Arc::downgrade(self), token, self.config));
        true
    }

    pub fn stop_health_polling(&self) {
        if let Some((_, token)) = self.flows.lock().health.take() {
            token.cancel();
        }
        self.mutate(|s| s.health_polling_active = false);
    }

    /// False if the flow is already active or an auth finish is in progress.
    pub fn start_auth_bootstrap(self: &Arc<Self>) -> bool {
        if !self.claim(|s| &mut s.auth_bootstrap_active) {
            debug!("auth bootstrap not started");
            return false;
        }

        let (id, token) = {
            let mut flows = self.flows.lock();
            let (id, token) = flows.child();
            flows.auth = Some((id, token.clone()));
            (id, token)
        };
        let weak = Arc::downgrade(self);
        let hooks = Arc::clone(&self.hooks);
        let run = Arc::clone(&self.auth_run);

        tokio::spawn(async move {
            let _run = run.lock().await;
            let outcome = if token.is_cancelled() {
                None
            } else {
                Some(hooks.auth_bootstrap(token.clone()).await)
            };
            match outcome {
                Some(Ok(())) if token.is_cancelled() => debug!("auth bootstrap cancelled"),
                Some(Ok(())) => info!("auth bootstrap finished"),
                Some(Err(e)) => warn!(error = %format!("{e:#}"), "auth bootstrap failed"),
                None => debug!("auth bootstrap cancelled before it ran"),
            }
            if let Some(this) = weak.upgrade() {
                this.finish_auth_bootstrap(id);
            }
        });
        true
    }

    pub fn stop_auth_bootstrap(&self) {
        if let Some((_, token)) = self.flows.lock().auth.take() {
            token.cancel();
        }
        self.mutate(|s| s.auth_bootstrap_active = false);
    }

    /// Stop every flow and return to the initial state.
    pub fn cleanup(&self) {
        {
            let mut flows = self.flows.lock();
            flows.timers.cancel();
            *flows = Flows {
                next_id: flows.next_id,
                ..Flows::new()
            };
        }
        *self.init.lock() = Arc::new(OnceCell::new());
        self.mutate(|s| *s = BootstrapState::default());
        debug!("bootstrap coordinator reset");
    }

    async fn run_setup(&self) -> bool {
        self.mutate(|s| s.last_bootstrap_attempt = Some(Utc::now()));

        let message = match AssertUnwindSafe(self.hooks.setup()).catch_unwind().await {
            Ok(Ok(())) => {
                self.mutate(|s| {
                    s.is_initialized = true;
                    s.bootstrap_error = None;
                });
                info!("bootstrap complete");
                return true;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => panic_message(&panic),
        };

        error!(error = %message, "bootstrap setup failed");
        self.mutate(|s| s.bootstrap_error = Some(message));
        false
    }

    /// Set the flag returned by `flag` unless it is already set or flows
    /// are blocked. Returns whether this call set it.
    fn claim(&self, flag: impl FnOnce(&mut BootstrapState) -> &mut bool) -> bool {
        self.mutate(|s| {
            if !s.can_start_flows() {
                return false;
            }
            let active = flag(s);
            if *active {
                return false;
            }
            *active = true;
            true
        })
    }

    fn finish_auth_bootstrap(&self, id: u64) {
        let current = {
            let mut flows = self.flows.lock();
            match flows.auth {
                Some((active, _)) if active == id => {
                    flows.auth = None;
                    true
                }
                _ => false,
            }
        };
        if current {
            self.mutate(|s| s.auth_bootstrap_active = false);
        }
    }

    fn record_health(&self, reachable: bool) {
        self.mutate(|s| s.backend_reachable = Some(reachable));
    }

    /// Apply `f` and notify subscribers if the state changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut BootstrapState) -> R) -> R {
        let (changed, next, result) = {
            let mut state = self.state.lock();
            let prev = state.clone();
            let result = f(&mut state);
            (*state != prev, state.clone(), result)
        };
        if changed {
            self.observers.notify(&next);
        }
        result
    }
}

async fn poll_health(weak: Weak<BootstrapCoordinator>, token: CancellationToken, config: BootstrapConfig) {
    loop {
        let Some(this) = weak.upgrade() else { return };
        let probe = tokio::time::timeout(config.health_timeout, this.hooks.health_check());
        let result = tokio::select! {
            _ = token.cancelled() => return,
            r = probe => r,
        };

        match result {
            Ok(Ok(reachable)) => this.record_health(reachable),
            Ok(Err(e)) if e.is_transient() => {
                debug!(error = %e, "health probe failed transiently, reachability unchanged")
            }
            Ok(Err(e)) => {
                warn!(error = %e, kind = e.error_kind(), "health probe failed");
                this.record_health(false);
            }
            Err(_) => debug!(
                timeout_ms = config.health_timeout.as_millis() as u64,
                "health probe timed out, reachability unchanged"
            ),
        }
        drop(this);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(config.health_interval) => {}
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("setup panicked")
        .to_string()
}

static GLOBAL: RwLock<Option<Arc<BootstrapCoordinator>>> = parking_lot::const_rwlock(None);

pub fn install_global(coordinator: Arc<BootstrapCoordinator>) -> Option<Arc<BootstrapCoordinator>> {
    GLOBAL.write().replace(coordinator)
}

pub fn global() -> Option<Arc<BootstrapCoordinator>> {
    GLOBAL.read().clone()
}

pub fn reset_global() {
    if let Some(coordinator) = GLOBAL.write().take() {
        coordinator.cleanup();
    }
}

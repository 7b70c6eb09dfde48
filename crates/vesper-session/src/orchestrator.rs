//! Owner of the authenticated/unauthenticated view of the current user.
//!
//! Every state change goes through [`SessionOrchestrator::apply`], which
//! drops responses from superseded checks, records rate limits and
//! oscillation, and notifies subscribers only when the visible state changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use vesper_core::settings::{clamped_millis, SessionSettings, MAX_WAIT_MS};
use vesper_core::{
    IdentityResponse, Observers, RateLimitInfo, SessionState, Subscription, TransportError,
};
use vesper_store::SessionFlags;
use vesper_telemetry::MetricsRecorder;

use crate::guard::{PageLifecycle, PageLoadGuard};
use crate::identity::IdentityClient;
use crate::oscillation::{OscillationConfig, OscillationDetector};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bound on each identity check. Expiry counts as a transient failure.
    pub check_timeout: Duration,
    /// Lifetime of the page-load refresh marker. `None` never expires.
    pub guard_ttl: Option<Duration>,
    pub oscillation: OscillationConfig,
    /// Wait applied when a 429 names neither Retry-After nor a reset time.
    pub rate_limit_fallback: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            check_timeout: clamped_millis(settings.check_timeout_ms),
            guard_ttl: (settings.guard_ttl_ms > 0)
                .then(|| clamped_millis(settings.guard_ttl_ms)),
            oscillation: OscillationConfig::from_settings(settings),
            rate_limit_fallback: clamped_millis(settings.rate_limit_fallback_ms),
        }
    }
}

/// Options for [`SessionOrchestrator::refresh_auth`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Ignore the rate-limit and oscillation cooldowns.
    pub force: bool,
    /// Start a new check even if one is in flight.
    pub no_dedupe: bool,
    /// Ask intermediaries not to serve a cached identity.
    pub no_cache: bool,
}

impl RefreshOptions {
    /// All three flags set. Used after a cross-tab logout.
    pub fn forced() -> Self {
        Self {
            force: true,
            no_dedupe: true,
            no_cache: true,
        }
    }
}

type CheckFuture = Shared<BoxFuture<'static, SessionState>>;

struct Inner {
    state: SessionState,
    /// Latest version handed out. Responses for older versions are stale.
    version: u64,
    in_flight: Option<(u64, CheckFuture)>,
    next_allowed_at: Option<Instant>,
    oscillation: OscillationDetector,
    /// Parent of every timer this orchestrator spawns.
    timers: CancellationToken,
    recheck: Option<CancellationToken>,
}

pub struct SessionOrchestrator {
    identity: Arc<IdentityClient>,
    guard: PageLoadGuard,
    config: SessionConfig,
    inner: Mutex<Inner>,
    init: Mutex<Arc<OnceCell<()>>>,
    observers: Observers<SessionState>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionOrchestrator {
    pub fn new(identity: Arc<IdentityClient>, flags: Arc<SessionFlags>, config: SessionConfig) -> Self {
        Self {
            identity,
            guard: PageLoadGuard::new(flags, config.guard_ttl),
            inner: Mutex::new(Inner {
                state: SessionState::default(),
                version: 0,
                in_flight: None,
                next_allowed_at: None,
                oscillation: OscillationDetector::new(config.oscillation),
                timers: CancellationToken::new(),
                recheck: None,
            }),
            config,
            init: Mutex::new(Arc::new(OnceCell::new())),
            observers: Observers::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<IdentityClient> {
        &self.identity
    }

    /// Run the first identity check. Later and concurrent calls wait for
    /// that same check and never issue another.
    pub async fn initialize(self: &Arc<Self>) -> SessionState {
        let cell = Arc::clone(&*self.init.lock());
        cell.get_or_init(|| async {
            let state = self.refresh_auth(RefreshOptions::default()).await;
            info!(
                authenticated = state.is_authenticated,
                whoami_ok = state.whoami_ok,
                "session initialized"
            );
        })
        .await;
        self.get_state()
    }

    pub fn is_initialized(&self) -> bool {
        self.init.lock().initialized()
    }

    /// Trigger an identity check and wait for the resulting state.
    ///
    /// Never fails: transport errors land in `SessionState::error`.
    pub async fn refresh_auth(self: &Arc<Self>, options: RefreshOptions) -> SessionState {
        let check = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let joined = match &inner.in_flight {
                Some((version, pending)) if !options.no_dedupe => {
                    debug!(version = *version, "joining in-flight identity check");
                    Some(pending.clone())
                }
                _ => None,
            };

            match joined {
                Some(pending) => pending,
                None => {
                    if !options.force {
                        if let Some(at) = inner.next_allowed_at {
                            let now = Instant::now();
                            if now < at {
                                debug!(
                                    wait_ms = (at - now).as_millis() as u64,
                                    "identity check deferred by cooldown"
                                );
                                self.count_check("deferred");
                                return inner.state.clone();
                            }
                        }
                    }

                    inner.version += 1;
                    let version = inner.version;
                    let pending = Arc::clone(self).run_check(version, options).boxed().shared();
                    inner.in_flight = Some((version, pending.clone()));
                    pending
                }
            }
        };
        check.await
    }

    pub fn get_state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    /// Register `callback`; it runs immediately with the current state and
    /// again after every visible change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.observers.subscribe_with_current(&self.get_state(), callback)
    }

    /// Time until a non-forced check is allowed again.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let at = self.inner.lock().next_allowed_at?;
        let now = Instant::now();
        (at > now).then(|| at - now)
    }

    pub fn is_check_in_flight(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    pub fn on_lifecycle(&self, event: PageLifecycle) {
        self.guard.on_lifecycle(event);
    }

    /// Drop the local view of the user without touching the network.
    ///
    /// In-flight checks become stale and are discarded when they resolve.
    pub fn clear_local_state(&self) -> SessionState {
        if let Err(e) = self.identity.transport().credentials().clear_tokens() {
            warn!(error = %e, "failed to clear stored credentials");
        }

        let (prev, next) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.version += 1;
            inner.in_flight = None;
            inner.oscillation.reset();
            let next = inner.state.signed_out(inner.version);
            let prev = std::mem::replace(&mut inner.state, next.clone());
            (prev, next)
        };
        info!(version = next.version, "local session state cleared");
        self.publish(&prev, &next);
        next
    }

    /// Invalidate the server session, then clear local state regardless of
    /// the server's answer.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> SessionState {
        self.identity.logout().await;
        self.clear_local_state()
    }

    /// Cancel pending timers and return to the initial state.
    pub fn cleanup(&self) {
        let (prev, next) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.timers.cancel();
            inner.timers = CancellationToken::new();
            inner.recheck = None;
            inner.in_flight = None;
            inner.next_allowed_at = None;
            inner.oscillation.reset();
            inner.version += 1;
            let next = SessionState {
                version: inner.version,
                ..SessionState::default()
            };
            let prev = std::mem::replace(&mut inner.state, next.clone());
            (prev, next)
        };
        *self.init.lock() = Arc::new(OnceCell::new());
        self.guard.reset();
        debug!("session orchestrator reset");
        self.publish(&prev, &next);
    }

    async fn run_check(self: Arc<Self>, version: u64, options: RefreshOptions) -> SessionState {
        let started = Instant::now();
        let outcome = match self
            .identity
            .check(options.no_cache, self.config.check_timeout)
            .await
        {
            Ok(resp) if !resp.has_identity() => self.silent_refresh().await.unwrap_or(Ok(resp)),
            Err(e) if e.is_auth_failure() => self.silent_refresh().await.unwrap_or(Err(e)),
            other => other,
        };
        if let Some(m) = &self.metrics {
            m.histogram_observe("session.check_ms", &[], started.elapsed().as_millis() as f64);
        }
        self.apply(version, outcome)
    }

    /// One credential refresh per page load, followed by a second identity
    /// check. `None` when no refresh was attempted.
    async fn silent_refresh(&self) -> Option<Result<IdentityResponse, TransportError>> {
        let transport = self.identity.transport();
        if !transport.can_refresh() {
            return None;
        }
        if !self.guard.try_acquire() {
            debug!("silent refresh already attempted for this page load, skipping");
            return None;
        }

        info!("no usable session, attempting silent refresh");
        if let Err(e) = transport.refresh_credentials().await {
            warn!(error = %e, status = ?e.status(), "silent refresh failed");
            return Some(Err(e));
        }
        Some(self.identity.check(true, self.config.check_timeout).await)
    }

    fn apply(
        self: &Arc<Self>,
        version: u64,
        outcome: Result<IdentityResponse, TransportError>,
    ) -> SessionState {
        let now = Instant::now();
        let wall = Utc::now();

        let (prev, next) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if matches!(&inner.in_flight, Some((v, _)) if *v == version) {
                inner.in_flight = None;
            }
            if version < inner.version {
                debug!(version, latest = inner.version, "discarding stale identity response");
                self.count_check("stale");
                return inner.state.clone();
            }

            let prev = inner.state.clone();
            let next = match outcome {
                Ok(resp) => {
                    let next = SessionState::from_identity(&resp, version, wall);
                    if resp.is_authenticated && !next.is_authenticated {
                        warn!(version, "identity claims authentication without a usable user id");
                    }
                    self.count_check(if next.is_authenticated {
                        "authenticated"
                    } else {
                        "unauthenticated"
                    });
                    next
                }
                Err(TransportError::RateLimited {
                    retry_after,
                    rate_limit,
                }) => {
                    let wait = self.rate_limit_wait(retry_after, rate_limit.as_ref(), wall);
                    let mut info = rate_limit.unwrap_or_default();
                    info.active = true;
                    if info.reset_at.is_none() {
                        info.reset_at = chrono::Duration::from_std(wait).ok().map(|d| wall + d);
                    }
                    warn!(
                        bucket = info.bucket.as_deref().unwrap_or("-"),
                        wait_ms = wait.as_millis() as u64,
                        "identity check rate limited"
                    );
                    extend_cooldown(inner, now + wait);
                    self.count_check("rate_limited");

                    SessionState {
                        whoami_ok: false,
                        error: Some(format!("rate limited, retry in {}s", wait.as_secs())),
                        version,
                        last_checked_at: Some(wall),
                        rate_limit: Some(info),
                        ..prev.clone()
                    }
                }
                Err(e) if e.is_auth_failure() => {
                    debug!(version, error = %e, "identity rejected credentials");
                    self.count_check("unauthenticated");
                    SessionState {
                        error: Some(e.to_string()),
                        last_checked_at: Some(wall),
                        ..prev.signed_out(version)
                    }
                }
                Err(e) => {
                    warn!(version, error = %e, kind = e.error_kind(), "identity check failed");
                    self.count_check("error");
                    SessionState {
                        whoami_ok: false,
                        error: Some(e.to_string()),
                        version,
                        last_checked_at: Some(wall),
                        ..prev.clone()
                    }
                }
            };

            let healthy = next.whoami_ok && next.is_authenticated;
            if let Some(warning) = inner.oscillation.record(healthy, now) {
                warn!(
                    transitions = warning.transitions,
                    window_ms = warning.window.as_millis() as u64,
                    cooldown_ms = warning.cooldown.as_millis() as u64,
                    "session state oscillating, backing off"
                );
                if let Some(m) = &self.metrics {
                    m.counter_inc("session.oscillations", &[], 1);
                }
                extend_cooldown(inner, now + warning.cooldown);
            }

            if let Some(at) = inner.next_allowed_at.filter(|at| *at > now) {
                self.schedule_recheck(inner, at - now);
            }

            inner.state = next.clone();
            (prev, next)
        };

        self.publish(&prev, &next);
        next
    }

    fn rate_limit_wait(
        &self,
        retry_after: Option<Duration>,
        info: Option<&RateLimitInfo>,
        wall: chrono::DateTime<Utc>,
    ) -> Duration {
        let until_reset = info
            .and_then(|i| i.reset_at)
            .and_then(|at| (at - wall).to_std().ok());
        let wait = match (retry_after, until_reset) {
            (None, None) => self.config.rate_limit_fallback,
            (a, b) => a.into_iter().chain(b).max().unwrap_or(self.config.rate_limit_fallback),
        };
        wait.min(Duration::from_millis(MAX_WAIT_MS))
    }

    fn schedule_recheck(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        if let Some(previous) = inner.recheck.take() {
            previous.cancel();
        }
        let token = inner.timers.child_token();
        inner.recheck = Some(token.clone());
        let weak = Arc::downgrade(self);
        debug!(delay_ms = delay.as_millis() as u64, "scheduling identity recheck");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let Some(this) = weak.upgrade() else { return };
                    this.inner.lock().recheck = None;
                    this.refresh_auth(RefreshOptions::default()).await;
                }
            }
        });
    }

    fn publish(&self, prev: &SessionState, next: &SessionState) {
        if !prev.same_view(next) {
            self.observers.notify(next);
        }
    }

    fn count_check(&self, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc("session.checks", &[("outcome", outcome)], 1);
        }
    }
}

fn extend_cooldown(inner: &mut Inner, until: Instant) {
    inner.next_allowed_at = Some(inner.next_allowed_at.map_or(until, |at| at.max(until)));
}

static GLOBAL: RwLock<Option<Arc<SessionOrchestrator>>> = parking_lot::const_rwlock(None);

/// Install the process-wide orchestrator, returning the one it replaces.
pub fn install_global(orchestrator: Arc<SessionOrchestrator>) -> Option<Arc<SessionOrchestrator>> {
    GLOBAL.write().replace(orchestrator)
}

pub fn global() -> Option<Arc<SessionOrchestrator>> {
    GLOBAL.read().clone()
}

/// Remove the process-wide orchestrator and cancel its timers.
pub fn reset_global() {
    if let Some(orchestrator) = GLOBAL.write().take() {
        orchestrator.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vesper_core::backoff::Backoff;
    use vesper_core::settings::ApiSettings;
    use vesper_store::{CredentialStore, MemoryCredentialStore};
    use vesper_transport::mock::{MockBackend, MockReply};
    use vesper_transport::{BreakerConfig, ResilientTransport, TransportConfig};

    const WHOAMI: &str = "/v1/whoami";
    const REFRESH: &str = "/v1/auth/refresh";
    const LOGOUT: &str = "/v1/auth/logout";

    struct Harness {
        backend: Arc<MockBackend>,
        creds: Arc<MemoryCredentialStore>,
        metrics: Arc<MetricsRecorder>,
        session: Arc<SessionOrchestrator>,
    }

    fn transport_config() -> TransportConfig {
        TransportConfig {
            request_timeout: Duration::from_secs(5),
            max_server_retries: 0,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.0),
            default_retry_after: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(5),
            breaker: BreakerConfig {
                threshold: 50,
                cooldown: Duration::from_secs(30),
            },
            refresh_path: REFRESH.into(),
            cookie_refresh: false,
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            check_timeout: Duration::from_secs(5),
            guard_ttl: None,
            oscillation: OscillationConfig {
                window: Duration::from_secs(10),
                threshold: 3,
                cooldown: Duration::from_secs(30),
            },
            rate_limit_fallback: Duration::from_secs(60),
        }
    }

    fn harness_with(config: SessionConfig) -> Harness {
        harness_over(config, transport_config())
    }

    fn harness_over(config: SessionConfig, transport: TransportConfig) -> Harness {
        let backend = Arc::new(MockBackend::new());
        let creds = Arc::new(MemoryCredentialStore::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let transport = Arc::new(ResilientTransport::new(backend.clone(), creds.clone(), transport));
        let identity = Arc::new(IdentityClient::new(transport, &ApiSettings::default()));
        let session = Arc::new(
            SessionOrchestrator::new(identity, Arc::new(SessionFlags::new()), config)
                .with_metrics(Arc::clone(&metrics)),
        );
        Harness {
            backend,
            creds,
            metrics,
            session,
        }
    }

    fn harness() -> Harness {
        harness_with(session_config())
    }

    fn whoami(user_id: Value) -> MockReply {
        MockReply::json(
            200,
            json!({
                "is_authenticated": true,
                "user_id": user_id,
                "email": "ada@example.com",
                "session_ready": true,
                "source": "cookie"
            }),
        )
        .with_header("cache-control", "no-store")
    }

    fn signed_in() -> MockReply {
        whoami(json!("u-1"))
    }

    fn anonymous() -> MockReply {
        MockReply::json(200, json!({"is_authenticated": false, "source": "missing"}))
            .with_header("cache-control", "no-store")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_request() {
        let h = harness();
        h.backend
            .on(WHOAMI, MockReply::delayed(Duration::from_millis(200), signed_in()));

        let calls = (0..8).map(|_| h.session.refresh_auth(RefreshOptions::default()));
        let states = futures::future::join_all(calls).await;

        assert_eq!(h.backend.calls(WHOAMI), 1);
        assert!(states.iter().all(|s| s == &states[0]));
        assert!(states[0].is_authenticated);
        assert!(!h.session.is_check_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn no_dedupe_issues_a_new_request() {
        let h = harness();
        h.backend
            .on(WHOAMI, MockReply::delayed(Duration::from_millis(200), signed_in()));

        let opts = RefreshOptions {
            no_dedupe: true,
            ..Default::default()
        };
        futures::join!(h.session.refresh_auth(opts), h.session.refresh_auth(opts));
        assert_eq!(h.backend.calls(WHOAMI), 2);
    }

    #[tokio::test]
    async fn unusable_user_id_collapses_to_unauthenticated() {
        for bad in [Value::Null, json!(""), json!("   ")] {
            let h = harness();
            h.backend.on(WHOAMI, whoami(bad.clone()));

            let state = h.session.refresh_auth(RefreshOptions::default()).await;
            assert!(!state.is_authenticated, "user_id {bad}");
            assert!(state.user_id.is_none());
            assert!(state.email.is_none());
            assert!(state.whoami_ok);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_runs_one_check() {
        let h = harness();
        h.backend
            .on(WHOAMI, MockReply::delayed(Duration::from_millis(50), signed_in()));

        let (a, b) = futures::join!(h.session.initialize(), h.session.initialize());
        assert_eq!(a, b);
        let c = h.session.initialize().await;
        assert_eq!(a, c);

        assert!(h.session.is_initialized());
        assert_eq!(h.backend.calls(WHOAMI), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_response_is_discarded() {
        let h = harness();
        h.backend.script(
            WHOAMI,
            [
                MockReply::delayed(Duration::from_secs(3), whoami(json!("old"))),
                whoami(json!("new")),
            ],
        );

        let opts = RefreshOptions {
            no_dedupe: true,
            ..Default::default()
        };
        let (first, second) =
            futures::join!(h.session.refresh_auth(opts), h.session.refresh_auth(opts));

        assert_eq!(second.user_id.as_deref(), Some("new"));
        assert_eq!(first.user_id.as_deref(), Some("new"));
        assert_eq!(h.session.get_state().user_id.as_deref(), Some("new"));
        assert_eq!(h.metrics.counter_get("session.checks", &[("outcome", "stale")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_keeps_identity() {
        let h = harness();
        h.backend.script(
            WHOAMI,
            [
                signed_in(),
                MockReply::error(TransportError::Network("connection reset".into())),
            ],
        );

        h.session.refresh_auth(RefreshOptions::default()).await;
        let state = h.session.refresh_auth(RefreshOptions::default()).await;

        assert!(state.is_authenticated, "a network blip is not a logout");
        assert!(!state.whoami_ok);
        assert!(state.error.as_deref().unwrap_or("").contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_timeout_is_transient() {
        let mut config = session_config();
        config.check_timeout = Duration::from_secs(1);
        let h = harness_with(config);
        h.backend
            .on(WHOAMI, MockReply::delayed(Duration::from_secs(10), signed_in()));

        let state = h.session.refresh_auth(RefreshOptions::default()).await;
        assert!(!state.whoami_ok);
        assert!(state.error.as_deref().unwrap_or("").contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_defers_checks_until_reset() {
        let h = harness();
        h.backend.script(
            WHOAMI,
            [
                MockReply::status(429)
                    .with_header("retry-after", "60")
                    .with_header("x-ratelimit-bucket", "whoami")
                    .with_header("x-ratelimit-remaining", "0"),
                signed_in(),
            ],
        );

        let state = h.session.refresh_auth(RefreshOptions::default()).await;
        assert!(state.is_rate_limited());
        let info = state.rate_limit.clone().unwrap();
        assert_eq!(info.bucket.as_deref(), Some("whoami"));
        assert_eq!(info.remaining, Some(0));
        assert!(info.reset_at.is_some());
        assert!(!state.whoami_ok);

        let deferred = h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(h.backend.calls(WHOAMI), 1);
        assert!(deferred.is_rate_limited());
        assert!(h.session.cooldown_remaining().unwrap() > Duration::from_secs(59));

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(h.backend.calls(WHOAMI), 2, "scheduled recheck ran");
        let state = h.session.get_state();
        assert!(state.is_authenticated);
        assert!(state.rate_limit.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_recorded_without_transport_wait() {
        let h = harness_over(SessionConfig::default(), TransportConfig::default());
        h.backend.script(
            WHOAMI,
            [MockReply::status(429).with_header("retry-after", "20"), signed_in()],
        );

        let start = Instant::now();
        let state = h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(h.backend.calls(WHOAMI), 1);
        assert!(state.is_rate_limited());
        assert!(!h.session.is_check_in_flight());
        assert!(h.session.cooldown_remaining().unwrap() > Duration::from_secs(19));

        tokio::time::sleep(Duration::from_secs(19)).await;
        settle().await;
        assert_eq!(h.backend.calls(WHOAMI), 1, "no request inside the window");

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(h.backend.calls(WHOAMI), 2);
        assert!(h.session.get_state().is_authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_check_bypasses_cooldown() {
        let h = harness();
        h.backend.script(
            WHOAMI,
            [MockReply::status(429).with_header("retry-after", "60"), signed_in()],
        );

        h.session.refresh_auth(RefreshOptions::default()).await;
        let state = h.session.refresh_auth(RefreshOptions::forced()).await;
        assert_eq!(h.backend.calls(WHOAMI), 2);
        assert!(state.is_authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn oscillation_triggers_cooldown() {
        let h = harness();
        h.backend.script(
            WHOAMI,
            [signed_in(), anonymous(), signed_in(), anonymous(), signed_in(), signed_in()],
        );

        for _ in 0..5 {
            h.session.refresh_auth(RefreshOptions::default()).await;
        }
        assert_eq!(h.metrics.counter_total("session.oscillations"), 1);
        assert_eq!(h.backend.calls(WHOAMI), 5);

        h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(h.backend.calls(WHOAMI), 5, "cooldown defers the next check");
        assert_eq!(h.metrics.counter_get("session.checks", &[("outcome", "deferred")]), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(h.backend.calls(WHOAMI), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_scheduled_recheck() {
        let h = harness();
        h.backend.script(
            WHOAMI,
            [MockReply::status(429).with_header("retry-after", "60"), signed_in()],
        );

        h.session.refresh_auth(RefreshOptions::default()).await;
        h.session.cleanup();

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(h.backend.calls(WHOAMI), 1);
        assert_eq!(h.session.get_state().version, 2);
        assert!(!h.session.is_initialized());
        assert!(h.session.cooldown_remaining().is_none());
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_silent_refresh() {
        let h = harness();
        h.creds.set_tokens("stale", Some("r1")).unwrap();
        h.backend.script(WHOAMI, [MockReply::status(401), signed_in()]);
        h.backend
            .on(REFRESH, MockReply::json(200, json!({"access_token": "fresh"})));

        let state = h.session.refresh_auth(RefreshOptions::default()).await;
        assert!(state.is_authenticated);
        assert_eq!(h.backend.calls(REFRESH), 1);

        let last = h.backend.requests_to(WHOAMI).pop().unwrap();
        assert_eq!(last.header("authorization"), Some("Bearer fresh"));
    }

    #[tokio::test]
    async fn silent_refresh_attempted_once_per_page_load() {
        let h = harness();
        h.creds.set_tokens("stale", Some("r1")).unwrap();
        h.backend.on(WHOAMI, MockReply::status(401));
        h.backend.on(REFRESH, MockReply::status(503));

        let state = h.session.refresh_auth(RefreshOptions::default()).await;
        assert!(!state.is_authenticated);
        assert!(state.error.is_some());
        assert_eq!(h.backend.calls(REFRESH), 1);

        h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(h.backend.calls(REFRESH), 1, "guard blocks a second attempt");

        h.session.on_lifecycle(PageLifecycle::Hidden);
        h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(h.backend.calls(REFRESH), 2, "new page load, new attempt");
    }

    #[tokio::test]
    async fn no_refresh_without_mechanism() {
        let h = harness();
        h.backend.on(WHOAMI, anonymous());

        let state = h.session.refresh_auth(RefreshOptions::default()).await;
        assert!(!state.is_authenticated);
        assert!(state.whoami_ok);
        assert_eq!(h.backend.calls(REFRESH), 0);
    }

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let h = harness();
        h.backend
            .script(WHOAMI, [signed_in(), signed_in(), anonymous()]);

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let _sub = h.session.subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1, "immediate callback");

        h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2, "identical result is silent");

        h.session.refresh_auth(RefreshOptions::default()).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn logout_clears_state_regardless_of_status() {
        let h = harness();
        h.creds.set_tokens("a", Some("r")).unwrap();
        h.backend.on(WHOAMI, signed_in());
        h.backend.on(LOGOUT, MockReply::status(500));

        h.session.refresh_auth(RefreshOptions::default()).await;
        let state = h.session.logout().await;

        assert!(!state.is_authenticated);
        assert!(state.user_id.is_none());
        assert_eq!(h.backend.calls(LOGOUT), 1);
        assert!(h.creds.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_local_state_supersedes_in_flight_check() {
        let h = harness();
        h.backend
            .on(WHOAMI, MockReply::delayed(Duration::from_secs(1), signed_in()));

        let session = Arc::clone(&h.session);
        let pending =
            tokio::spawn(async move { session.refresh_auth(RefreshOptions::default()).await });
        settle().await;

        let cleared = h.session.clear_local_state();
        assert!(!cleared.is_authenticated);

        let late = pending.await.unwrap();
        assert!(!late.is_authenticated, "stale response discarded");
        assert!(!h.session.get_state().is_authenticated);
    }

    #[tokio::test]
    async fn global_install_and_reset() {
        let h = harness();
        assert!(install_global(Arc::clone(&h.session)).is_none());
        assert!(Arc::ptr_eq(&global().unwrap(), &h.session));
        reset_global();
        assert!(global().is_none());
    }
}

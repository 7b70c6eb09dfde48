use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, debug_span, warn, Instrument};

use vesper_core::backoff::Backoff;
use vesper_core::errors::TransportError;
use vesper_core::ids::RequestId;
use vesper_core::settings::{clamped_millis, ApiSettings, TransportSettings};
use vesper_store::credentials::bearer_value;
use vesper_store::CredentialStore;
use vesper_telemetry::MetricsRecorder;

use crate::auth::Refresher;
use crate::backend::{HttpBackend, HttpRequest, HttpResponse, Method};
use crate::breaker::{bucket_for, Admission, BreakerConfig, CircuitBreakers};
use crate::ratelimit;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    /// Extra attempts for GET requests after a 5xx or transient failure.
    pub max_server_retries: u32,
    pub backoff: Backoff,
    /// Wait used when a 429 carries no Retry-After.
    pub default_retry_after: Duration,
    /// Longer Retry-After values are returned to the caller instead of awaited.
    pub max_retry_after: Duration,
    pub breaker: BreakerConfig,
    pub refresh_path: String,
    pub cookie_refresh: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_settings(&ApiSettings::default(), &TransportSettings::default())
    }
}

impl TransportConfig {
    pub fn from_settings(api: &ApiSettings, transport: &TransportSettings) -> Self {
        Self {
            request_timeout: clamped_millis(api.request_timeout_ms),
            max_server_retries: transport.max_server_retries,
            backoff: Backoff::new(
                clamped_millis(transport.base_delay_ms),
                clamped_millis(transport.max_delay_ms),
                transport.jitter_factor,
            ),
            default_retry_after: clamped_millis(transport.default_retry_after_ms),
            max_retry_after: clamped_millis(transport.max_retry_after_ms),
            breaker: BreakerConfig {
                threshold: transport.breaker_threshold.max(1),
                cooldown: clamped_millis(transport.breaker_cooldown_ms),
            },
            refresh_path: api.refresh_path.clone(),
            cookie_refresh: api.cookie_refresh,
        }
    }
}

/// Per-call options for [`ResilientTransport::send`].
#[derive(Clone, Debug)]
pub struct SendOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Breaker bucket. Defaults to [`bucket_for`] of the path.
    pub bucket: Option<String>,
    /// Per-attempt timeout. Defaults to the configured request timeout.
    pub timeout: Option<Duration>,
    pub no_cache: bool,
    /// Return 401 as-is instead of refreshing.
    pub skip_auth_refresh: bool,
    /// Return 429 as-is instead of waiting out Retry-After.
    pub skip_rate_limit_retry: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::get()
    }
}

impl SendOptions {
    pub fn get() -> Self {
        Self {
            method: Method::Get,
            body: None,
            headers: Vec::new(),
            bucket: None,
            timeout: None,
            no_cache: false,
            skip_auth_refresh: false,
            skip_rate_limit_retry: false,
        }
    }

    pub fn post(body: Option<Value>) -> Self {
        Self {
            method: Method::Post,
            body,
            ..Self::get()
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn skip_auth_refresh(mut self) -> Self {
        self.skip_auth_refresh = true;
        self
    }

    pub fn skip_rate_limit_retry(mut self) -> Self {
        self.skip_rate_limit_retry = true;
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

/// Settles a breaker admission. A dropped ticket gives back its probe.
struct BreakerTicket<'a> {
    breakers: &'a CircuitBreakers,
    bucket: &'a str,
    admission: Admission,
    settled: bool,
}

impl BreakerTicket<'_> {
    /// Returns true when this outcome opened the breaker. Only a success
    /// closes a half-open breaker; other non-counting errors give the probe
    /// back.
    fn settle(mut self, outcome: &Result<HttpResponse, TransportError>) -> bool {
        self.settled = true;
        match outcome {
            Err(e) if e.counts_against_breaker() => self.breakers.record_failure(self.bucket),
            Err(TransportError::Cancelled) => {
                self.breakers.release(self.bucket);
                false
            }
            Err(_) if self.admission == Admission::Probe => {
                self.breakers.release(self.bucket);
                false
            }
            _ => {
                self.breakers.record_success(self.bucket);
                false
            }
        }
    }
}

impl Drop for BreakerTicket<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breakers.release(self.bucket);
        }
    }
}

/// HTTP client policy layer.
///
/// - Bearer header from the credential store; JSON content type only with a body
/// - 401: one refresh (shared across concurrent callers), then one retry
/// - 429: wait Retry-After (bounded), then one retry
/// - GET 5xx / transient: bounded jittered exponential backoff
/// - Other 4xx: terminal
/// - Every attempt is admitted and settled by the bucket's circuit breaker
pub struct ResilientTransport {
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<dyn CredentialStore>,
    refresher: Refresher,
    breakers: CircuitBreakers,
    config: TransportConfig,
    metrics: Option<Arc<MetricsRecorder>>,
    total_retries: AtomicU64,
}

impl ResilientTransport {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<dyn CredentialStore>,
        config: TransportConfig,
    ) -> Self {
        let refresher = Refresher::new(
            Arc::clone(&backend),
            Arc::clone(&credentials),
            config.refresh_path.clone(),
            config.request_timeout,
            config.cookie_refresh,
        );
        Self {
            backend,
            credentials,
            refresher,
            breakers: CircuitBreakers::new(config.breaker),
            config,
            metrics: None,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresher.is_available()
    }

    /// Refresh credentials outside of a 401 retry.
    pub async fn refresh_credentials(&self) -> Result<(), TransportError> {
        self.refresher.refresh(self.refresher.generation()).await
    }

    /// Every attempt of one send logs under the same request id.
    pub async fn send(&self, path: &str, options: SendOptions) -> Result<HttpResponse, TransportError> {
        let request_id = RequestId::new();
        let span = debug_span!("send", request_id = %request_id, path, method = ?options.method);
        self.send_with_retries(path, options).instrument(span).await
    }

    async fn send_with_retries(
        &self,
        path: &str,
        options: SendOptions,
    ) -> Result<HttpResponse, TransportError> {
        let bucket = options.bucket.clone().unwrap_or_else(|| bucket_for(path));
        let refresh_generation = self.refresher.generation();
        let mut refreshed = false;
        let mut rate_limit_retried = false;
        let mut server_retries = 0u32;

        loop {
            let ticket = self.admit(&bucket)?;
            let started = Instant::now();
            let outcome = self.attempt(path, &options).await;
            self.observe_latency(started);
            if ticket.settle(&outcome) {
                self.count("transport.breaker_trips", &[("bucket", bucket.as_str())]);
            }

            let err = match outcome {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };

            match &err {
                TransportError::Unauthorized { .. }
                    if !refreshed && !options.skip_auth_refresh && self.refresher.is_available() =>
                {
                    refreshed = true;
                    debug!(path, "401, refreshing credentials");
                    self.refresher.refresh(refresh_generation).await?;
                    self.note_retry("auth");
                }
                TransportError::RateLimited { retry_after, .. }
                    if !rate_limit_retried && !options.skip_rate_limit_retry =>
                {
                    let delay = retry_after.unwrap_or(self.config.default_retry_after);
                    if delay > self.config.max_retry_after {
                        warn!(path, delay_ms = delay.as_millis() as u64, "rate limited beyond wait bound");
                        return Err(err);
                    }
                    rate_limit_retried = true;
                    warn!(path, delay_ms = delay.as_millis() as u64, "rate limited, retrying once");
                    self.note_retry("rate_limited");
                    tokio::time::sleep(delay).await;
                }
                e if options.method == Method::Get
                    && (matches!(e, TransportError::Server { .. }) || e.is_transient())
                    && server_retries < self.config.max_server_retries =>
                {
                    let delay = self.config.backoff.delay(server_retries);
                    server_retries += 1;
                    warn!(
                        path,
                        attempt = server_retries,
                        max_retries = self.config.max_server_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    self.note_retry(e.error_kind());
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    fn admit<'a>(&'a self, bucket: &'a str) -> Result<BreakerTicket<'a>, TransportError> {
        match self.breakers.check(bucket) {
            Ok(admission) => Ok(BreakerTicket {
                breakers: &self.breakers,
                bucket,
                admission,
                settled: false,
            }),
            Err(e) => {
                debug!(bucket, "circuit open, short-circuiting");
                self.count("transport.short_circuits", &[("bucket", bucket)]);
                Err(e)
            }
        }
    }

    async fn attempt(&self, path: &str, options: &SendOptions) -> Result<HttpResponse, TransportError> {
        let request = self.build_request(path, options);
        let timeout = request.timeout;
        let resp = match tokio::time::timeout(timeout, self.backend.execute(request)).await {
            Err(_) => return Err(TransportError::Timeout(timeout)),
            Ok(r) => r?,
        };

        if resp.is_success() {
            return Ok(resp);
        }
        if resp.status == 429 {
            return Err(TransportError::RateLimited {
                retry_after: ratelimit::retry_after(&resp),
                rate_limit: Some(ratelimit::rate_limit_from_headers(&resp, chrono::Utc::now())),
            });
        }
        Err(TransportError::from_status(resp.status, resp.body))
    }

    fn build_request(&self, path: &str, options: &SendOptions) -> HttpRequest {
        let mut headers = options.headers.clone();
        if options.body.is_some() && !options.has_header("content-type") {
            headers.push(("content-type".into(), "application/json".into()));
        }
        if !options.has_header("accept") {
            headers.push(("accept".into(), "application/json".into()));
        }
        if options.no_cache {
            headers.push(("cache-control".into(), "no-cache".into()));
            headers.push(("pragma".into(), "no-cache".into()));
        }
        if !options.has_header("authorization") {
            if let Some(token) = self.credentials.access_token() {
                headers.push(("authorization".into(), bearer_value(&token)));
            }
        }

        HttpRequest {
            method: options.method,
            path: path.to_string(),
            headers,
            body: options.body.clone(),
            timeout: options.timeout.unwrap_or(self.config.request_timeout),
        }
    }

    fn note_retry(&self, reason: &str) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        self.count("transport.retries", &[("reason", reason)]);
    }

    fn count(&self, name: &str, labels: &[(&str, &str)]) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, labels, 1);
        }
    }

    fn observe_latency(&self, started: Instant) {
        if let Some(m) = &self.metrics {
            m.histogram_observe("transport.latency_ms", &[], started.elapsed().as_millis() as f64);
        }
    }
}

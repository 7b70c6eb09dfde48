//! Single-flight credential refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use vesper_core::errors::TransportError;
use vesper_store::CredentialStore;

use crate::backend::{HttpBackend, HttpRequest, Method};

/// Body of a successful refresh. Cookie-mode backends may send neither field.
#[derive(Debug, Default, Deserialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub struct Refresher {
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<dyn CredentialStore>,
    path: String,
    timeout: Duration,
    cookie_refresh: bool,
    gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    last_outcome: Mutex<Option<Result<(), TransportError>>>,
}

impl Refresher {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<dyn CredentialStore>,
        path: impl Into<String>,
        timeout: Duration,
        cookie_refresh: bool,
    ) -> Self {
        Self {
            backend,
            credentials,
            path: path.into(),
            timeout,
            cookie_refresh,
            gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
        }
    }

    /// A refresh token is stored, or the backend refreshes from a cookie.
    pub fn is_available(&self) -> bool {
        self.cookie_refresh || self.credentials.has_refresh_token()
    }

    /// Number of completed refreshes. Capture before sending a request
    /// and pass to [`Refresher::refresh`] after its 401.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Refresh unless one completed after `seen_generation`, in which case
    /// its outcome is reused.
    pub async fn refresh(&self, seen_generation: u64) -> Result<(), TransportError> {
        let _gate = self.gate.lock().await;

        // Double-check after acquiring the gate
        if self.generation() != seen_generation {
            if let Some(outcome) = self.last_outcome.lock().clone() {
                return outcome;
            }
        }

        let outcome = self.perform().await;
        *self.last_outcome.lock() = Some(outcome.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    async fn perform(&self) -> Result<(), TransportError> {
        let stored_refresh = self
            .credentials
            .load()
            .ok()
            .flatten()
            .and_then(|c| c.refresh_token);

        let mut headers = vec![("accept".to_string(), "application/json".to_string())];
        let body = stored_refresh.as_ref().map(|token| {
            headers.push(("content-type".to_string(), "application/json".to_string()));
            json!({ "refresh_token": token.expose_secret() })
        });

        let request = HttpRequest {
            method: Method::Post,
            path: self.path.clone(),
            headers,
            body,
            timeout: self.timeout,
        };

        let resp = match tokio::time::timeout(self.timeout, self.backend.execute(request)).await {
            Err(_) => Err(TransportError::Timeout(self.timeout)),
            Ok(r) => r,
        }
        .map_err(|e| {
            warn!(error = %e, "credential refresh did not complete");
            TransportError::RefreshFailed {
                status: None,
                message: e.to_string(),
            }
        })?;

        if resp.is_success() {
            let parsed: RefreshResponse = if resp.body.trim().is_empty() {
                RefreshResponse::default()
            } else {
                resp.json().unwrap_or_default()
            };
            if let Some(access) = parsed.access_token.as_deref() {
                let refresh = parsed
                    .refresh_token
                    .or_else(|| stored_refresh.map(|t| t.expose_secret().to_string()));
                if let Err(e) = self.credentials.set_tokens(access, refresh.as_deref()) {
                    warn!(error = %e, "failed to persist refreshed credentials");
                }
            }
            info!("credentials refreshed");
            return Ok(());
        }

        if matches!(resp.status, 400 | 401) {
            warn!(status = resp.status, "refresh rejected, clearing credentials");
            if let Err(e) = self.credentials.clear_tokens() {
                warn!(error = %e, "failed to clear credentials");
            }
        } else {
            warn!(status = resp.status, "refresh failed");
        }

        Err(TransportError::RefreshFailed {
            status: Some(resp.status),
            message: resp.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockReply};
    use vesper_store::MemoryCredentialStore;

    fn setup(cookie_refresh: bool) -> (Arc<MockBackend>, Arc<MemoryCredentialStore>, Refresher) {
        let backend = Arc::new(MockBackend::new());
        let creds = Arc::new(MemoryCredentialStore::new());
        let refresher = Refresher::new(
            backend.clone(),
            creds.clone(),
            "/v1/auth/refresh",
            Duration::from_secs(5),
            cookie_refresh,
        );
        (backend, creds, refresher)
    }

    #[tokio::test]
    async fn rotates_stored_tokens() {
        let (backend, creds, refresher) = setup(false);
        creds.set_tokens("old-access", Some("old-refresh")).unwrap();
        backend.on(
            "/v1/auth/refresh",
            MockReply::json(200, json!({"access_token": "new-access", "refresh_token": "new-refresh"})),
        );

        refresher.refresh(refresher.generation()).await.unwrap();

        let stored = creds.load().unwrap().unwrap();
        assert_eq!(stored.access_token.expose_secret(), "new-access");
        assert_eq!(stored.refresh_token.unwrap().expose_secret(), "new-refresh");
        let req = &backend.requests_to("/v1/auth/refresh")[0];
        assert_eq!(req.body.as_ref().unwrap()["refresh_token"], "old-refresh");
        assert_eq!(req.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn keeps_refresh_token_when_not_rotated() {
        let (backend, creds, refresher) = setup(false);
        creds.set_tokens("a", Some("r")).unwrap();
        backend.on("/v1/auth/refresh", MockReply::json(200, json!({"access_token": "a2"})));

        refresher.refresh(0).await.unwrap();
        let stored = creds.load().unwrap().unwrap();
        assert_eq!(stored.refresh_token.unwrap().expose_secret(), "r");
    }

    #[tokio::test]
    async fn cookie_mode_posts_without_body() {
        let (backend, _creds, refresher) = setup(true);
        assert!(refresher.is_available());
        backend.on("/v1/auth/refresh", MockReply::status(204));

        refresher.refresh(0).await.unwrap();
        let req = &backend.requests_to("/v1/auth/refresh")[0];
        assert!(req.body.is_none());
        assert_eq!(req.header("content-type"), None);
    }

    #[tokio::test]
    async fn rejection_clears_credentials() {
        for status in [400, 401] {
            let (backend, creds, refresher) = setup(false);
            creds.set_tokens("a", Some("r")).unwrap();
            backend.on("/v1/auth/refresh", MockReply::status(status));

            let err = refresher.refresh(0).await.unwrap_err();
            assert!(matches!(err, TransportError::RefreshFailed { status: Some(s), .. } if s == status));
            assert!(creds.load().unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn server_error_keeps_credentials() {
        let (backend, creds, refresher) = setup(false);
        creds.set_tokens("a", Some("r")).unwrap();
        backend.on("/v1/auth/refresh", MockReply::status(503));

        assert!(refresher.refresh(0).await.is_err());
        assert!(creds.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_without_token_or_cookie() {
        let (_backend, _creds, refresher) = setup(false);
        assert!(!refresher.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_refresh() {
        let (backend, creds, refresher) = setup(false);
        creds.set_tokens("a", Some("r")).unwrap();
        backend.on(
            "/v1/auth/refresh",
            MockReply::delayed(
                Duration::from_millis(200),
                MockReply::json(200, json!({"access_token": "a2"})),
            ),
        );

        let seen = refresher.generation();
        let (a, b, c) = tokio::join!(
            refresher.refresh(seen),
            refresher.refresh(seen),
            refresher.refresh(seen)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(backend.calls("/v1/auth/refresh"), 1);
        assert_eq!(refresher.generation(), seen + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_refresh_failure() {
        let (backend, creds, refresher) = setup(false);
        creds.set_tokens("a", Some("r")).unwrap();
        backend.on(
            "/v1/auth/refresh",
            MockReply::delayed(Duration::from_secs(10), MockReply::status(200)),
        );
        let err = refresher.refresh(0).await.unwrap_err();
        assert!(matches!(err, TransportError::RefreshFailed { status: None, .. }));
        assert!(creds.load().unwrap().is_some());
    }
}

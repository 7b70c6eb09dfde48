use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use vesper_core::settings::ApiSettings;
use vesper_core::{IdentityResponse, TransportError};
use vesper_transport::{ResilientTransport, SendOptions};

/// Thin client for the identity, logout and health endpoints.
pub struct IdentityClient {
    transport: Arc<ResilientTransport>,
    identity_path: String,
    logout_path: String,
    health_path: String,
}

impl IdentityClient {
    pub fn new(transport: Arc<ResilientTransport>, api: &ApiSettings) -> Self {
        Self {
            transport,
            identity_path: api.identity_path.clone(),
            logout_path: api.logout_path.clone(),
            health_path: api.health_path.clone(),
        }
    }

    pub fn transport(&self) -> &Arc<ResilientTransport> {
        &self.transport
    }

    /// One identity check, retries included, bounded by `timeout`. 401 and
    /// 429 are returned as-is; the orchestrator owns refresh and cooldown.
    pub async fn check(
        &self,
        no_cache: bool,
        timeout: Duration,
    ) -> Result<IdentityResponse, TransportError> {
        let mut options = SendOptions::get()
            .timeout(timeout)
            .skip_auth_refresh()
            .skip_rate_limit_retry();
        if no_cache {
            options = options.no_cache();
        }
        let resp = tokio::time::timeout(timeout, self.transport.send(&self.identity_path, options))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let cacheable = resp
            .header("cache-control")
            .map_or(true, |v| !v.to_ascii_lowercase().contains("no-store"));
        if cacheable {
            warn!(path = %self.identity_path, "identity response missing Cache-Control: no-store");
        }

        resp.json()
    }

    /// Invalidate the server-side session. The response status is ignored.
    pub async fn logout(&self) {
        let options = SendOptions::post(None).skip_auth_refresh();
        match self.transport.send(&self.logout_path, options).await {
            Ok(resp) => debug!(status = resp.status, "logout acknowledged"),
            Err(e) => debug!(error = %e, status = ?e.status(), "logout request failed, clearing locally anyway"),
        }
    }

    /// Probe backend reachability.
    pub async fn health(&self, timeout: Duration) -> Result<bool, TransportError> {
        let options = SendOptions::get().timeout(timeout).skip_auth_refresh().no_cache();
        match self.transport.send(&self.health_path, options).await {
            Ok(_) => Ok(true),
            Err(TransportError::Server { .. } | TransportError::Network(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

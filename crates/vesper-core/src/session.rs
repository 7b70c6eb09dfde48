use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the backend found the credential it validated.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuthSource {
    Cookie,
    Header,
    #[default]
    Missing,
}

/// Rate-limit bookkeeping taken from a 429 response.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub active: bool,
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Body of the identity endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityResponse {
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub session_ready: bool,
    #[serde(default)]
    pub source: AuthSource,
}

impl IdentityResponse {
    /// True only when the backend says authenticated *and* hands over a usable id.
    pub fn has_identity(&self) -> bool {
        self.is_authenticated && normalize_user_id(self.user_id.as_deref()).is_some()
    }
}

/// Trim a user id and reject empty or whitespace-only values.
pub fn normalize_user_id(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// Authenticated/unauthenticated view of the current user.
///
/// Replaced wholesale on every update; `version` identifies the check that
/// produced it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub is_authenticated: bool,
    pub session_ready: bool,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub source: AuthSource,
    pub whoami_ok: bool,
    pub error: Option<String>,
    pub version: u64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub rate_limit: Option<RateLimitInfo>,
}

impl SessionState {
    /// State produced by a successful identity response.
    ///
    /// `is_authenticated=true` without a usable user id collapses to an
    /// unauthenticated state with no user.
    pub fn from_identity(resp: &IdentityResponse, version: u64, now: DateTime<Utc>) -> Self {
        let user_id = normalize_user_id(resp.user_id.as_deref());
        let is_authenticated = resp.is_authenticated && user_id.is_some();
        let (user_id, email) = if is_authenticated {
            (user_id, resp.email.clone())
        } else {
            (None, None)
        };

        Self {
            is_authenticated,
            session_ready: is_authenticated && resp.session_ready,
            user_id,
            email,
            source: resp.source,
            whoami_ok: true,
            error: None,
            version,
            last_checked_at: Some(now),
            rate_limit: None,
        }
    }

    /// Copy of `self` with every identity field cleared.
    pub fn signed_out(&self, version: u64) -> Self {
        Self {
            version,
            last_checked_at: self.last_checked_at,
            ..Self::default()
        }
    }

    /// Compare everything a subscriber can observe, ignoring bookkeeping
    /// (`version`, `last_checked_at`) that changes on every check.
    pub fn same_view(&self, other: &Self) -> bool {
        self.is_authenticated == other.is_authenticated
            && self.session_ready == other.session_ready
            && self.user_id == other.user_id
            && self.email == other.email
            && self.source == other.source
            && self.whoami_ok == other.whoami_ok
            && self.error == other.error
            && self.rate_limit == other.rate_limit
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limit.as_ref().is_some_and(|rl| rl.active)
    }
}

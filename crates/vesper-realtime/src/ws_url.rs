use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::RealtimeError;

/// Build a socket URL from the HTTP API origin: `http` becomes `ws`,
/// `https` becomes `wss`. `token` is appended as `?token=` for backends
/// that cannot read the Authorization header on upgrade.
pub fn websocket_url(
    origin: &str,
    path: &str,
    token: Option<&SecretString>,
) -> Result<String, RealtimeError> {
    let base = Url::parse(origin).map_err(|e| RealtimeError::InvalidUrl(format!("{origin}: {e}")))?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(RealtimeError::InvalidUrl(format!("unsupported scheme {other}"))),
    };

    let mut url = base
        .join(path)
        .map_err(|e| RealtimeError::InvalidUrl(format!("{path}: {e}")))?;
    url.set_scheme(scheme)
        .map_err(|()| RealtimeError::InvalidUrl(format!("cannot use scheme {scheme}")))?;

    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token.expose_secret());
    }
    Ok(url.into())
}

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use vesper_core::errors::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound attempt as handed to a backend.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the API origin, query string included.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// The wire. Returns `Ok` for every HTTP status; `Err` only when no
/// response arrived.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = HttpResponse::new(200).with_header("Retry-After", "3");
        assert_eq!(resp.header("retry-after"), Some("3"));
        assert_eq!(resp.header("RETRY-AFTER"), Some("3"));

        let req = HttpRequest {
            method: Method::Get,
            path: "/".into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(req.header("content-type"), Some("application/json"));
    }

    #[test]
    fn json_decode_error_is_typed() {
        let resp = HttpResponse::new(200).with_body("not json");
        let err = resp.json::<Value>().unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn success_range() {
        assert!(HttpResponse::new(204).is_success());
        assert!(!HttpResponse::new(301).is_success());
        assert!(!HttpResponse::new(500).is_success());
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use vesper_core::errors::TransportError;

use crate::backend::{HttpBackend, HttpRequest, HttpResponse, Method};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// reqwest-backed wire with a cookie jar, so cookie-mode sessions and
/// refreshes work like they do in a browser.
pub struct ReqwestBackend {
    client: Client,
    origin: String,
}

impl ReqwestBackend {
    pub fn new(origin: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .cookie_store(true)
            .build()
            .map_err(|e| TransportError::Network(format!("http client: {e}")))?;
        Ok(Self {
            client,
            origin: origin.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.origin, path)
        }
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut req = self
            .client
            .request(method, self.url(&request.path))
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            let bytes =
                serde_json::to_vec(body).map_err(|e| TransportError::Decode(e.to_string()))?;
            req = req.body(bytes);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

//! Scripted backend for deterministic tests without a server.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use vesper_core::errors::TransportError;

use crate::backend::{HttpBackend, HttpRequest, HttpResponse};

/// One scripted outcome.
#[derive(Clone, Debug)]
pub enum MockReply {
    Response(HttpResponse),
    /// Fail without a response (network error, timeout).
    Error(TransportError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        Self::Response(HttpResponse::new(status))
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self::Response(
            HttpResponse::new(status)
                .with_header("content-type", "application/json")
                .with_body(body.to_string()),
        )
    }

    pub fn error(error: TransportError) -> Self {
        Self::Error(error)
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// Add a response header. Applies through any `Delay` wrappers.
    pub fn with_header(self, name: &str, value: &str) -> Self {
        match self {
            Self::Response(resp) => Self::Response(resp.with_header(name, value)),
            Self::Delay(d, inner) => Self::Delay(d, Box::new(inner.with_header(name, value))),
            other => other,
        }
    }
}

/// Backend answering from per-path reply queues.
///
/// Routing ignores the query string. The last reply for a path repeats
/// once its queue is down to one entry; unscripted paths answer 404.
#[derive(Default)]
pub struct MockBackend {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

fn route_key(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append replies for `path`.
    pub fn script(&self, path: &str, replies: impl IntoIterator<Item = MockReply>) {
        self.routes
            .lock()
            .entry(route_key(path).to_string())
            .or_default()
            .extend(replies);
    }

    pub fn on(&self, path: &str, reply: MockReply) {
        self.script(path, [reply]);
    }

    /// Drop every queued reply for `path`.
    pub fn reset(&self, path: &str) {
        self.routes.lock().remove(route_key(path));
    }

    /// Requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        let key = route_key(path);
        self.requests
            .lock()
            .iter()
            .filter(|r| route_key(&r.path) == key)
            .cloned()
            .collect()
    }

    pub fn calls(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_reply(&self, path: &str) -> MockReply {
        let mut routes = self.routes.lock();
        match routes.get_mut(route_key(path)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(MockReply::status(404)),
            Some(queue) => queue.front().cloned().unwrap_or(MockReply::status(404)),
            None => MockReply::status(404),
        }
    }
}

#[async_trait]
impl HttpBackend for MockBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut reply = self.next_reply(&request.path);
        self.requests.lock().push(request);

        loop {
            match reply {
                MockReply::Response(resp) => return Ok(resp),
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
            }
        }
    }
}

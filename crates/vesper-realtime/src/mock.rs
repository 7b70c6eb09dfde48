//! In-memory [`SocketConnector`] for tests.
//!
//! Each successful connect produces a [`MockSocket`] handle that plays the
//! server side: it can push frames, close the socket and read what the hub sent.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connector::{ConnectRequest, SocketConnector, SocketEvent, SocketLink};
use crate::error::RealtimeError;

#[derive(Clone)]
pub struct MockSocket {
    pub request: ConnectRequest,
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockSocket {
    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.send(SocketEvent::Text(text.to_string()));
    }

    pub fn close(&self, reason: &str) {
        let _ = self.to_client.send(SocketEvent::Closed {
            reason: Some(reason.to_string()),
        });
    }

    /// Everything the hub has written to this socket so far.
    pub fn sent(&self) -> Vec<String> {
        let mut received = self.received.lock();
        let mut rx = self.from_client.lock();
        while let Ok(text) = rx.try_recv() {
            received.push(text);
        }
        received.clone()
    }

    /// True once the hub dropped its end.
    pub fn is_closed_by_client(&self) -> bool {
        self.to_client.is_closed()
    }
}

#[derive(Default)]
struct State {
    failures: HashMap<String, VecDeque<String>>,
    attempts: Vec<ConnectRequest>,
    sockets: Vec<MockSocket>,
}

#[derive(Default)]
pub struct MockConnector {
    state: Mutex<State>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `times` connects for `topic`.
    pub fn fail_next(&self, topic: &str, times: usize, reason: &str) {
        self.state
            .lock()
            .failures
            .entry(topic.to_string())
            .or_default()
            .extend(std::iter::repeat(reason.to_string()).take(times));
    }

    pub fn attempts(&self, topic: &str) -> usize {
        self.state
            .lock()
            .attempts
            .iter()
            .filter(|r| r.topic == topic)
            .count()
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.state.lock().attempts.clone()
    }

    /// Most recent socket opened for `topic`.
    pub fn socket(&self, topic: &str) -> Option<MockSocket> {
        self.state
            .lock()
            .sockets
            .iter()
            .rev()
            .find(|s| s.request.topic == topic)
            .cloned()
    }

    pub fn sockets(&self, topic: &str) -> usize {
        self.state
            .lock()
            .sockets
            .iter()
            .filter(|s| s.request.topic == topic)
            .count()
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketLink, RealtimeError> {
        let mut state = self.state.lock();
        state.attempts.push(request.clone());

        if let Some(reason) = state
            .failures
            .get_mut(&request.topic)
            .and_then(VecDeque::pop_front)
        {
            return Err(RealtimeError::Connect(reason));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        state.sockets.push(MockSocket {
            request: request.clone(),
            to_client: in_tx,
            from_client: Arc::new(Mutex::new(out_rx)),
            received: Arc::new(Mutex::new(Vec::new())),
        });

        Ok(SocketLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

//! One reconnecting socket per topic.
//!
//! Each topic runs its own loop with its own backoff. Outbound payloads
//! submitted while a topic is down wait in a bounded FIFO queue that is
//! flushed, after the optional subscribe handshake, as soon as the socket
//! opens. Inbound frames are republished on a broadcast channel.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use vesper_core::backoff::Backoff;
use vesper_core::events::RealtimeEvent;
use vesper_core::settings::{clamped_millis, ApiSettings, RealtimeSettings, TopicSettings};
use vesper_core::ConnectionStatus;
use vesper_store::credentials::bearer_value;
use vesper_store::CredentialStore;
use vesper_telemetry::MetricsRecorder;

use crate::connector::{ConnectRequest, SocketConnector, SocketEvent};
use crate::envelope;
use crate::error::RealtimeError;
use crate::ws_url::websocket_url;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct TopicConfig {
    pub name: String,
    pub path: String,
    /// Sent first on every open.
    pub subscribe: Option<Value>,
}

impl From<&TopicSettings> for TopicConfig {
    fn from(settings: &TopicSettings) -> Self {
        Self {
            name: settings.name.clone(),
            path: settings.path.clone(),
            subscribe: settings.subscribe.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub origin: String,
    pub backoff: Backoff,
    pub max_queue: usize,
    pub legacy_token_query: bool,
    pub topics: Vec<TopicConfig>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::from_settings(&ApiSettings::default(), &RealtimeSettings::default())
    }
}

impl RealtimeConfig {
    pub fn from_settings(api: &ApiSettings, realtime: &RealtimeSettings) -> Self {
        Self {
            origin: api.origin.clone(),
            backoff: Backoff::new(
                clamped_millis(realtime.base_delay_ms),
                clamped_millis(realtime.max_delay_ms),
                realtime.jitter_factor,
            ),
            max_queue: realtime.max_queue.max(1),
            legacy_token_query: realtime.legacy_token_query,
            topics: realtime.topics.iter().map(TopicConfig::from).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Held until the topic's next open.
    Queued,
}

/// Decides whether a topic may (re)connect. `Err(reason)` ends the topic
/// with a terminal failure until [`RealtimeHub::restart`].
pub type ReconnectGate = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

struct Topic {
    config: TopicConfig,
    status: ConnectionStatus,
    queue: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<CancellationToken>,
}

pub struct RealtimeHub {
    connector: Arc<dyn SocketConnector>,
    credentials: Option<Arc<dyn CredentialStore>>,
    config: RealtimeConfig,
    topics: DashMap<String, Topic>,
    events: broadcast::Sender<RealtimeEvent>,
    running: Mutex<Option<CancellationToken>>,
    gate: RwLock<Option<ReconnectGate>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl RealtimeHub {
    pub fn new(connector: Arc<dyn SocketConnector>, config: RealtimeConfig) -> Self {
        let topics = config
            .topics
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    Topic {
                        config: t.clone(),
                        status: ConnectionStatus::default(),
                        queue: VecDeque::new(),
                        outbound: None,
                        task: None,
                    },
                )
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            connector,
            credentials: None,
            config,
            topics,
            events,
            running: Mutex::new(None),
            gate: RwLock::new(None),
            metrics: None,
        }
    }

    /// Use stored access tokens for header auth on upgrade.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn set_gate(&self, gate: Option<ReconnectGate>) {
        *self.gate.write() = gate;
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn topics(&self) -> Vec<String> {
        self.config.topics.iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start every topic loop. False if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let root = {
            let mut running = self.running.lock();
            if running.is_some() {
                return false;
            }
            let root = CancellationToken::new();
            *running = Some(root.clone());
            root
        };

        info!(topics = self.topics.len(), "realtime hub starting");
        for topic in self.topics() {
            self.spawn_topic(&topic, &root);
        }
        true
    }

    /// Close every socket and cancel pending reconnects. Queued payloads
    /// are kept for the next start.
    pub fn stop(&self) {
        let Some(root) = self.running.lock().take() else {
            return;
        };
        root.cancel();
        for mut entry in self.topics.iter_mut() {
            let topic = entry.value_mut();
            topic.task = None;
            topic.outbound = None;
            topic.status.mark_closed();
        }
        info!("realtime hub stopped");
    }

    /// Restart a topic, clearing a terminal failure. False when the hub is
    /// not running or the topic is unknown.
    pub fn restart(self: &Arc<Self>, topic: &str) -> bool {
        let Some(root) = self.running.lock().clone() else {
            return false;
        };
        {
            let Some(mut entry) = self.topics.get_mut(topic) else {
                return false;
            };
            if let Some(task) = entry.task.take() {
                task.cancel();
            }
            entry.outbound = None;
            entry.status = ConnectionStatus {
                last_failure_time: entry.status.last_failure_time,
                ..ConnectionStatus::default()
            };
        }
        info!(topic, "restarting realtime topic");
        self.spawn_topic(topic, &root);
        true
    }

    /// Stop retrying `topic` and emit a terminal failure.
    pub fn give_up(&self, topic: &str, reason: &str) {
        {
            let Some(mut entry) = self.topics.get_mut(topic) else {
                return;
            };
            if let Some(task) = entry.task.take() {
                task.cancel();
            }
            entry.outbound = None;
            entry.status.mark_failed(reason, Utc::now());
            entry.status.terminal = true;
        }
        warn!(topic, reason, "realtime topic gave up");
        self.emit(RealtimeEvent::ConnectionFailed {
            topic: topic.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Send now if the topic is open, otherwise queue.
    pub fn send(&self, topic: &str, payload: &Value) -> Result<SendOutcome, RealtimeError> {
        let text = serde_json::to_string(payload).map_err(|e| RealtimeError::Payload(e.to_string()))?;
        let mut entry = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| RealtimeError::UnknownTopic(topic.to_string()))?;
        let entry = entry.value_mut();

        if entry.status.is_open && entry.queue.is_empty() {
            if let Some(tx) = &entry.outbound {
                if tx.send(text.clone()).is_ok() {
                    return Ok(SendOutcome::Sent);
                }
            }
        }

        if entry.queue.len() >= self.config.max_queue {
            entry.queue.pop_front();
            warn!(topic, max = self.config.max_queue, "outbound queue full, dropped oldest payload");
            self.count("realtime.dropped_frames", topic, "queue_full");
        }
        entry.queue.push_back(text);
        debug!(topic, queued = entry.queue.len(), "payload queued");
        self.queue_depth(topic, entry.queue.len());
        Ok(SendOutcome::Queued)
    }

    pub fn get_connection_status(&self, topic: &str) -> Option<ConnectionStatus> {
        self.topics.get(topic).map(|t| t.status.clone())
    }

    pub fn queued(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.queue.len())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    fn spawn_topic(self: &Arc<Self>, topic: &str, root: &CancellationToken) {
        let token = root.child_token();
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.task = Some(token.clone());
        }
        let span = info_span!("realtime", topic);
        tokio::spawn(run_topic(Arc::downgrade(self), topic.to_string(), token).instrument(span));
    }

    fn connect_request(&self, topic: &str) -> Result<ConnectRequest, RealtimeError> {
        let path = self
            .topics
            .get(topic)
            .map(|t| t.config.path.clone())
            .ok_or_else(|| RealtimeError::UnknownTopic(topic.to_string()))?;

        let token = self.credentials.as_ref().and_then(|c| c.access_token());
        let query_token = token.as_ref().filter(|_| self.config.legacy_token_query);
        let url = websocket_url(&self.config.origin, &path, query_token)?;
        let headers = token
            .as_ref()
            .map(|t| vec![("authorization".to_string(), bearer_value(t))])
            .unwrap_or_default();

        Ok(ConnectRequest {
            topic: topic.to_string(),
            url,
            headers,
        })
    }

    fn check_gate(&self, topic: &str) -> Result<(), String> {
        match self.gate.read().as_ref() {
            Some(gate) => gate(topic),
            None => Ok(()),
        }
    }

    fn mark_connecting(&self, topic: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.status.mark_connecting();
        }
    }

    /// Handshake, then the queue in submission order, then mark open.
    fn on_open(&self, topic: &str, outbound: mpsc::UnboundedSender<String>) {
        let flushed = {
            let Some(mut entry) = self.topics.get_mut(topic) else {
                return;
            };
            let entry = entry.value_mut();

            if let Some(subscribe) = &entry.config.subscribe {
                let _ = outbound.send(subscribe.to_string());
            }
            let mut flushed = 0usize;
            while let Some(text) = entry.queue.pop_front() {
                if let Err(mpsc::error::SendError(text)) = outbound.send(text) {
                    entry.queue.push_front(text);
                    break;
                }
                flushed += 1;
            }
            entry.outbound = Some(outbound);
            entry.status.mark_open();
            self.queue_depth(topic, entry.queue.len());
            flushed
        };

        info!(topic, flushed, "realtime socket open");
        self.emit(RealtimeEvent::Connected {
            topic: topic.to_string(),
        });
    }

    fn on_closed(&self, topic: &str, reason: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.outbound = None;
            entry.status.mark_failed(reason, Utc::now());
        }
    }

    /// Bump the retry count and return the delay before the next attempt.
    fn schedule_retry(&self, topic: &str) -> Duration {
        let attempt = match self.topics.get_mut(topic) {
            Some(mut entry) => {
                let attempt = entry.status.retry_count;
                entry.status.retry_count = attempt.saturating_add(1);
                attempt
            }
            None => 0,
        };
        let delay = self.config.backoff.delay(attempt);

        debug!(topic, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.count("realtime.reconnects", topic, "scheduled");
        self.emit(RealtimeEvent::Reconnecting {
            topic: topic.to_string(),
            attempt: attempt + 1,
            delay_ms: delay.as_millis() as u64,
        });
        delay
    }

    fn on_frame(&self, topic: &str, text: &str) {
        match envelope::parse_or_drop(topic, text) {
            Some(event) => self.emit(event),
            None => self.count("realtime.dropped_frames", topic, "malformed"),
        }
    }

    fn emit(&self, event: RealtimeEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn queue_depth(&self, topic: &str, depth: usize) {
        if let Some(m) = &self.metrics {
            m.gauge_set("realtime.queue_depth", &[("topic", topic)], depth as f64);
        }
    }

    fn count(&self, name: &str, topic: &str, reason: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, &[("topic", topic), ("reason", reason)], 1);
        }
    }
}

/// Connect, pump frames until close, back off, repeat. Exits on
/// cancellation, when the gate refuses, or when the hub is dropped.
async fn run_topic(hub: Weak<RealtimeHub>, topic: String, token: CancellationToken) {
    loop {
        let Some(this) = hub.upgrade() else { return };

        if let Err(reason) = this.check_gate(&topic) {
            if !token.is_cancelled() {
                this.give_up(&topic, &reason);
            }
            return;
        }

        let request = match this.connect_request(&topic) {
            Ok(request) => request,
            Err(e) => {
                this.give_up(&topic, &e.to_string());
                return;
            }
        };

        this.mark_connecting(&topic);
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            r = this.connector.connect(&request) => r,
        };

        match connected {
            Ok(link) => {
                this.on_open(&topic, link.outbound);
                let mut inbound = link.inbound;
                let reason = loop {
                    let event = tokio::select! {
                        _ = token.cancelled() => return,
                        e = inbound.recv() => e,
                    };
                    match event {
                        Some(SocketEvent::Text(text)) => this.on_frame(&topic, &text),
                        Some(SocketEvent::Closed { reason }) => {
                            break reason.unwrap_or_else(|| "closed".to_string())
                        }
                        None => break "connection lost".to_string(),
                    }
                };
                if token.is_cancelled() {
                    return;
                }
                info!(topic = %topic, reason = %reason, "realtime socket closed");
                this.on_closed(&topic, &reason);
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "realtime connect failed");
                this.on_closed(&topic, &e.to_string());
            }
        }

        let delay = this.schedule_retry(&topic);
        drop(this);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

static GLOBAL: RwLock<Option<Arc<RealtimeHub>>> = parking_lot::const_rwlock(None);

pub fn install_global(hub: Arc<RealtimeHub>) -> Option<Arc<RealtimeHub>> {
    GLOBAL.write().replace(hub)
}

pub fn global() -> Option<Arc<RealtimeHub>> {
    GLOBAL.read().clone()
}

/// Remove the process-wide hub and close its sockets.
pub fn reset_global() {
    if let Some(hub) = GLOBAL.write().take() {
        hub.stop();
    }
}

//! Logout fan-out between tabs.
//!
//! [`BroadcastBus`] is an in-process stand-in for a same-origin broadcast
//! channel: every subscriber of a named channel sees every frame, including
//! its own, so listeners filter by origin.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vesper_core::events::AuthBroadcast;
use vesper_core::ids::TabId;
use vesper_core::SessionState;

use crate::error::SessionError;
use crate::orchestrator::{RefreshOptions, SessionOrchestrator};

pub const AUTH_CHANNEL: &str = "auth";

const DEFAULT_CAPACITY: usize = 64;

/// Views that must not bounce to the login view again.
const AUTH_VIEWS: &[&str] = &["/login", "/logout", "/auth", "/signup"];

#[derive(Clone, Debug)]
pub struct BusFrame {
    pub origin: TabId,
    pub payload: String,
}

/// Named broadcast channels shared by every tab in the process.
#[derive(Clone)]
pub struct BroadcastBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<BusFrame>>>>,
    capacity: usize,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Open `name` for tab `tab`.
    pub fn open(&self, name: &str, tab: TabId) -> BroadcastChannel {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        BroadcastChannel {
            name: name.to_string(),
            tab,
            sender,
        }
    }
}

pub struct BroadcastChannel {
    name: String,
    tab: TabId,
    sender: broadcast::Sender<BusFrame>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tab(&self) -> &TabId {
        &self.tab
    }

    /// Returns how many listeners received the frame. Zero is not an error.
    pub fn post(&self, message: &AuthBroadcast) -> Result<usize, SessionError> {
        let frame = BusFrame {
            origin: self.tab.clone(),
            payload: serde_json::to_string(message)?,
        };
        Ok(self.sender.send(frame).unwrap_or(0))
    }

    pub fn post_raw(&self, payload: impl Into<String>) -> usize {
        let frame = BusFrame {
            origin: self.tab.clone(),
            payload: payload.into(),
        };
        self.sender.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusFrame> {
        self.sender.subscribe()
    }
}

/// Routing seam for the embedding shell.
pub trait Navigator: Send + Sync {
    fn current_view(&self) -> String;

    /// `from_broadcast` marks navigations triggered by another tab.
    fn navigate_to_login(&self, from_broadcast: bool);
}

pub fn is_auth_view(view: &str) -> bool {
    AUTH_VIEWS
        .iter()
        .any(|prefix| view == *prefix || view.starts_with(&format!("{prefix}/")) || view.starts_with(&format!("{prefix}?")))
}

pub struct CrossTabChannel {
    channel: BroadcastChannel,
    session: Arc<SessionOrchestrator>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CrossTabChannel {
    /// Join the "auth" channel and start reacting to logout broadcasts.
    pub fn new(
        bus: &BroadcastBus,
        tab: TabId,
        session: Arc<SessionOrchestrator>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let channel = bus.open(AUTH_CHANNEL, tab);
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(
            channel.subscribe(),
            channel.tab().clone(),
            Arc::clone(&session),
            navigator,
            cancel.clone(),
        ));

        Self {
            channel,
            session,
            cancel,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn tab(&self) -> &TabId {
        self.channel.tab()
    }

    /// Log out locally, then tell every other tab.
    pub async fn logout(&self) -> Result<SessionState, SessionError> {
        let state = self.session.logout().await;
        self.post_logout()?;
        Ok(state)
    }

    pub fn post_logout(&self) -> Result<usize, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::ChannelClosed(self.channel.name().to_string()));
        }
        let message = AuthBroadcast::Logout {
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin: Some(self.channel.tab().clone()),
        };
        let delivered = self.channel.post(&message)?;
        debug!(tab_id = %self.tab(), delivered, "logout broadcast posted");
        Ok(delivered)
    }

    /// Stop listening. Further posts fail with [`SessionError::ChannelClosed`].
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for CrossTabChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn listen(
    mut rx: broadcast::Receiver<BusFrame>,
    tab: TabId,
    session: Arc<SessionOrchestrator>,
    navigator: Arc<dyn Navigator>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            r = rx.recv() => r,
        };

        let frame = match received {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(tab_id = %tab, skipped, "auth broadcast listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if frame.origin == tab {
            continue;
        }

        match serde_json::from_str::<AuthBroadcast>(&frame.payload) {
            Ok(AuthBroadcast::Logout { timestamp, .. }) => {
                info!(tab_id = %tab, origin = %frame.origin, timestamp, "logout broadcast received");
                session.clear_local_state();

                let s = Arc::clone(&session);
                tokio::spawn(async move {
                    s.refresh_auth(RefreshOptions::forced()).await;
                });

                let view = navigator.current_view();
                if !is_auth_view(&view) {
                    navigator.navigate_to_login(true);
                }
            }
            Err(e) => debug!(tab_id = %tab, error = %e, "ignoring malformed auth broadcast"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use vesper_core::settings::ApiSettings;
    use vesper_store::{MemoryCredentialStore, SessionFlags};
    use vesper_transport::mock::{MockBackend, MockReply};
    use vesper_transport::{ResilientTransport, TransportConfig};

    use crate::identity::IdentityClient;
    use crate::orchestrator::SessionConfig;

    const WHOAMI: &str = "/v1/whoami";
    const LOGOUT: &str = "/v1/auth/logout";

    #[derive(Default)]
    struct RecordingNavigator {
        view: Mutex<String>,
        navigations: Mutex<Vec<bool>>,
    }

    impl Navigator for RecordingNavigator {
        fn current_view(&self) -> String {
            self.view.lock().clone()
        }

        fn navigate_to_login(&self, from_broadcast: bool) {
            self.navigations.lock().push(from_broadcast);
        }
    }

    struct Tab {
        backend: Arc<MockBackend>,
        session: Arc<SessionOrchestrator>,
        navigator: Arc<RecordingNavigator>,
        channel: CrossTabChannel,
    }

    fn signed_in() -> MockReply {
        MockReply::json(
            200,
            json!({"is_authenticated": true, "user_id": "u-1", "session_ready": true, "source": "cookie"}),
        )
        .with_header("cache-control", "no-store")
    }

    fn anonymous() -> MockReply {
        MockReply::json(200, json!({"is_authenticated": false})).with_header("cache-control", "no-store")
    }

    fn open_tab(bus: &BroadcastBus, view: &str) -> Tab {
        let backend = Arc::new(MockBackend::new());
        let mut config = TransportConfig::default();
        config.cookie_refresh = false;
        let transport = Arc::new(ResilientTransport::new(
            backend.clone(),
            MemoryCredentialStore::shared(),
            config,
        ));
        let identity = Arc::new(IdentityClient::new(transport, &ApiSettings::default()));
        let session = Arc::new(SessionOrchestrator::new(
            identity,
            Arc::new(SessionFlags::new()),
            SessionConfig::default(),
        ));
        let navigator = Arc::new(RecordingNavigator {
            view: Mutex::new(view.to_string()),
            ..Default::default()
        });
        let channel = CrossTabChannel::new(bus, TabId::new(), Arc::clone(&session), navigator.clone());
        Tab {
            backend,
            session,
            navigator,
            channel,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn logout_fans_out_to_other_tabs() {
        let bus = BroadcastBus::new();
        let a = open_tab(&bus, "/chat");
        let b = open_tab(&bus, "/tv");

        a.backend.on(WHOAMI, signed_in());
        a.backend.on(LOGOUT, MockReply::status(204));
        b.backend.script(
            WHOAMI,
            [signed_in(), MockReply::delayed(Duration::from_secs(1), anonymous())],
        );
        a.session.refresh_auth(RefreshOptions::default()).await;
        b.session.refresh_auth(RefreshOptions::default()).await;
        assert!(b.session.get_state().is_authenticated);

        let state = a.channel.logout().await.unwrap();
        assert!(!state.is_authenticated);
        settle().await;

        // Cleared before the forced recheck answers.
        assert!(!b.session.get_state().is_authenticated);
        assert!(b.session.is_check_in_flight());
        assert_eq!(b.backend.calls(WHOAMI), 2);
        let recheck = b.backend.requests_to(WHOAMI).pop().unwrap();
        assert_eq!(recheck.header("cache-control"), Some("no-cache"));

        assert_eq!(*b.navigator.navigations.lock(), vec![true]);
        assert!(a.navigator.navigations.lock().is_empty(), "originator ignores its own frame");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let state = b.session.get_state();
        assert!(!state.is_authenticated);
        assert!(state.whoami_ok);
    }

    #[tokio::test]
    async fn auth_views_are_not_redirected() {
        let bus = BroadcastBus::new();
        let a = open_tab(&bus, "/chat");
        let b = open_tab(&bus, "/login?next=/chat");
        b.backend.on(WHOAMI, anonymous());

        a.channel.post_logout().unwrap();
        settle().await;

        assert!(b.navigator.navigations.lock().is_empty());
        assert_eq!(b.backend.calls(WHOAMI), 1);
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let bus = BroadcastBus::new();
        let b = open_tab(&bus, "/chat");
        let stranger = bus.open(AUTH_CHANNEL, TabId::new());

        stranger.post_raw("not json");
        stranger.post_raw(r#"{"type":"login","timestamp":1}"#);
        settle().await;

        assert!(b.navigator.navigations.lock().is_empty());
        assert_eq!(b.backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn minimal_logout_schema_is_honoured() {
        let bus = BroadcastBus::new();
        let b = open_tab(&bus, "/chat");
        b.backend.on(WHOAMI, anonymous());
        let stranger = bus.open(AUTH_CHANNEL, TabId::new());

        stranger.post_raw(r#"{"type":"logout","timestamp":1700000000000}"#);
        settle().await;

        assert_eq!(*b.navigator.navigations.lock(), vec![true]);
        assert_eq!(b.backend.calls(WHOAMI), 1);
    }

    #[tokio::test]
    async fn closed_channel_refuses_posts() {
        let bus = BroadcastBus::new();
        let a = open_tab(&bus, "/chat");
        a.channel.close();
        assert!(matches!(
            a.channel.post_logout(),
            Err(SessionError::ChannelClosed(name)) if name == AUTH_CHANNEL
        ));
    }

    #[test]
    fn auth_view_matching() {
        assert!(is_auth_view("/login"));
        assert!(is_auth_view("/auth/callback"));
        assert!(is_auth_view("/login?from=broadcast"));
        assert!(!is_auth_view("/loginhelp"));
        assert!(!is_auth_view("/chat"));
    }
}

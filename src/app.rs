//! Wires settings into the full client: store, transport, session,
//! bootstrap, cross-tab channel and realtime hub.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vesper_core::events::RealtimeEvent;
use vesper_core::ids::TabId;
use vesper_core::settings::VesperSettings;
use vesper_core::{SessionState, Subscription, TransportError};
use vesper_realtime::{RealtimeConfig, RealtimeHub, TungsteniteConnector};
use vesper_session::{
    BootstrapConfig, BootstrapCoordinator, BootstrapHooks, BroadcastBus, CrossTabChannel,
    IdentityClient, Navigator, RefreshOptions, SessionConfig, SessionOrchestrator,
};
use vesper_store::{CredentialStore, Database, MemoryCredentialStore, SessionFlags, SqliteCredentialStore};
use vesper_telemetry::{LogQuery, TelemetryGuard};
use vesper_transport::{ReqwestBackend, ResilientTransport, TransportConfig};

/// Terminal stand-in for browser routing.
struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn current_view(&self) -> String {
        "/".to_string()
    }

    fn navigate_to_login(&self, from_broadcast: bool) {
        warn!(from_broadcast, "signed out, sign in again to resume");
    }
}

struct AppHooks {
    session: Arc<SessionOrchestrator>,
    identity: Arc<IdentityClient>,
    realtime: Arc<RealtimeHub>,
    health_timeout: Duration,
}

#[async_trait]
impl BootstrapHooks for AppHooks {
    async fn setup(&self) -> anyhow::Result<()> {
        let state = self.session.initialize().await;
        info!(
            authenticated = state.is_authenticated,
            whoami_ok = state.whoami_ok,
            "session initialized"
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, TransportError> {
        self.identity.health(self.health_timeout).await
    }

    /// Keep the hub running exactly while the session is authenticated.
    async fn auth_bootstrap(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (tx, mut rx) = watch::channel(self.session.get_state().is_authenticated);
        let _subscription: Subscription = self.session.subscribe(move |state: &SessionState| {
            let _ = tx.send(state.is_authenticated);
        });

        loop {
            let authenticated = *rx.borrow_and_update();
            if authenticated {
                if self.realtime.start() {
                    info!("realtime started for authenticated session");
                }
            } else if self.realtime.is_running() {
                info!("session signed out, stopping realtime");
                self.realtime.stop();
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.realtime.stop();
        Ok(())
    }
}

pub struct App {
    settings: VesperSettings,
    telemetry: TelemetryGuard,
    session: Arc<SessionOrchestrator>,
    bootstrap: Arc<BootstrapCoordinator>,
    realtime: Arc<RealtimeHub>,
    cross_tab: CrossTabChannel,
}

impl App {
    pub fn build(settings: VesperSettings, telemetry: TelemetryGuard) -> anyhow::Result<Self> {
        let metrics = telemetry.metrics();
        let credentials = open_credentials(settings.api.credentials_path.as_deref())?;

        let backend = Arc::new(ReqwestBackend::new(settings.api.origin.clone())?);
        let transport = Arc::new(
            ResilientTransport::new(
                backend,
                Arc::clone(&credentials),
                TransportConfig::from_settings(&settings.api, &settings.transport),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let identity = Arc::new(IdentityClient::new(transport, &settings.api));

        let session = Arc::new(
            SessionOrchestrator::new(
                Arc::clone(&identity),
                Arc::new(SessionFlags::new()),
                SessionConfig::from_settings(&settings.session),
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        let realtime = Arc::new(
            RealtimeHub::new(
                Arc::new(TungsteniteConnector::new()),
                RealtimeConfig::from_settings(&settings.api, &settings.realtime),
            )
            .with_credentials(credentials)
            .with_metrics(metrics),
        );
        let gate_session = Arc::clone(&session);
        realtime.set_gate(Some(Arc::new(move |_topic: &str| {
            if gate_session.get_state().is_authenticated {
                Ok(())
            } else {
                Err("not authenticated".to_string())
            }
        })));

        let bootstrap_config = BootstrapConfig::from_settings(&settings.bootstrap);
        let hooks = Arc::new(AppHooks {
            session: Arc::clone(&session),
            identity,
            realtime: Arc::clone(&realtime),
            health_timeout: bootstrap_config.health_timeout,
        });
        let bootstrap = Arc::new(BootstrapCoordinator::new(hooks, bootstrap_config));

        let cross_tab = CrossTabChannel::new(
            &BroadcastBus::new(),
            TabId::new(),
            Arc::clone(&session),
            Arc::new(ConsoleNavigator),
        );

        vesper_session::orchestrator::install_global(Arc::clone(&session));
        vesper_session::bootstrap::install_global(Arc::clone(&bootstrap));
        vesper_realtime::hub::install_global(Arc::clone(&realtime));

        Ok(Self {
            settings,
            telemetry,
            session,
            bootstrap,
            realtime,
            cross_tab,
        })
    }

    /// Bootstrap, poll health and keep realtime up until Ctrl-C.
    pub async fn run(&self) -> anyhow::Result<()> {
        let _bootstrap_log = self.bootstrap.subscribe(|state| {
            info!(
                initialized = state.is_initialized,
                reachable = ?state.backend_reachable,
                health_polling = state.health_polling_active,
                auth_bootstrap = state.auth_bootstrap_active,
                error = ?state.bootstrap_error,
                "bootstrap state"
            );
        });
        let _session_log = self.session.subscribe(|state| {
            info!(
                authenticated = state.is_authenticated,
                user_id = ?state.user_id,
                whoami_ok = state.whoami_ok,
                error = ?state.error,
                "session state"
            );
        });
        let events = tokio::spawn(log_realtime(self.realtime.subscribe()));

        if !self.bootstrap.initialize().await {
            warn!(error = ?self.bootstrap.get_state().bootstrap_error, "bootstrap failed, continuing degraded");
        }
        self.bootstrap.start_health_polling();
        self.bootstrap.start_auth_bootstrap();

        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        events.abort();
        self.shutdown();
        for sample in self.telemetry.metrics().snapshot() {
            info!(name = %sample.name, labels = ?sample.labels, value = sample.value, "metric");
        }
        Ok(())
    }

    /// One forced identity check.
    pub async fn whoami(&self) -> SessionState {
        self.session
            .refresh_auth(RefreshOptions {
                force: true,
                no_cache: true,
                ..RefreshOptions::default()
            })
            .await
    }

    pub async fn logout(&self) -> anyhow::Result<SessionState> {
        Ok(self.cross_tab.logout().await?)
    }

    /// Effective configuration without touching the network.
    pub fn status(&self) -> Value {
        let transport = &self.settings.transport;
        json!({
            "origin": self.settings.api.origin,
            "credentials": self.settings.api.credentials_path.as_deref().unwrap_or("memory"),
            "breaker": {
                "threshold": transport.breaker_threshold,
                "cooldownMs": transport.breaker_cooldown_ms,
            },
            "topics": self.settings.realtime.topics,
            "session": self.session.get_state(),
            "warnings": self.telemetry.warnings().query(&LogQuery {
                limit: Some(20),
                ..LogQuery::default()
            }),
            "metrics": self.telemetry.metrics().snapshot(),
        })
    }

    pub fn shutdown(&self) {
        self.bootstrap.cleanup();
        self.realtime.stop();
        self.session.cleanup();
        self.cross_tab.close();
        vesper_realtime::hub::reset_global();
        vesper_session::bootstrap::reset_global();
        vesper_session::orchestrator::reset_global();
    }
}

fn open_credentials(path: Option<&str>) -> anyhow::Result<Arc<dyn CredentialStore>> {
    Ok(match path {
        Some(path) => {
            let db = Database::open(Path::new(path))?;
            Arc::new(SqliteCredentialStore::new(db))
        }
        None => Arc::new(MemoryCredentialStore::new()),
    })
}

async fn log_realtime(mut events: broadcast::Receiver<RealtimeEvent>) {
    loop {
        match events.recv().await {
            Ok(RealtimeEvent::Message { topic, kind, data }) => {
                info!(topic = %topic, kind = %kind, data = %data, "realtime message");
            }
            Ok(RealtimeEvent::ConnectionFailed { topic, reason }) => {
                warn!(topic = %topic, reason = %reason, "realtime topic failed");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "realtime log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

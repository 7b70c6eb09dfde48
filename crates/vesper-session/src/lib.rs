pub mod bootstrap;
pub mod cross_tab;
pub mod error;
pub mod guard;
pub mod identity;
pub mod oscillation;
pub mod orchestrator;

pub use bootstrap::{BootstrapConfig, BootstrapCoordinator, BootstrapHooks};
pub use cross_tab::{BroadcastBus, CrossTabChannel, Navigator, AUTH_CHANNEL};
pub use error::SessionError;
pub use guard::{PageLifecycle, PageLoadGuard};
pub use identity::IdentityClient;
pub use oscillation::{OscillationConfig, OscillationDetector, OscillationWarning};
pub use orchestrator::{RefreshOptions, SessionConfig, SessionOrchestrator};

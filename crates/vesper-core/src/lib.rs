pub mod backoff;
pub mod errors;
pub mod events;
pub mod ids;
pub mod observer;
pub mod session;
pub mod settings;
pub mod status;

pub use errors::TransportError;
pub use observer::{Observers, Subscription};
pub use session::{AuthSource, IdentityResponse, RateLimitInfo, SessionState};
pub use status::{BootstrapState, ConnectionStatus};

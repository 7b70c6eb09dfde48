pub mod auth;
pub mod backend;
pub mod breaker;
pub mod mock;
pub mod ratelimit;
pub mod reqwest_backend;
pub mod transport;

pub use backend::{HttpBackend, HttpRequest, HttpResponse, Method};
pub use breaker::{bucket_for, BreakerConfig, BreakerPhase, BreakerSnapshot, CircuitBreakers};
pub use reqwest_backend::ReqwestBackend;
pub use transport::{ResilientTransport, SendOptions, TransportConfig};

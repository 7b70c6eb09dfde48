pub mod connector;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod mock;
pub mod tungstenite_connector;
pub mod ws_url;

pub use connector::{ConnectRequest, SocketConnector, SocketEvent, SocketLink};
pub use error::RealtimeError;
pub use hub::{RealtimeConfig, RealtimeHub, ReconnectGate, SendOutcome, TopicConfig};
pub use mock::{MockConnector, MockSocket};
pub use tungstenite_connector::TungsteniteConnector;
pub use ws_url::websocket_url;

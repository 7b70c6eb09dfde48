use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RealtimeError;

/// What a connected socket reports back to the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// Terminal for this socket. `None` when the hub itself hung up.
    Closed { reason: Option<String> },
}

/// One open socket. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub topic: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Opens sockets for the hub. Reconnect policy lives in the hub, not here.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketLink, RealtimeError>;
}

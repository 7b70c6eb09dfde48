use vesper_core::TransportError;
use vesper_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("broadcast channel closed: {0}")]
    ChannelClosed(String),

    #[error("invalid broadcast payload: {0}")]
    Payload(#[from] serde_json::Error),
}

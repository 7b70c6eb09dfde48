#[derive(Clone, Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("invalid payload: {0}")]
    Payload(String),
}

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::connector::{ConnectRequest, SocketConnector, SocketEvent, SocketLink};
use crate::error::RealtimeError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Real sockets over tokio-tungstenite, with a client-side ping heartbeat.
#[derive(Clone, Debug)]
pub struct TungsteniteConnector {
    heartbeat: Duration,
    connect_timeout: Duration,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            heartbeat: HEARTBEAT_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketLink, RealtimeError> {
        let mut upgrade = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RealtimeError::Connect(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RealtimeError::Connect(format!("header value: {e}")))?;
            upgrade.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(upgrade))
            .await
            .map_err(|_| RealtimeError::ConnectTimeout(self.connect_timeout))?
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let topic = request.topic.clone();
        let heartbeat = self.heartbeat;

        tokio::spawn(async move {
            let mut ping = tokio::time::interval(heartbeat);
            ping.tick().await;

            let reason = loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                break Some(e.to_string());
                            }
                        }
                        None => {
                            let _ = write.close().await;
                            break None;
                        }
                    },
                    _ = ping.tick() => {
                        if let Err(e) = write.send(Message::Ping(Default::default())).await {
                            break Some(format!("ping failed: {e}"));
                        }
                        trace!(topic = %topic, "sent ping");
                    }
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(SocketEvent::Text(text.as_str().to_string())).is_err() {
                                let _ = write.close().await;
                                break None;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                            break Some(reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break Some("stream ended".to_string()),
                    },
                }
            };

            debug!(topic = %topic, reason = reason.as_deref().unwrap_or("local"), "socket closed");
            let _ = in_tx.send(SocketEvent::Closed { reason });
        });

        Ok(SocketLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

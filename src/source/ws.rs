//! WebSocket snapshot source for the proxy core's `/connections` endpoint.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{SnapshotSource, SnapshotStream, SourceMessage, ERROR_SIGNATURE};
use crate::config::SourceConfig;

/// Connects to the core's controller over WebSocket.
pub struct WsSource {
    url: String,
    connect_timeout: std::time::Duration,
}

impl WsSource {
    pub fn new(cfg: &SourceConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            connect_timeout: cfg.connect_timeout,
        }
    }
}

impl SnapshotSource for WsSource {
    type Stream = WsStream;

    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<WsStream> {
        debug!(url = %self.url, "opening websocket");

        let (inner, response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .with_context(|| format!("connecting to {} timed out", self.url))?
        .with_context(|| format!("connecting to {}", self.url))?;

        debug!(status = %response.status(), "websocket handshake complete");

        Ok(WsStream { inner })
    }
}

/// An open WebSocket connection.
pub struct WsStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SnapshotStream for WsStream {
    async fn next_message(&mut self) -> Option<SourceMessage> {
        loop {
            let frame = match self.inner.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(SourceMessage::Error(format!("{ERROR_SIGNATURE}: {e}"))),
            };

            match frame {
                Message::Text(text) => {
                    return Some(SourceMessage::from_text(text.as_str().to_owned()));
                }
                Message::Binary(bytes) => {
                    return Some(SourceMessage::from_text(
                        String::from_utf8_lossy(&bytes).into_owned(),
                    ));
                }
                Message::Close(frame) => {
                    debug!(?frame, "websocket closed by remote");
                    return None;
                }
                // Pings are answered by tungstenite on the next read.
                other => trace!(kind = ?other, "ignoring control frame"),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close(None)
            .await
            .context("closing websocket")
    }
}

//! Meeting WebSocket connection and frame handling.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::protocol::{ClientEvent, ServerEvent};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct MeetingSocket {
    stream: WsStream,
}

impl MeetingSocket {
    /// Connect to the coordinator.
    ///
    /// Auth is the connect token in the URL query; the server verifies it
    /// during the HTTP upgrade, so a bad credential fails here with a 401.
    pub async fn connect(
        server_url: &str,
        user_id: &str,
        display_name: &str,
        token: &str,
    ) -> Result<Self> {
        let e = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let ws_url = format!(
            "{}/?user={}&name={}&token={}",
            server_url.trim_end_matches('/'),
            e(user_id),
            e(display_name),
            e(token),
        );

        tracing::info!("Connecting WebSocket to {}", server_url);

        let (stream, response) = connect_async(&ws_url)
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Send one event as a JSON text frame.
    pub async fn send_event(&mut self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event).context("Failed to serialize event")?;
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Keepalive probe; the server answers with a pong.
    pub async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .context("Failed to send ping")
    }

    /// Receive the next event, skipping control frames.
    ///
    /// Returns `Ok(None)` when the server closes the connection. A frame that
    /// does not parse as a known event is logged and skipped, not fatal.
    pub async fn recv_event(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => return Ok(Some(event)),
                        Err(e) => {
                            tracing::warn!("Skipping unparseable event: {:#} ({})", e, text);
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}

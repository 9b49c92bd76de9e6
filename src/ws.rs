//! WebSocket transport for channel connections.
//!
//! [`connect`] performs the handshake (TLS via rustls for `wss://`) within
//! [`HANDSHAKE_TIMEOUT`] and splits the socket into a [`WsWriter`] and a
//! [`WsReader`], so a connection task can read and write from separate
//! `tokio::select!` branches. Tungstenite answers pings on its own; the
//! reader still surfaces them so callers can count them as traffic.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

/// Upper bound on TCP connect plus the upgrade handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code reported when the peer closed without a status.
const NO_STATUS_CODE: u16 = 1005;

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Inbound frame, independent of the tungstenite version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1005 when the peer sent none).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl WsMessage {
    /// Map a tungstenite message; raw frames yield `None`.
    fn from_tungstenite(message: Message) -> Option<Self> {
        Some(match message {
            Message::Text(text) => Self::Text(text),
            Message::Binary(data) => Self::Binary(data),
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            Message::Close(frame) => match frame {
                Some(frame) => Self::Close {
                    code: frame.code.into(),
                    reason: frame.reason.into_owned(),
                },
                None => Self::Close {
                    code: NO_STATUS_CODE,
                    reason: String::new(),
                },
            },
            Message::Frame(_) => return None,
        })
    }
}

/// Outbound half of a channel socket.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsWriter {
    async fn write(&mut self, message: Message, what: &str) -> Result<()> {
        self.sink
            .send(message)
            .await
            .with_context(|| format!("WebSocket {what} write failed"))
    }

    /// Send one serialized envelope.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.write(Message::Text(text.to_owned()), "text").await
    }

    /// Send a heartbeat ping.
    pub async fn send_ping(&mut self, payload: Vec<u8>) -> Result<()> {
        self.write(Message::Ping(payload), "ping").await
    }

    /// Start the closing handshake (status 1000) and flush.
    pub async fn send_close(&mut self) -> Result<()> {
        self.write(Message::Close(None), "close").await?;
        self.sink.flush().await.context("WebSocket flush failed")
    }
}

/// Inbound half of a channel socket.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<Socket>,
}

impl WsReader {
    /// Next frame, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("WebSocket read failed"))),
            };
            if let Some(frame) = WsMessage::from_tungstenite(message) {
                return Some(Ok(frame));
            }
        }
    }
}

/// Open a WebSocket to `url`, adding each `(name, value)` header to the
/// upgrade request.
///
/// # Errors
///
/// Invalid URL or header, refused connection, failed upgrade, or no
/// handshake within [`HANDSHAKE_TIMEOUT`].
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;
    use tungstenite::http::{HeaderName, HeaderValue};

    let mut request = url
        .into_client_request()
        .with_context(|| format!("not a WebSocket URL: {url}"))?;

    let request_headers = request.headers_mut();
    request_headers.insert(
        tungstenite::http::header::USER_AGENT,
        HeaderValue::from_static(concat!("channelmux/", env!("CARGO_PKG_VERSION"))),
    );
    for &(name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad header name: {name}"))?;
        let value =
            HeaderValue::from_str(value).with_context(|| format!("bad value for header {name}"))?;
        request_headers.insert(name, value);
    }

    let (socket, _response) =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .context("WebSocket handshake timed out")?
            .context("WebSocket handshake failed")?;

    let (sink, stream) = socket.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Rewrite an `http(s)://` URL to `ws(s)://`; other input is returned as is.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tungstenite::protocol::frame::coding::CloseCode;
    use tungstenite::protocol::CloseFrame;

    #[test]
    fn test_scheme_rewrite() {
        assert_eq!(http_to_ws_scheme("https://api.example.com"), "wss://api.example.com");
        assert_eq!(http_to_ws_scheme("http://localhost:8000"), "ws://localhost:8000");
        assert_eq!(http_to_ws_scheme("wss://rt.example.com/ws/"), "wss://rt.example.com/ws/");
    }

    #[test]
    fn test_scheme_rewrite_only_touches_prefix() {
        assert_eq!(
            http_to_ws_scheme("http://h/ws/chat/1/?next=http://x"),
            "ws://h/ws/chat/1/?next=http://x"
        );
    }

    #[test]
    fn test_close_frame_mapping() {
        let with_status = Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "restart".into(),
        }));
        assert_eq!(
            WsMessage::from_tungstenite(with_status),
            Some(WsMessage::Close {
                code: 1001,
                reason: "restart".to_string()
            })
        );
        assert_eq!(
            WsMessage::from_tungstenite(Message::Close(None)),
            Some(WsMessage::Close {
                code: NO_STATUS_CODE,
                reason: String::new()
            })
        );
    }

    #[test]
    fn test_text_mapping() {
        assert_eq!(
            WsMessage::from_tungstenite(Message::Text("{}".into())),
            Some(WsMessage::Text("{}".to_string()))
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_non_ws_url() {
        assert!(connect("not a url", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        assert!(connect("ws://127.0.0.1:1/ws/users/", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_header() {
        let result = connect("ws://127.0.0.1:1/", &[("bad header", "x")]).await;
        assert!(result.is_err());
    }
}

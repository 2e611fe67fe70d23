//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Connection setup is split the way the client's session expects it:
//! [`WebSocketConnector::connect`] opens the TCP connection, and
//! [`WebSocketTransport::handshake`](Transport::handshake) performs the
//! WebSocket upgrade on it. Only plain `ws://` URLs are supported.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), rank_matcher_client::RankMatcherError> {
//! use rank_matcher_client::{Connector, Transport, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:12310")?;
//! let mut transport = connector.connect().await?;
//! transport.handshake().await?;
//! transport.send("1,5,0".to_string()).await?;
//!
//! if let Some(Ok(frame)) = transport.recv().await {
//!     println!("received: {frame}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::error::RankMatcherError;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WebSocketTransport`] from an
/// existing stream via [`WebSocketTransport::from_stream`].
pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Default port for `ws://` URLs that do not name one.
const DEFAULT_WS_PORT: u16 = 80;

/// Opens TCP connections to a Rank Matcher WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    authority: String,
}

impl WebSocketConnector {
    /// Validate `url` and prepare a connector for it.
    ///
    /// # Errors
    ///
    /// Returns [`RankMatcherError::InvalidUrl`] if the URL does not parse, is
    /// not a `ws://` URL, or has no host.
    pub fn new(url: impl Into<String>) -> Result<Self, RankMatcherError> {
        let url = url.into();
        let invalid = |reason: String| RankMatcherError::InvalidUrl {
            url: url.clone(),
            reason,
        };

        let uri: Uri = url.parse().map_err(|e| invalid(format!("{e}")))?;
        match uri.scheme_str() {
            Some("ws") => {}
            Some(other) => return Err(invalid(format!("unsupported scheme {other:?}"))),
            None => return Err(invalid("missing scheme".to_string())),
        }
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let port = uri.port_u16().unwrap_or(DEFAULT_WS_PORT);
        let authority = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        Ok(Self { url, authority })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self) -> Result<WebSocketTransport, RankMatcherError> {
        tracing::debug!(url = %self.url, "opening TCP connection");
        let tcp = TcpStream::connect(self.authority.as_str()).await?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY: {e}");
        }
        Ok(WebSocketTransport {
            url: self.url.clone(),
            stage: Stage::Tcp(tcp),
        })
    }
}

#[derive(Debug)]
enum Stage {
    /// TCP is up, the WebSocket upgrade has not happened yet.
    Tcp(TcpStream),
    Open(WsStream),
    Closed,
}

/// A [`Transport`] implementation backed by a WebSocket connection.
///
/// Wraps a `tokio-tungstenite` [`WebSocketStream`](tokio_tungstenite::WebSocketStream)
/// and carries one protocol frame per WebSocket text message.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any messages,
/// making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: String,
    stage: Stage,
}

impl WebSocketTransport {
    /// Create a [`WebSocketTransport`] from an already-upgraded WebSocket stream.
    ///
    /// This is useful when you need custom headers or any other connection
    /// setup that [`WebSocketConnector`] does not expose. The handshake of a
    /// transport built this way is a no-op.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            url: String::new(),
            stage: Stage::Open(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut WsStream, RankMatcherError> {
        match &mut self.stage {
            Stage::Open(stream) => Ok(stream),
            Stage::Tcp(_) => Err(RankMatcherError::TransportSend(
                "WebSocket handshake has not completed".to_string(),
            )),
            Stage::Closed => Err(RankMatcherError::TransportClosed),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn handshake(&mut self) -> Result<(), RankMatcherError> {
        let tcp = match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Tcp(tcp) => tcp,
            Stage::Open(stream) => {
                self.stage = Stage::Open(stream);
                return Ok(());
            }
            Stage::Closed => return Err(RankMatcherError::TransportClosed),
        };

        let (stream, _response) = tokio_tungstenite::client_async(self.url.as_str(), tcp)
            .await
            .map_err(|e| {
                let kind = match &e {
                    tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                    _ => std::io::ErrorKind::Other,
                };
                RankMatcherError::Io(std::io::Error::new(kind, e))
            })?;

        tracing::info!(url = %self.url, "WebSocket connection established");
        self.stage = Stage::Open(stream);
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), RankMatcherError> {
        self.stream()?
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|e| RankMatcherError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, RankMatcherError>> {
        let stream = match &mut self.stage {
            Stage::Open(stream) => stream,
            Stage::Tcp(_) | Stage::Closed => return None,
        };
        loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(RankMatcherError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                WsMessage::Text(text) => return Some(Ok(text.to_string())),
                WsMessage::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {
                    // tungstenite answers pings itself.
                }
                WsMessage::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                WsMessage::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), RankMatcherError> {
        match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Open(mut stream) => stream
                .close(None)
                .await
                .map_err(|e| RankMatcherError::TransportSend(e.to_string())),
            Stage::Tcp(_) | Stage::Closed => Ok(()),
        }
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn websocket_transport_is_send_and_debug() {
        fn assert_bounds<T: Send + std::fmt::Debug>() {}
        assert_bounds::<WebSocketTransport>();
        assert_bounds::<WebSocketConnector>();
    }

    #[test]
    fn rejects_unusable_urls() {
        for url in ["not a url", "wss://example.com/", "http://example.com", "/path"] {
            let err = WebSocketConnector::new(url).unwrap_err();
            assert!(
                matches!(err, RankMatcherError::InvalidUrl { .. }),
                "{url}: {err:?}"
            );
        }
    }

    #[test]
    fn default_port_is_applied() {
        let connector = WebSocketConnector::new("ws://matcher.local/").unwrap();
        assert_eq!(connector.authority, "matcher.local:80");
        let connector = WebSocketConnector::new("ws://127.0.0.1:12310").unwrap();
        assert_eq!(connector.authority, "127.0.0.1:12310");
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1").unwrap();
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, RankMatcherError::Io(_)));
    }

    // ── Mock-server helpers ─────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the URL to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    async fn open(url: &str) -> WebSocketTransport {
        let mut transport = WebSocketConnector::new(url).unwrap().connect().await.unwrap();
        transport.handshake().await.unwrap();
        transport
    }

    // ── Mock-server tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn send_before_handshake_is_rejected() {
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketConnector::new(url.as_str())
            .unwrap()
            .connect()
            .await
            .unwrap();
        let err = transport.send("1,5,0".to_string()).await.unwrap_err();
        assert!(matches!(err, RankMatcherError::TransportSend(_)));
    }

    #[tokio::test]
    async fn recv_receives_text_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(WsMessage::Text("1,9,3,bad".into())).await.unwrap();
            ws.send(WsMessage::Text("1,6,0".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = open(&url).await;
        assert_eq!(transport.recv().await.unwrap().unwrap(), "1,9,3,bad");
        assert_eq!(transport.recv().await.unwrap().unwrap(), "1,6,0");
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = open(&url).await;
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(WsMessage::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(WsMessage::Text("1,6,0".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = open(&url).await;
        assert_eq!(transport.recv().await.unwrap().unwrap(), "1,6,0");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = open(&url).await;
        transport.close().await.unwrap();
        // Closing twice is fine.
        transport.close().await.unwrap();

        let err = transport.send("1,5,0".to_string()).await.unwrap_err();
        assert!(matches!(err, RankMatcherError::TransportClosed));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_round_trip() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                ws.send(WsMessage::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = open(&url).await;
        transport.send("1,2,6,lobby1".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "1,2,6,lobby1");
    }

    #[tokio::test]
    async fn from_stream_skips_handshake() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(WsMessage::Text("1,6,0".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let (ws_stream, _) = tokio_tungstenite::client_async(
            url.as_str(),
            TcpStream::connect(url.trim_start_matches("ws://")).await.unwrap(),
        )
        .await
        .unwrap();
        let mut transport = WebSocketTransport::from_stream(ws_stream);
        transport.handshake().await.unwrap();

        assert_eq!(transport.recv().await.unwrap().unwrap(), "1,6,0");
    }
}

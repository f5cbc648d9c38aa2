use crate::Result;
use crate::protocol::messages::safe_truncate;
use futures::{SinkExt, StreamExt};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

const TRACE_LOG_MAX_BYTES: usize = 1024;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A text-framed duplex socket.
pub trait FrameSocket: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>>;
    /// `Ok(None)` once the peer has closed the connection.
    fn next_text(&mut self) -> BoxFuture<'_, Result<Option<String>>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Opens a fresh [`FrameSocket`] for every (re)connection attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn FrameSocket>>>;
}

#[derive(Debug)]
pub struct WsStream<S>(WebSocketStream<S>);

impl<S> WsStream<S> {
    pub const fn new(stream: WebSocketStream<S>) -> Self {
        Self(stream)
    }
}

impl<S> FrameSocket for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::trace!("Sending frame: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
            self.0.send(WsMessage::Text(text.into())).await?;
            Ok(())
        })
    }

    fn next_text(&mut self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            while let Some(msg) = self.0.next().await {
                match msg? {
                    WsMessage::Text(text) => {
                        tracing::trace!("Received frame: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                        return Ok(Some(text.to_string()));
                    }
                    WsMessage::Close(_) => {
                        tracing::info!("WebSocket connection closed by peer");
                        return Ok(None);
                    }
                    WsMessage::Ping(payload) => {
                        tracing::debug!("Received Ping, sending Pong");
                        self.0.send(WsMessage::Pong(payload)).await?;
                    }
                    WsMessage::Binary(bytes) => {
                        tracing::debug!("Ignoring {} byte binary frame", bytes.len());
                    }
                    _ => (),
                }
            }
            Ok(None)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0.close(None).await?;
            Ok(())
        })
    }
}

/// Dials a fixed WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// # Errors
    /// Returns an error if the URL cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: Url::parse(url)?,
        })
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn FrameSocket>>> {
        Box::pin(async move {
            let stream = connect(&self.url, None).await?;
            Ok(Box::new(WsStream::new(stream)) as Box<dyn FrameSocket>)
        })
    }
}

/// Establish a client WebSocket connection, optionally sending an
/// `Authorization` header.
///
/// # Errors
/// Returns an error if the header is invalid or the handshake fails.
pub async fn connect(
    url: &Url,
    authorization: Option<&str>,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut req = url.as_str().into_client_request()?;
    if let Some(auth) = authorization {
        req.headers_mut().insert(AUTHORIZATION, HeaderValue::from_str(auth)?);
    }
    let (ws_stream, _) = connect_async(req).await?;

    tracing::info!(host = url.host_str().unwrap_or_default(), "WebSocket connected");

    Ok(ws_stream)
}

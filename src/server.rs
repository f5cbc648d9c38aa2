//! WebSocket endpoint: one [`Session`] and orchestrator per caller connection.

use crate::builder::Agent;
use crate::orchestrator::Session;
use crate::transport::{DuplexTransport, WsStream};
use crate::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;

pub const REALTIME_PATH: &str = "/ws/realtime";

/// Bind `addr` and serve callers until the listener fails.
///
/// # Errors
/// Returns an error if binding or accepting fails.
pub async fn serve(agent: Arc<Agent>, addr: impl ToSocketAddrs) -> Result<()> {
    serve_listener(agent, TcpListener::bind(addr).await?).await
}

/// Serve callers on an already bound listener.
///
/// # Errors
/// Returns an error if accepting a connection fails.
pub async fn serve_listener(agent: Arc<Agent>, listener: TcpListener) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, path = REALTIME_PATH, "Voice agent listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&agent, stream, peer).await {
                tracing::warn!(%peer, "Connection ended with error: {e}");
            }
        });
    }
}

async fn handle_connection(agent: &Agent, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut user_agent = None;
    let check_path = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if request.uri().path() != REALTIME_PATH {
            tracing::debug!(%peer, path = request.uri().path(), "Rejecting handshake on unknown path");
            let mut rejection = ErrorResponse::new(Some(format!("use {REALTIME_PATH}")));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;

    let mut session = Session::new().with_peer(peer);
    if let Some(user_agent) = user_agent {
        session = session.with_user_agent(user_agent);
    }
    let session_id = session.id.clone();
    tracing::info!(%session_id, %peer, user_agent = ?session.user_agent, "Caller connected");

    let mut config = agent.transport_config().clone();
    config.report_malformed = true;
    let transport = DuplexTransport::accepted(Box::new(WsStream::new(ws)), config);

    let (closed_tx, closed_rx) = oneshot::channel();
    let closed_tx = Mutex::new(Some(closed_tx));
    transport.on_close(move || {
        if let Some(tx) = closed_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    });
    transport.on_error(|e| tracing::warn!("Transport error: {e}"));
    transport.connect().await?;

    let handle = agent.attach(&transport, session).await;
    let _ = closed_rx.await;

    let metrics = handle.close().await;
    transport.disconnect();
    tracing::info!(
        %session_id,
        turns = metrics.conversation_turns,
        interruptions = metrics.interruptions,
        audio_ms = metrics.total_audio_duration,
        "Caller disconnected"
    );
    Ok(())
}

//! Reconnecting, heartbeating duplex connection carrying [`Message`] envelopes.
//!
//! One driver task per connection owns the socket. Every registered callback
//! is invoked from that task, one at a time, in registration order.

use super::ws::{BoxFuture, Connector, FrameSocket};
use super::Outbound;
use crate::protocol::Message;
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Answer unparseable inbound frames with an `error` envelope.
    pub report_malformed: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            report_malformed: false,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub const fn reconnecting(mut self, max_attempts: u32) -> Self {
        self.auto_reconnect = true;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    /// Reconnect budget exhausted; the transport must be rebuilt.
    Failed,
}

type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
type SignalHandler = Arc<dyn Fn() + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    message: Vec<MessageHandler>,
    open: Vec<SignalHandler>,
    close: Vec<SignalHandler>,
    error: Vec<ErrorHandler>,
}

struct Status {
    state: TransportState,
    epoch: u64,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

struct Shared {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    status: Mutex<Status>,
    handlers: Mutex<Handlers>,
}

enum Command {
    Send { text: String, respond: oneshot::Sender<bool> },
    Disconnect,
}

#[derive(Debug, PartialEq, Eq)]
enum Ended {
    Disconnected,
    Dropped,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct DuplexTransport {
    shared: Arc<Shared>,
}

impl DuplexTransport {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                status: Mutex::new(Status {
                    state: TransportState::Idle,
                    epoch: 0,
                    commands: None,
                }),
                handlers: Mutex::new(Handlers::default()),
            }),
        }
    }

    /// Wrap a socket accepted by a listener. It is never re-dialed.
    pub fn accepted(socket: Box<dyn FrameSocket>, mut config: TransportConfig) -> Self {
        config.auto_reconnect = false;
        Self::new(Arc::new(AcceptedSocket(Mutex::new(Some(socket)))), config)
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        lock(&self.shared.status).state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Open the connection. A no-op while already connecting or open.
    ///
    /// # Errors
    /// Returns the first open attempt's error, or
    /// [`Error::ReconnectExhausted`] once the reconnect budget has been spent.
    pub async fn connect(&self) -> Result<()> {
        let ready = {
            let mut status = lock(&self.shared.status);
            match status.state {
                TransportState::Connecting | TransportState::Open | TransportState::Reconnecting => {
                    return Ok(());
                }
                TransportState::Failed => {
                    return Err(Error::ReconnectExhausted {
                        attempts: self.shared.config.max_reconnect_attempts,
                    });
                }
                TransportState::Idle | TransportState::Closed => {}
            }
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            status.state = TransportState::Connecting;
            status.epoch += 1;
            status.commands = Some(cmd_tx);
            tokio::spawn(run(Arc::clone(&self.shared), status.epoch, cmd_rx, ready_tx));
            ready_rx
        };
        ready.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Close the connection, stop the heartbeat and cancel any pending
    /// reconnect. No reconnect follows.
    pub fn disconnect(&self) {
        let mut status = lock(&self.shared.status);
        if let Some(commands) = status.commands.take() {
            let _ = commands.send(Command::Disconnect);
        }
        if status.state != TransportState::Failed && status.state != TransportState::Idle {
            status.state = TransportState::Closed;
        }
        status.epoch += 1;
    }

    /// Returns whether the message was written to an open socket.
    pub async fn send(&self, message: &Message) -> bool {
        let commands = {
            let status = lock(&self.shared.status);
            if status.state != TransportState::Open {
                tracing::warn!("Transport not connected, cannot send {}", message.tag());
                return false;
            }
            status.commands.clone()
        };
        let Some(commands) = commands else {
            return false;
        };

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize {}", message.tag());
                emit_error(&self.shared, &e);
                return false;
            }
        };

        let (respond, written) = oneshot::channel();
        if commands.send(Command::Send { text, respond }).is_err() {
            return false;
        }
        written.await.unwrap_or(false)
    }

    /// Handlers must not register further handlers.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        lock(&self.shared.handlers).message.push(Arc::new(handler));
    }

    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.shared.handlers).open.push(Arc::new(handler));
    }

    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.shared.handlers).close.push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        lock(&self.shared.handlers).error.push(Arc::new(handler));
    }
}

impl Outbound for DuplexTransport {
    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, bool> {
        Box::pin(DuplexTransport::send(self, message))
    }
}

struct AcceptedSocket(Mutex<Option<Box<dyn FrameSocket>>>);

impl Connector for AcceptedSocket {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn FrameSocket>>> {
        let socket = lock(&self.0).take();
        Box::pin(async move { socket.ok_or(Error::ConnectionClosed) })
    }
}

/// Returns false when a newer `connect`/`disconnect` superseded this driver.
fn set_state(shared: &Shared, epoch: u64, state: TransportState) -> bool {
    let mut status = lock(&shared.status);
    if status.epoch != epoch {
        return false;
    }
    status.state = state;
    if matches!(state, TransportState::Closed | TransportState::Failed) {
        status.commands = None;
    }
    true
}

async fn run(
    shared: Arc<Shared>,
    epoch: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    let max_attempts = shared.config.max_reconnect_attempts;
    let mut attempts: u32 = 0;

    loop {
        match shared.connector.connect().await {
            Ok(socket) => {
                attempts = 0;
                if !set_state(&shared, epoch, TransportState::Open) {
                    return;
                }
                tracing::info!("Duplex transport open");
                emit_open(&shared);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }

                let ended = drive(&shared, socket, &mut commands).await;
                tracing::info!(?ended, "Duplex transport closed");
                if ended == Ended::Disconnected {
                    set_state(&shared, epoch, TransportState::Closed);
                    emit_close(&shared);
                    return;
                }
                let next = if shared.config.auto_reconnect && attempts < max_attempts {
                    TransportState::Reconnecting
                } else {
                    TransportState::Closed
                };
                set_state(&shared, epoch, next);
                emit_close(&shared);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Duplex transport failed to open");
                emit_error(&shared, &e);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e));
                }
            }
        }

        if !shared.config.auto_reconnect {
            set_state(&shared, epoch, TransportState::Closed);
            return;
        }
        if attempts >= max_attempts {
            tracing::warn!("Max reconnection attempts reached ({max_attempts})");
            set_state(&shared, epoch, TransportState::Failed);
            return;
        }
        attempts += 1;
        if !set_state(&shared, epoch, TransportState::Reconnecting) {
            return;
        }
        tracing::info!("Attempting to reconnect ({attempts}/{max_attempts})...");

        let backoff = tokio::time::sleep(shared.config.reconnect_interval);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                () = &mut backoff => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Send { respond, .. }) => {
                        let _ = respond.send(false);
                    }
                    Some(Command::Disconnect) | None => {
                        set_state(&shared, epoch, TransportState::Closed);
                        return;
                    }
                },
            }
        }
    }
}

async fn drive(
    shared: &Shared,
    mut socket: Box<dyn FrameSocket>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Ended {
    let period = shared.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = write(&mut socket, &Message::ping()).await {
                    tracing::error!(error = %e, "Failed to send heartbeat");
                    emit_error(shared, &e);
                    return Ended::Dropped;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(Command::Send { text, respond }) => {
                    if let Err(e) = socket.send_text(text).await {
                        tracing::error!(error = %e, "Failed to send message");
                        let _ = respond.send(false);
                        emit_error(shared, &e);
                        return Ended::Dropped;
                    }
                    let _ = respond.send(true);
                }
                Some(Command::Disconnect) | None => {
                    if let Err(e) = socket.close().await {
                        tracing::debug!(error = %e, "Error while closing socket");
                    }
                    return Ended::Disconnected;
                }
            },
            frame = socket.next_text() => match frame {
                Ok(Some(text)) => {
                    if let Err(e) = dispatch(shared, &mut socket, &text).await {
                        emit_error(shared, &e);
                        return Ended::Dropped;
                    }
                }
                Ok(None) => return Ended::Dropped,
                Err(e) => {
                    tracing::error!(error = %e, "Socket error");
                    emit_error(shared, &e);
                    return Ended::Dropped;
                }
            },
        }
    }
}

async fn write(socket: &mut Box<dyn FrameSocket>, message: &Message) -> Result<()> {
    socket.send_text(message.to_json()?).await
}

/// Only socket write failures are returned.
async fn dispatch(shared: &Shared, socket: &mut Box<dyn FrameSocket>, text: &str) -> Result<()> {
    let message = match Message::parse(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed message");
            if shared.config.report_malformed {
                let summary = match e {
                    Error::Base64(_) => "Failed to process audio chunk",
                    _ => "Failed to process message",
                };
                let reply = Message::error(summary, Some(e.code()));
                write(socket, &reply).await?;
            }
            return Ok(());
        }
    };

    match message {
        Message::Pong { .. } => {
            tracing::debug!("Received pong");
        }
        Message::Ping { .. } => {
            tracing::debug!("Received ping, sending pong");
            write(socket, &Message::pong()).await?;
        }
        message => {
            let handlers = lock(&shared.handlers).message.clone();
            for handler in &handlers {
                handler(&message);
            }
        }
    }
    Ok(())
}

fn emit_open(shared: &Shared) {
    let handlers = lock(&shared.handlers).open.clone();
    for handler in &handlers {
        handler();
    }
}

fn emit_close(shared: &Shared) {
    let handlers = lock(&shared.handlers).close.clone();
    for handler in &handlers {
        handler();
    }
}

fn emit_error(shared: &Shared, error: &Error) {
    let handlers = lock(&shared.handlers).error.clone();
    for handler in &handlers {
        handler(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockSocket {
        incoming: mpsc::UnboundedReceiver<String>,
        outgoing: mpsc::UnboundedSender<String>,
    }

    impl FrameSocket for MockSocket {
        fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
            let outgoing = self.outgoing.clone();
            Box::pin(async move { outgoing.send(text).map_err(|_| Error::ConnectionClosed) })
        }

        fn next_text(&mut self) -> BoxFuture<'_, Result<Option<String>>> {
            Box::pin(async move { Ok(self.incoming.recv().await) })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Hands out the queued sockets, then fails every further attempt.
    struct MockConnector {
        sockets: Mutex<VecDeque<MockSocket>>,
        attempts: AtomicU32,
    }

    impl Connector for MockConnector {
        fn connect(&self) -> BoxFuture<'_, Result<Box<dyn FrameSocket>>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = lock(&self.sockets).pop_front();
            Box::pin(async move {
                next.map(|s| Box::new(s) as Box<dyn FrameSocket>)
                    .ok_or(Error::ConnectionClosed)
            })
        }
    }

    struct Peer {
        to_transport: mpsc::UnboundedSender<String>,
        from_transport: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(text) = self.from_transport.try_recv() {
                out.push(Message::parse(&text).unwrap());
            }
            out
        }
    }

    fn mock(sockets: usize) -> (Arc<MockConnector>, Vec<Peer>) {
        let mut queue = VecDeque::new();
        let mut peers = Vec::new();
        for _ in 0..sockets {
            let (to_transport, incoming) = mpsc::unbounded_channel();
            let (outgoing, from_transport) = mpsc::unbounded_channel();
            queue.push_back(MockSocket { incoming, outgoing });
            peers.push(Peer { to_transport, from_transport });
        }
        let connector = Arc::new(MockConnector {
            sockets: Mutex::new(queue),
            attempts: AtomicU32::new(0),
        });
        (connector, peers)
    }

    fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sends_three_pings_per_minute_and_hides_pongs() {
        let (connector, mut peers) = mock(1);
        let transport = DuplexTransport::new(connector, TransportConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.on_message(move |m| lock(&sink).push(m.clone()));

        transport.connect().await.unwrap();
        let peer = &mut peers[0];
        peer.to_transport.send(Message::pong().to_json().unwrap()).unwrap();
        let partial = Message::SttPartial { text: "hi".into(), timestamp: 1 };
        peer.to_transport.send(partial.to_json().unwrap()).unwrap();

        tokio::time::sleep(Duration::from_millis(60_500)).await;

        let pings = peer
            .drain()
            .into_iter()
            .filter(|m| matches!(m, Message::Ping { .. }))
            .count();
        assert_eq!(pings, 3);
        assert_eq!(*lock(&seen), vec![partial]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (connector, mut peers) = mock(2);
        let transport = DuplexTransport::new(connector.clone(), TransportConfig::default());
        let (opens, on_open) = counter();
        transport.on_open(on_open);

        transport.connect().await.unwrap();
        transport.connect().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(20_500)).await;
        assert_eq!(peers[0].drain().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_after_budget() {
        let (connector, mut peers) = mock(1);
        let transport = DuplexTransport::new(connector.clone(), TransportConfig::default().reconnecting(3));
        let (closes, on_close) = counter();
        transport.on_close(on_close);
        let errors = Arc::new(AtomicU32::new(0));
        let e = Arc::clone(&errors);
        transport.on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        transport.connect().await.unwrap();
        let peer = peers.remove(0);
        drop(peer);

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert_eq!(transport.state(), TransportState::Failed);
        assert!(matches!(
            transport.connect().await,
            Err(Error::ReconnectExhausted { attempts: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn never_opening_socket_gets_bounded_attempts() {
        let (connector, _) = mock(0);
        let transport = DuplexTransport::new(connector.clone(), TransportConfig::default().reconnecting(3));
        let (closes, on_close) = counter();
        transport.on_close(on_close);

        assert!(transport.connect().await.is_err());
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1 + 3);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_prevents_reconnect() {
        let (connector, _peers) = mock(2);
        let transport = DuplexTransport::new(connector.clone(), TransportConfig::default().reconnecting(5));
        let (closes, on_close) = counter();
        transport.on_close(on_close);

        transport.connect().await.unwrap();
        transport.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!transport.send(&Message::ping()).await);
    }

    #[tokio::test]
    async fn send_reports_whether_written() {
        let (connector, mut peers) = mock(1);
        let transport = DuplexTransport::new(connector, TransportConfig::default());
        let stop = Message::tts_stop(crate::protocol::StopReason::Completed);

        assert!(!transport.send(&stop).await);
        transport.connect().await.unwrap();
        assert!(transport.send(&stop).await);
        assert_eq!(peers[0].drain(), vec![stop]);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_reported() {
        let (connector, mut peers) = mock(1);
        let config = TransportConfig {
            report_malformed: true,
            ..TransportConfig::default()
        };
        let transport = DuplexTransport::new(connector, config);
        let (delivered, _) = counter();
        let d = Arc::clone(&delivered);
        transport.on_message(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        transport.connect().await.unwrap();

        let peer = &mut peers[0];
        peer.to_transport.send(r#"{"type":"bogus","data":{}}"#.to_string()).unwrap();
        let reply = peer.from_transport.recv().await.unwrap();

        match Message::parse(&reply).unwrap() {
            Message::Error { code, .. } => assert_eq!(code.as_deref(), Some("MESSAGE_PROCESSING_ERROR")),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn inbound_ping_is_answered() {
        let (connector, mut peers) = mock(1);
        let transport = DuplexTransport::accepted(
            Box::new(lock(&connector.sockets).pop_front().unwrap()),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();

        let peer = &mut peers[0];
        peer.to_transport.send(Message::ping().to_json().unwrap()).unwrap();
        let reply = peer.from_transport.recv().await.unwrap();
        assert!(matches!(Message::parse(&reply).unwrap(), Message::Pong { .. }));
    }
}

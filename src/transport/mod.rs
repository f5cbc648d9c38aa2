pub mod duplex;
pub mod ws;

pub use duplex::{DuplexTransport, TransportConfig, TransportState};
pub use ws::{BoxFuture, Connector, FrameSocket, WsConnector, WsStream};

use crate::protocol::Message;

/// Where the orchestrator writes outbound envelopes.
pub trait Outbound: Send + Sync {
    /// Resolves to whether the message was actually written.
    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, bool>;
}

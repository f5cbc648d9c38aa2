#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Real-time voice conversation pipeline for AI phone agents.
//!
//! Caller audio arrives over a duplex WebSocket, is transcribed by a streaming
//! recognizer, answered by a streaming language model and spoken back through
//! a streaming synthesizer. The [`orchestrator`] keeps the three in step per
//! turn and cancels stale work when the caller barges in.

pub mod builder;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod protocol;
pub mod recognition;
pub mod server;
pub mod synthesis;
pub mod transport;

pub use builder::{Agent, AgentBuilder};
pub use error::{Error, Result, Stage};
pub use generation::{ConversationContext, Generator, LanguageModel, OpenAiChat};
pub use orchestrator::{Inbox, Orchestrator, Phase, Pipeline, Session, SessionHandle, SessionMetrics};
pub use protocol::{AudioConfig, AudioEncoding, Message, StopReason};
pub use recognition::{DeepgramStt, RecognitionConfig, RecognitionStream, SpeechToText};
pub use synthesis::{ElevenLabsTts, Synthesizer, TextToSpeech};
pub use transport::{DuplexTransport, TransportConfig, TransportState, WsConnector};

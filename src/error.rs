use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which provider-backed phase of a turn failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recognition,
    Generation,
    Synthesis,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recognition => write!(f, "recognition"),
            Self::Generation => write!(f, "generation"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage} provider error: {message}")]
    Provider { stage: Stage, message: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("The transport is not connected")]
    NotConnected,

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl Error {
    pub(crate) fn provider(stage: Stage, message: impl Into<String>) -> Self {
        Self::Provider {
            stage,
            message: message.into(),
        }
    }

    /// Attribute a lower-level failure to a provider stage.
    #[must_use]
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Self::Provider { .. } => self,
            other => Self::provider(stage, other.to_string()),
        }
    }

    /// Wire code carried in the `code` field of an outbound `error` envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Provider { stage: Stage::Recognition, .. } => "RECOGNITION_ERROR",
            Self::Provider { stage: Stage::Generation, .. } => "LLM_ERROR",
            Self::Provider { stage: Stage::Synthesis, .. } => "TTS_ERROR",
            Self::Base64(_) => "AUDIO_CHUNK_ERROR",
            Self::Serialization(_) | Self::InvalidMessage(_) => "MESSAGE_PROCESSING_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            _ => "TRANSPORT_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

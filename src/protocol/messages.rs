use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Why synthesized speech stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Interrupted,
}

/// A single envelope on the duplex connection.
///
/// Audio payloads are raw bytes in memory and base64 strings on the wire.
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    #[serde(rename = "audio:chunk")]
    AudioChunk {
        #[serde(with = "base64_audio")]
        audio: Vec<u8>,
        timestamp: u64,
    },
    #[serde(rename = "stt:partial")]
    SttPartial { text: String, timestamp: u64 },
    #[serde(rename = "stt:final")]
    SttFinal { text: String, timestamp: u64 },
    #[serde(rename = "tts:chunk")]
    TtsChunk {
        #[serde(with = "base64_audio")]
        audio: Vec<u8>,
        /// 1-based, contiguous within a turn.
        #[serde(default)]
        seq: u64,
        timestamp: u64,
    },
    #[serde(rename = "tts:stop")]
    TtsStop { reason: StopReason, timestamp: u64 },
    #[serde(rename = "audio:bargein")]
    BargeIn { timestamp: u64 },
    #[serde(rename = "event")]
    Event {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        timestamp: u64,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        timestamp: u64,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

impl Message {
    /// Parse one text frame.
    ///
    /// # Errors
    /// Returns an error for malformed JSON, an unknown `type`, or a `data`
    /// payload that does not match the tag's shape. An `audio:chunk` whose
    /// audio is not valid base64 fails with [`Error::Base64`].
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| audio_payload_error(text).unwrap_or_else(|| Error::Serialization(e)))
    }

    /// Serialize into a text frame.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::AudioChunk { .. } => "audio:chunk",
            Self::SttPartial { .. } => "stt:partial",
            Self::SttFinal { .. } => "stt:final",
            Self::TtsChunk { .. } => "tts:chunk",
            Self::TtsStop { .. } => "tts:stop",
            Self::BargeIn { .. } => "audio:bargein",
            Self::Event { .. } => "event",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Whether the tag travels from the caller towards the agent.
    #[must_use]
    pub const fn is_inbound(&self) -> bool {
        matches!(
            self,
            Self::AudioChunk { .. } | Self::BargeIn { .. } | Self::Pong { .. }
        )
    }

    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        match self {
            Self::AudioChunk { timestamp, .. }
            | Self::SttPartial { timestamp, .. }
            | Self::SttFinal { timestamp, .. }
            | Self::TtsChunk { timestamp, .. }
            | Self::TtsStop { timestamp, .. }
            | Self::BargeIn { timestamp }
            | Self::Event { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Ping { timestamp }
            | Self::Pong { timestamp } => *timestamp,
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::Ping { timestamp: now_ms() }
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::Pong { timestamp: now_ms() }
    }

    #[must_use]
    pub fn event(name: impl Into<String>, details: Option<Value>) -> Self {
        Self::Event {
            name: name.into(),
            details,
            timestamp: now_ms(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.map(str::to_string),
            timestamp: now_ms(),
        }
    }

    #[must_use]
    pub fn tts_stop(reason: StopReason) -> Self {
        Self::TtsStop {
            reason,
            timestamp: now_ms(),
        }
    }
}

/// The decode error behind a rejected `audio:chunk`, if that is what failed.
fn audio_payload_error(text: &str) -> Option<Error> {
    use base64::Engine as _;

    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "audio:chunk" {
        return None;
    }
    let audio = value.pointer("/data/audio")?.as_str()?;
    base64::engine::general_purpose::STANDARD
        .decode(audio)
        .err()
        .map(Error::from)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> Cow<'_, str> {
    if s.len() <= max_bytes {
        return Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

mod base64_audio {
    use base64::Engine as _;
    use base64::engine::general_purpose;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundary() {
        let s = "héllo wörld";
        let out = safe_truncate(s, 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("truncated"));
    }

    #[test]
    fn short_strings_are_borrowed() {
        assert!(matches!(safe_truncate("ok", 16), Cow::Borrowed("ok")));
    }

    #[test]
    fn undecodable_audio_is_an_audio_chunk_error() {
        let err = Message::parse(r#"{"type":"audio:chunk","data":{"audio":"not base64!","timestamp":1}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Base64(_)));

        let err = Message::parse(r#"{"type":"audio:chunk","data":{"timestamp":1}}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn inbound_tags() {
        assert!(Message::BargeIn { timestamp: 1 }.is_inbound());
        assert!(Message::pong().is_inbound());
        assert!(!Message::ping().is_inbound());
        assert!(!Message::tts_stop(StopReason::Completed).is_inbound());
    }
}

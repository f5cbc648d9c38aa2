use serde::{Deserialize, Serialize};

/// Latency and volume counters for one session.
///
/// The three latency fields are stamped once, at the first observable event
/// of their phase, and never overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub session_id: String,
    /// First partial transcript, relative to session start.
    #[serde(rename = "tFirstPartial", skip_serializing_if = "Option::is_none")]
    pub t_first_partial: Option<u64>,
    /// First generated token, relative to the final transcript that started
    /// the reply.
    #[serde(rename = "tLLMFirstToken", skip_serializing_if = "Option::is_none")]
    pub t_llm_first_token: Option<u64>,
    /// First synthesized audio chunk, relative to session start.
    #[serde(rename = "tTTSFirstAudio", skip_serializing_if = "Option::is_none")]
    pub t_tts_first_audio: Option<u64>,
    pub interruptions: u32,
    /// Milliseconds of caller audio received.
    pub total_audio_duration: u64,
    pub conversation_turns: u32,
}

impl SessionMetrics {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

/// Set `slot` if it is still empty. Returns whether it was set.
pub(crate) fn stamp_once(slot: &mut Option<u64>, value: u64) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

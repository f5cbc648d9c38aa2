use serde::Serialize;

/// Where the conversation is within one listen, think, speak cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No turn is active; caller audio goes to recognition.
    Listening,
    Recognizing,
    Generating,
    Synthesizing,
    Speaking,
    Idle,
    /// Reply work was abandoned by a barge-in.
    Cancelled,
}

impl Phase {
    /// Whether generation or synthesis work may be in flight.
    ///
    /// `Recognizing` is excluded: nothing can be playing before a final
    /// transcript starts generation, so barge-in there has nothing to cancel.
    #[must_use]
    pub const fn is_replying(self) -> bool {
        matches!(self, Self::Generating | Self::Synthesizing | Self::Speaking)
    }
}

/// When the turn entered each phase, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStarts {
    pub recognizing: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generating: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesizing: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaking: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle: Option<u64>,
}

/// One caller-utterance-to-agent-reply cycle.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    phase: Phase,
    /// Latest transcript hypothesis, final once generation has started.
    pub transcript: String,
    /// Reply text generated so far.
    pub generated: String,
    /// Timestamp of the final transcript that started generation.
    pub final_at: Option<u64>,
    pub started: PhaseStarts,
    chunks_sent: u64,
}

impl Turn {
    /// A turn begins when recognition of new caller speech begins.
    #[must_use]
    pub fn new(id: u64, now: u64) -> Self {
        Self {
            id,
            phase: Phase::Recognizing,
            transcript: String::new(),
            generated: String::new(),
            final_at: None,
            started: PhaseStarts {
                recognizing: now,
                ..PhaseStarts::default()
            },
            chunks_sent: 0,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Move forward to `next`. Backward or repeated transitions are ignored.
    /// Returns whether the phase changed.
    pub fn advance(&mut self, next: Phase, now: u64) -> bool {
        if next <= self.phase || self.phase == Phase::Cancelled {
            return false;
        }
        let slot = match next {
            Phase::Generating => &mut self.started.generating,
            Phase::Synthesizing => &mut self.started.synthesizing,
            Phase::Speaking => &mut self.started.speaking,
            Phase::Idle => &mut self.started.idle,
            Phase::Listening | Phase::Recognizing | Phase::Cancelled => {
                self.phase = next;
                return true;
            }
        };
        slot.get_or_insert(now);
        self.phase = next;
        true
    }

    /// Abandon reply work. The generated buffer is discarded.
    pub fn cancel(&mut self) {
        self.phase = Phase::Cancelled;
        self.generated.clear();
    }

    /// Sequence number for the next outbound audio chunk, starting at 1.
    pub fn next_seq(&mut self) -> u64 {
        self.chunks_sent += 1;
        self.chunks_sent
    }

    #[must_use]
    pub const fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }
}

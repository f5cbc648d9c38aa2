use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    #[default]
    Pcm16,
    Opus,
}

impl AudioEncoding {
    /// Encoding name understood by streaming recognition providers.
    #[must_use]
    pub const fn provider_name(self) -> &'static str {
        match self {
            Self::Pcm16 => "linear16",
            Self::Opus => "opus",
        }
    }
}

impl std::fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pcm16 => write!(f, "pcm16"),
            Self::Opus => write!(f, "opus"),
        }
    }
}

const DEFAULT_SAMPLE_RATE: u32 = 16_000;
const DEFAULT_CHUNK_MS: u32 = 20;

/// Caller audio format negotiated at session setup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub encoding: AudioEncoding,
    /// Nominal frame size.
    pub chunk_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            bit_depth: 16,
            encoding: AudioEncoding::Pcm16,
            chunk_size_ms: DEFAULT_CHUNK_MS,
        }
    }
}

impl AudioConfig {
    #[must_use]
    pub const fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    #[must_use]
    pub const fn with_encoding(mut self, encoding: AudioEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// # Errors
    /// Returns an error if any field is zero or PCM is configured with a
    /// bit depth other than 16.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.chunk_size_ms == 0 {
            return Err(Error::Config(format!(
                "audio config fields must be non-zero: {self:?}"
            )));
        }
        if self.encoding == AudioEncoding::Pcm16 && self.bit_depth != 16 {
            return Err(Error::Config(format!(
                "pcm16 requires a bit depth of 16, got {}",
                self.bit_depth
            )));
        }
        Ok(())
    }

    /// Playback duration of one inbound frame.
    ///
    /// PCM length is exact; compressed encodings count the nominal frame size.
    #[must_use]
    pub fn frame_duration_ms(&self, frame_len: usize) -> u64 {
        match self.encoding {
            AudioEncoding::Pcm16 => {
                let bytes_per_second = u64::from(self.sample_rate)
                    * u64::from(self.channels)
                    * u64::from(self.bit_depth / 8);
                if bytes_per_second == 0 {
                    return 0;
                }
                (frame_len as u64) * 1000 / bytes_per_second
            }
            AudioEncoding::Opus => u64::from(self.chunk_size_ms),
        }
    }
}

use super::TextToSpeech;
use crate::error::Stage;
use crate::transport::BoxFuture;
use crate::{Error, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderValue};
use serde::Serialize;
use std::time::Duration;
use url::Url;

const TTS_BASE_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech/";
pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
pub const DEFAULT_MODEL_ID: &str = "eleven_turbo_v2_5";
const DEFAULT_OUTPUT_FORMAT: &str = "mp3_22050_32";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.8,
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

/// Streaming ElevenLabs synthesis. Clones share one connection pool.
#[derive(Clone, Debug)]
pub struct ElevenLabsTts {
    client: Client,
    api_key: HeaderValue,
    voice_id: String,
    model_id: String,
    output_format: String,
    settings: VoiceSettings,
}

impl ElevenLabsTts {
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(api_key: &str) -> Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        let mut api_key = HeaderValue::from_str(api_key)?;
        api_key.set_sensitive(true);

        Ok(Self {
            client,
            api_key,
            voice_id: DEFAULT_VOICE_ID.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            settings: VoiceSettings::default(),
        })
    }

    #[must_use]
    pub fn voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    #[must_use]
    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    #[must_use]
    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    #[must_use]
    pub const fn settings(mut self, settings: VoiceSettings) -> Self {
        self.settings = settings;
        self
    }

    fn stream_url(&self) -> Result<Url> {
        let mut url = Url::parse(TTS_BASE_URL)?.join(&format!("{}/stream", self.voice_id))?;
        url.query_pairs_mut()
            .append_pair("output_format", &self.output_format);
        Ok(url)
    }
}

impl TextToSpeech for ElevenLabsTts {
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<BoxStream<'static, Result<Vec<u8>>>>> {
        Box::pin(async move {
            let body = SpeechRequest {
                text,
                model_id: &self.model_id,
                voice_settings: self.settings,
            };

            let response = self
                .client
                .post(self.stream_url()?)
                .header("xi-api-key", &self.api_key)
                .header(ACCEPT, "audio/mpeg")
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                tracing::error!(%status, "Speech synthesis rejected: {detail}");
                return Err(Error::provider(
                    Stage::Synthesis,
                    format!("HTTP {status}: {detail}"),
                ));
            }

            tracing::debug!(voice = %self.voice_id, chars = text.len(), "Synthesis stream established");
            Ok(response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from))
                .boxed())
        })
    }
}

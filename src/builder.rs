use crate::generation::{ConversationContext, Generator, LanguageModel, OpenAiChat};
use crate::orchestrator::{Orchestrator, Pipeline, Session, SessionHandle};
use crate::protocol::{AudioConfig, Message};
use crate::recognition::{DeepgramStt, RecognitionConfig, SpeechToText};
use crate::synthesis::{ElevenLabsTts, Synthesizer, TextToSpeech};
use crate::transport::{DuplexTransport, Outbound, TransportConfig};
use crate::{Error, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const DEEPGRAM_API_KEY: &str = "DEEPGRAM_API_KEY";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ELEVENLABS_API_KEY: &str = "ELEVENLABS_API_KEY";
pub const LLM_MODEL_VAR: &str = "VOXLINE_LLM_MODEL";
pub const VOICE_ID_VAR: &str = "VOXLINE_VOICE_ID";

/// A configured voice agent. Provider clients are built once and shared by
/// every session it starts.
#[derive(Clone)]
pub struct Agent {
    pipeline: Pipeline,
    transport: TransportConfig,
}

impl Agent {
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[must_use]
    pub const fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    /// Start an orchestrator for `session` that writes to `outbound`.
    pub async fn start_session(&self, session: Session, outbound: Arc<dyn Outbound>) -> SessionHandle {
        Orchestrator::spawn(&self.pipeline, session, outbound).await
    }

    /// Bind a session to an open transport: greet the caller, start the
    /// orchestrator and route inbound envelopes to it. A later re-open of a
    /// reconnecting transport discards whatever turn was in flight.
    ///
    /// Frames that arrive before this returns are dropped, like audio sent
    /// before recognition is ready.
    pub async fn attach(&self, transport: &DuplexTransport, session: Session) -> SessionHandle {
        transport
            .send(&Message::event(
                "session_started",
                Some(json!({ "sessionId": session.id })),
            ))
            .await;

        let handle = self.start_session(session, Arc::new(transport.clone())).await;
        let inbox = handle.inbox();
        transport.on_message(move |message| {
            inbox.deliver(message.clone());
        });
        let inbox = handle.inbox();
        transport.on_open(move || inbox.transport_reopened());
        handle
    }
}

pub struct AgentBuilder {
    deepgram_api_key: Option<String>,
    openai_api_key: Option<String>,
    elevenlabs_api_key: Option<String>,
    llm_model: Option<String>,
    voice_id: Option<String>,
    tts_model: Option<String>,
    recognition: RecognitionConfig,
    system_prompt: Option<String>,
    max_history: Option<usize>,
    transport: TransportConfig,
    recognizer: Option<Arc<dyn SpeechToText>>,
    language_model: Option<Arc<dyn LanguageModel>>,
    voice: Option<Arc<dyn TextToSpeech>>,
}

impl AgentBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            deepgram_api_key: None,
            openai_api_key: None,
            elevenlabs_api_key: None,
            llm_model: None,
            voice_id: None,
            tts_model: None,
            recognition: RecognitionConfig::default(),
            system_prompt: None,
            max_history: None,
            transport: TransportConfig::default(),
            recognizer: None,
            language_model: None,
            voice: None,
        }
    }

    /// Read provider keys and optional overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut builder = Self::new();
        builder.deepgram_api_key = var(DEEPGRAM_API_KEY);
        builder.openai_api_key = var(OPENAI_API_KEY);
        builder.elevenlabs_api_key = var(ELEVENLABS_API_KEY);
        builder.llm_model = var(LLM_MODEL_VAR);
        builder.voice_id = var(VOICE_ID_VAR);
        builder
    }

    #[must_use]
    pub fn deepgram_api_key(mut self, key: impl Into<String>) -> Self {
        self.deepgram_api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn elevenlabs_api_key(mut self, key: impl Into<String>) -> Self {
        self.elevenlabs_api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn llm_model(mut self, model: impl Into<String>) -> Self {
        self.llm_model = Some(model.into());
        self
    }

    #[must_use]
    pub fn voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    #[must_use]
    pub fn tts_model(mut self, model: impl Into<String>) -> Self {
        self.tts_model = Some(model.into());
        self
    }

    #[must_use]
    pub fn stt_model(mut self, model: impl Into<String>) -> Self {
        self.recognition.model = model.into();
        self
    }

    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.recognition.language = language.into();
        self
    }

    #[must_use]
    pub const fn audio(mut self, audio: AudioConfig) -> Self {
        self.recognition.audio = audio;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Cap on remembered utterances per session.
    #[must_use]
    pub const fn max_history(mut self, utterances: usize) -> Self {
        self.max_history = Some(utterances);
        self
    }

    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.transport.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn transport(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    /// Use `recognizer` instead of Deepgram.
    #[must_use]
    pub fn recognizer(mut self, recognizer: Arc<dyn SpeechToText>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Use `model` instead of OpenAI chat completions.
    #[must_use]
    pub fn language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.language_model = Some(model);
        self
    }

    /// Use `voice` instead of ElevenLabs.
    #[must_use]
    pub fn voice(mut self, voice: Arc<dyn TextToSpeech>) -> Self {
        self.voice = Some(voice);
        self
    }

    /// # Errors
    /// Returns [`Error::Config`] if a provider has neither an injected client
    /// nor an API key, or the audio config is invalid.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Agent> {
        self.recognition.audio.validate()?;

        let recognizer: Arc<dyn SpeechToText> = match self.recognizer {
            Some(recognizer) => recognizer,
            None => Arc::new(DeepgramStt::new(required(self.deepgram_api_key, DEEPGRAM_API_KEY)?)),
        };

        let language_model: Arc<dyn LanguageModel> = match self.language_model {
            Some(model) => model,
            None => {
                let mut chat = OpenAiChat::new(&required(self.openai_api_key, OPENAI_API_KEY)?)?;
                if let Some(model) = self.llm_model {
                    chat = chat.model(model);
                }
                Arc::new(chat)
            }
        };

        let voice: Arc<dyn TextToSpeech> = match self.voice {
            Some(voice) => voice,
            None => {
                let mut tts = ElevenLabsTts::new(&required(self.elevenlabs_api_key, ELEVENLABS_API_KEY)?)?;
                if let Some(voice_id) = self.voice_id {
                    tts = tts.voice(voice_id);
                }
                if let Some(model) = self.tts_model {
                    tts = tts.model(model);
                }
                Arc::new(tts)
            }
        };

        let mut context = ConversationContext::realtime();
        if let Some(prompt) = self.system_prompt {
            context = context.with_system_prompt(prompt);
        }
        if let Some(max_history) = self.max_history {
            context = context.with_max_history(max_history);
        }

        tracing::info!(
            stt_model = %self.recognition.model,
            language = %self.recognition.language,
            sample_rate = self.recognition.audio.sample_rate,
            "Voice agent configured"
        );

        Ok(Agent {
            pipeline: Pipeline {
                recognizer,
                recognition: self.recognition,
                generator: Generator::new(language_model),
                synthesizer: Synthesizer::new(voice),
                context,
            },
            transport: self.transport,
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::result_large_err)]
fn required(value: Option<String>, name: &str) -> Result<String> {
    value.ok_or_else(|| Error::Config(format!("{name} is not set")))
}

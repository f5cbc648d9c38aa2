use super::{GenerationRequest, LanguageModel, Role};
use crate::error::Stage;
use crate::transport::BoxFuture;
use crate::{Error, Result};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 300;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Streaming chat-completions client. Clones share one connection pool.
#[derive(Clone, Debug)]
pub struct OpenAiChat {
    client: Client,
    auth_header: HeaderValue,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiChat {
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
            .build()?;
        let mut auth_header = HeaderValue::from_str(&format!("Bearer {api_key}"))?;
        auth_header.set_sensitive(true);

        Ok(Self {
            client,
            auth_header,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        })
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl LanguageModel for OpenAiChat {
    fn stream<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Result<String>>>> {
        Box::pin(async move {
            let messages = request.context.messages(&request.prompt);
            let body = ChatRequest {
                model: &self.model,
                messages: messages
                    .iter()
                    .map(|(role, content)| ChatMessage { role: *role, content: content.as_str() })
                    .collect(),
                stream: true,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            };

            let response = self
                .client
                .post(CHAT_COMPLETIONS_URL)
                .header(AUTHORIZATION, &self.auth_header)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                tracing::error!(%status, "Chat completion rejected: {detail}");
                return Err(Error::provider(
                    Stage::Generation,
                    format!("HTTP {status}: {detail}"),
                ));
            }

            tracing::debug!(model = %self.model, "Chat completion stream established");
            Ok(sse_tokens(response.bytes_stream()))
        })
    }
}

/// Incremental decoder for `data:` lines of a chat-completions SSE body.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<String>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.done {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            if let Ok(failure) = serde_json::from_str::<StreamError>(data) {
                self.done = true;
                out.push(Err(Error::provider(Stage::Generation, failure.error.message)));
                continue;
            }
            match serde_json::from_str::<ChatChunk>(data) {
                Ok(chunk) => {
                    if let Some(content) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                    {
                        out.push(Ok(content));
                    }
                }
                Err(e) => tracing::debug!("Skipping unparseable SSE chunk: {e}"),
            }
        }
        out
    }
}

fn sse_tokens<S, B>(bytes: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]>,
{
    bytes
        .scan(SseDecoder::default(), |decoder, chunk| {
            let finished = decoder.done;
            let items = match chunk {
                Ok(bytes) => decoder.push(bytes.as_ref()),
                Err(e) => {
                    decoder.done = true;
                    vec![Err(Error::from(e))]
                }
            };
            futures::future::ready((!finished).then(|| futures::stream::iter(items)))
        })
        .flatten()
        .boxed()
}

use super::{RecognitionConfig, SpeechToText, SttConnection, SttEvent};
use crate::Result;
use crate::transport::{BoxFuture, ws};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

/// Deepgram live transcription client.
#[derive(Clone)]
pub struct DeepgramStt {
    api_key: String,
}

impl std::fmt::Debug for DeepgramStt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepgramStt").finish_non_exhaustive()
    }
}

impl DeepgramStt {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

fn listen_url(config: &RecognitionConfig) -> Result<Url> {
    let mut url = Url::parse(LISTEN_URL)?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("language", &config.language)
        .append_pair("smart_format", &config.smart_format.to_string())
        .append_pair("interim_results", &config.interim_results.to_string())
        .append_pair("sample_rate", &config.audio.sample_rate.to_string())
        .append_pair("channels", &config.audio.channels.to_string())
        .append_pair("encoding", config.audio.encoding.provider_name())
        .append_pair("endpointing", &config.endpointing_ms.to_string())
        .append_pair("utterance_end_ms", &config.utterance_end_ms.to_string())
        .append_pair("vad_events", "true");
    Ok(url)
}

impl SpeechToText for DeepgramStt {
    fn open<'a>(&'a self, config: &'a RecognitionConfig) -> BoxFuture<'a, Result<Box<dyn SttConnection>>> {
        Box::pin(async move {
            let url = listen_url(config)?;
            let auth = format!("Token {}", self.api_key);
            let stream = ws::connect(&url, Some(&auth)).await?;
            Ok(Box::new(DeepgramConnection { stream }) as Box<dyn SttConnection>)
        })
    }
}

struct DeepgramConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[derive(Debug, Deserialize)]
struct LiveResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<Channel>,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

fn normalize(text: &str) -> Result<Option<SttEvent>> {
    let response: LiveResponse = serde_json::from_str(text)?;
    if response.kind != "Results" {
        tracing::debug!(kind = %response.kind, "Deepgram control message");
        return Ok(None);
    }
    let transcript = response
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript)
        .unwrap_or_default();
    if transcript.is_empty() {
        return Ok(None);
    }
    Ok(Some(SttEvent::Transcript {
        text: transcript,
        is_final: response.is_final,
    }))
}

impl SttConnection for DeepgramConnection {
    fn send_audio(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stream.send(WsMessage::Binary(frame.into())).await?;
            Ok(())
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<SttEvent>>> {
        Box::pin(async move {
            while let Some(msg) = self.stream.next().await {
                match msg? {
                    WsMessage::Text(text) => match normalize(&text) {
                        Ok(Some(event)) => return Ok(Some(event)),
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Unparseable Deepgram message: {e}"),
                    },
                    WsMessage::Close(_) => return Ok(None),
                    WsMessage::Ping(payload) => {
                        self.stream.send(WsMessage::Pong(payload)).await?;
                    }
                    _ => (),
                }
            }
            Ok(None)
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stream.send(WsMessage::Text(CLOSE_STREAM.into())).await?;
            self.stream.close(None).await?;
            Ok(())
        })
    }
}

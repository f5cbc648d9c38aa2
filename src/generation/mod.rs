//! Streaming language-model replies as a cancellable token sequence.

mod context;
mod openai;

pub use context::{ConversationContext, Role, Utterance, DEFAULT_MAX_HISTORY, DEFAULT_SYSTEM_PROMPT};
pub use openai::OpenAiChat;

use crate::error::Stage;
use crate::transport::BoxFuture;
use crate::Result;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TOKEN_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The caller's final transcript for this turn.
    pub prompt: String,
    /// Prior turns only; `prompt` is appended by the provider.
    pub context: ConversationContext,
}

/// Process-wide handle to a language-model provider.
pub trait LanguageModel: Send + Sync {
    /// Start a streaming completion. Dropping the returned stream must abort
    /// the underlying request.
    fn stream<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Result<String>>>>;
}

/// Generation adapter shared by every session.
#[derive(Clone)]
pub struct Generator {
    model: Arc<dyn LanguageModel>,
}

impl Generator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Issue one completion. The returned stream is finite and forward-only;
    /// cancelling `cancel` (or dropping the stream) aborts the provider
    /// request and ends the sequence without an error.
    #[must_use]
    pub fn generate(&self, request: GenerationRequest, cancel: &CancellationToken) -> TokenStream {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(TOKEN_QUEUE);
        let model = Arc::clone(&self.model);
        let token = cancel.clone();

        tokio::spawn(async move {
            let opened = tokio::select! {
                () = token.cancelled() => return,
                opened = model.stream(&request) => opened,
            };
            let mut tokens = match opened {
                Ok(tokens) => tokens,
                Err(e) => {
                    let _ = tx.send(Err(e.in_stage(Stage::Generation))).await;
                    return;
                }
            };
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!("Generation cancelled");
                        return;
                    }
                    next = tokens.next() => match next {
                        Some(Ok(text)) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.in_stage(Stage::Generation))).await;
                            return;
                        }
                        None => return,
                    },
                }
            }
        });

        TokenStream { rx, cancel }
    }
}

/// Tokens in provider-delivery order. A provider failure is yielded once as
/// the last item; tokens before it stay valid.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
    cancel: CancellationToken,
}

impl TokenStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

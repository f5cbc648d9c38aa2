//! Text-to-speech: segments reply text and synthesizes it one segment at a
//! time into a cancellable audio sequence.

mod elevenlabs;
mod segment;
pub mod ssml;

pub use elevenlabs::{ElevenLabsTts, VoiceSettings};
pub use segment::{MAX_SEGMENT_CHARS, Segmenter, split_for_speech};

use crate::Result;
use crate::error::Stage;
use crate::transport::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const AUDIO_QUEUE: usize = 64;

/// Process-wide handle to a synthesis provider.
pub trait TextToSpeech: Send + Sync {
    /// Synthesize one segment. Dropping the returned stream must abort the
    /// underlying request.
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<BoxStream<'static, Result<Vec<u8>>>>>;

    /// Whether the provider expects a `<speak>` payload instead of plain text.
    fn accepts_markup(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// A segment was handed to the provider.
    Segment(String),
    /// Encoded audio for the current segment.
    Audio(Vec<u8>),
}

/// Synthesis adapter shared by every session.
#[derive(Clone)]
pub struct Synthesizer {
    voice: Arc<dyn TextToSpeech>,
}

impl Synthesizer {
    pub fn new(voice: Arc<dyn TextToSpeech>) -> Self {
        Self { voice }
    }

    /// Synthesize a lazy sequence of text increments.
    ///
    /// Increments are segmented at sentence and clause boundaries. Segments
    /// are synthesized strictly in order and the next one starts only after
    /// the previous one's audio has ended. Cancelling `cancel` (or dropping
    /// the stream) stops synthesis; no audio is yielded afterwards.
    #[must_use]
    pub fn stream<S>(&self, increments: S, cancel: &CancellationToken) -> AudioStream
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(AUDIO_QUEUE);
        let voice = Arc::clone(&self.voice);
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut increments = increments.boxed();
            let mut segmenter = Segmenter::new();
            let mut queue = VecDeque::new();
            let mut exhausted = false;

            loop {
                let Some(segment) = queue.pop_front() else {
                    if exhausted {
                        break;
                    }
                    let next = tokio::select! {
                        () = token.cancelled() => return,
                        next = increments.next() => next,
                    };
                    match next {
                        Some(text) => queue.extend(segmenter.push(&text)),
                        None => {
                            exhausted = true;
                            queue.extend(segmenter.finish());
                        }
                    }
                    continue;
                };
                if !speak_segment(voice.as_ref(), segment, &tx, &token).await {
                    return;
                }
            }
            tracing::debug!("Synthesis finished");
        });

        AudioStream { rx, cancel }
    }

    /// Synthesize one complete piece of text.
    #[must_use]
    pub fn speak(&self, text: impl Into<String>, cancel: &CancellationToken) -> AudioStream {
        self.stream(futures::stream::iter([text.into()]), cancel)
    }
}

/// Returns whether synthesis should continue with the next segment.
async fn speak_segment(
    voice: &dyn TextToSpeech,
    segment: String,
    tx: &mpsc::Sender<Result<SynthesisEvent>>,
    cancel: &CancellationToken,
) -> bool {
    let payload = if voice.accepts_markup() {
        ssml::render_plain(&segment)
    } else {
        segment.clone()
    };
    if tx.send(Ok(SynthesisEvent::Segment(segment))).await.is_err() {
        return false;
    }

    let opened = tokio::select! {
        () = cancel.cancelled() => return false,
        opened = voice.synthesize(&payload) => opened,
    };
    let mut audio = match opened {
        Ok(audio) => audio,
        Err(e) => {
            let _ = tx.send(Err(e.in_stage(Stage::Synthesis))).await;
            return false;
        }
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Synthesis cancelled mid-segment");
                return false;
            }
            next = audio.next() => match next {
                Some(Ok(chunk)) if chunk.is_empty() => {}
                Some(Ok(chunk)) => {
                    if tx.send(Ok(SynthesisEvent::Audio(chunk))).await.is_err() {
                        return false;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(e.in_stage(Stage::Synthesis))).await;
                    return false;
                }
                None => return true,
            },
        }
    }
}

/// Synthesis output in order. A provider failure is yielded once as the last
/// item.
pub struct AudioStream {
    rx: mpsc::Receiver<Result<SynthesisEvent>>,
    cancel: CancellationToken,
}

impl AudioStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for AudioStream {
    type Item = Result<SynthesisEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    /// Yields `chunks_per_segment` chunks for every segment, labelled
    /// `"<segment text>#<n>"`. Can stall forever after a number of chunks or
    /// fail on request.
    #[derive(Default)]
    pub struct ScriptedVoice {
        chunks_per_segment: usize,
        stall_after: Option<usize>,
        fail: bool,
        markup: bool,
        delay: Option<std::time::Duration>,
        emitted: Mutex<usize>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedVoice {
        pub fn new(chunks_per_segment: usize) -> Self {
            Self {
                chunks_per_segment,
                ..Self::default()
            }
        }

        /// Total chunks to emit across all segments before hanging.
        pub fn stalling_after(mut self, chunks: usize) -> Self {
            self.stall_after = Some(chunks);
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn with_markup(mut self) -> Self {
            self.markup = true;
            self
        }

        /// Wait `delay` before each segment's audio starts.
        pub fn delayed(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl TextToSpeech for ScriptedVoice {
        fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<BoxStream<'static, Result<Vec<u8>>>>> {
            self.requests.lock().unwrap().push(text.to_string());
            if self.fail {
                return Box::pin(async { Err(Error::InvalidMessage("voice unavailable".into())) });
            }
            let mut emitted = self.emitted.lock().unwrap();
            let budget = self
                .stall_after
                .map_or(self.chunks_per_segment, |limit| {
                    self.chunks_per_segment.min(limit.saturating_sub(*emitted))
                });
            *emitted += budget;
            let stalls = budget < self.chunks_per_segment;
            let chunks: Vec<Result<Vec<u8>>> = (1..=budget)
                .map(|n| Ok(format!("{text}#{n}").into_bytes()))
                .collect();
            let stream = futures::stream::iter(chunks);
            let delay = self.delay;
            Box::pin(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if stalls {
                    Ok(stream.chain(futures::stream::pending()).boxed())
                } else {
                    Ok(stream.boxed())
                }
            })
        }

        fn accepts_markup(&self) -> bool {
            self.markup
        }
    }
}

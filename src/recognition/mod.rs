//! Streaming speech-to-text, normalized to partial/final transcript callbacks.

mod deepgram;

pub use deepgram::DeepgramStt;

use crate::error::Stage;
use crate::protocol::{AudioConfig, now_ms};
use crate::transport::BoxFuture;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const AUDIO_QUEUE_FRAMES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionConfig {
    pub audio: AudioConfig,
    pub language: String,
    pub model: String,
    pub smart_format: bool,
    pub interim_results: bool,
    /// Silence that turns the running hypothesis into a final result.
    pub endpointing_ms: u32,
    /// Silence that ends an utterance.
    pub utterance_end_ms: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            language: "en-US".to_string(),
            model: "nova-2".to_string(),
            smart_format: true,
            interim_results: true,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
        }
    }
}

/// A provider event after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    Transcript { text: String, is_final: bool },
}

/// Process-wide handle to a recognition provider.
pub trait SpeechToText: Send + Sync {
    fn open<'a>(&'a self, config: &'a RecognitionConfig) -> BoxFuture<'a, Result<Box<dyn SttConnection>>>;
}

/// One live recognition stream with a provider.
pub trait SttConnection: Send {
    fn send_audio(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>>;
    /// `Ok(None)` once the provider has closed the stream.
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<SttEvent>>>;
    fn finish(&mut self) -> BoxFuture<'_, Result<()>>;
}

pub type TranscriptHandler = Box<dyn Fn(String, u64) + Send + Sync>;
pub type RecognitionErrorHandler = Box<dyn Fn(Error) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    partial: Option<TranscriptHandler>,
    final_: Option<TranscriptHandler>,
    error: Option<RecognitionErrorHandler>,
}

type SharedHandlers = Arc<Mutex<Handlers>>;

/// Recognition adapter for one session.
///
/// Each `on_*` registration replaces the previous one.
pub struct RecognitionStream {
    audio_tx: mpsc::Sender<Vec<u8>>,
    ready: Arc<AtomicBool>,
    handlers: SharedHandlers,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RecognitionStream {
    /// Open a provider stream.
    ///
    /// # Errors
    /// Returns a recognition-stage error if the provider connection fails.
    pub async fn start(provider: &dyn SpeechToText, config: &RecognitionConfig) -> Result<Self> {
        let conn = provider
            .open(config)
            .await
            .map_err(|e| e.in_stage(Stage::Recognition))?;
        tracing::info!(model = %config.model, language = %config.language, "Recognition stream opened");

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_FRAMES);
        let (close_tx, close_rx) = oneshot::channel();
        let ready = Arc::new(AtomicBool::new(true));
        let handlers = SharedHandlers::default();
        let task = tokio::spawn(pump(
            conn,
            audio_rx,
            close_rx,
            Arc::clone(&handlers),
            Arc::clone(&ready),
        ));

        Ok(Self {
            audio_tx,
            ready,
            handlers,
            close_tx: Some(close_tx),
            task: Some(task),
        })
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Forward one frame. Frames are dropped, not buffered, while the
    /// provider stream is not open. Returns whether the frame was queued.
    pub fn send_audio(&self, frame: Vec<u8>) -> bool {
        if !self.is_ready() {
            tracing::warn!("Recognition stream not ready, dropping {} byte frame", frame.len());
            return false;
        }
        match self.audio_tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Recognition audio queue unavailable, dropping frame: {e}");
                false
            }
        }
    }

    pub fn on_partial<F>(&self, handler: F)
    where
        F: Fn(String, u64) + Send + Sync + 'static,
    {
        self.lock_handlers().partial = Some(Box::new(handler));
    }

    pub fn on_final<F>(&self, handler: F)
    where
        F: Fn(String, u64) + Send + Sync + 'static,
    {
        self.lock_handlers().final_ = Some(Box::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.lock_handlers().error = Some(Box::new(handler));
    }

    /// Finalize the provider stream. No callback fires after this returns.
    pub async fn close(mut self) {
        self.ready.store(false, Ordering::Release);
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::debug!("Recognition task ended abnormally: {e}");
            }
        }
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn pump(
    mut conn: Box<dyn SttConnection>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    mut close_rx: oneshot::Receiver<()>,
    handlers: SharedHandlers,
    ready: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = &mut close_rx => break,
            frame = audio_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = conn.send_audio(frame).await {
                        ready.store(false, Ordering::Release);
                        report(&handlers, e.in_stage(Stage::Recognition));
                        break;
                    }
                }
                None => break,
            },
            event = conn.next_event() => match event {
                Ok(Some(SttEvent::Transcript { text, is_final })) => {
                    if text.is_empty() {
                        continue;
                    }
                    tracing::debug!(is_final, "Transcript: {text}");
                    let guard = handlers.lock().unwrap_or_else(PoisonError::into_inner);
                    let handler = if is_final { &guard.final_ } else { &guard.partial };
                    if let Some(handler) = handler {
                        handler(text, now_ms());
                    }
                }
                Ok(None) => {
                    tracing::info!("Recognition stream closed by provider");
                    break;
                }
                Err(e) => {
                    ready.store(false, Ordering::Release);
                    report(&handlers, e.in_stage(Stage::Recognition));
                    break;
                }
            },
        }
    }

    ready.store(false, Ordering::Release);
    if let Err(e) = conn.finish().await {
        tracing::debug!("Error finishing recognition stream: {e}");
    }
}

fn report(handlers: &SharedHandlers, error: Error) {
    tracing::error!("Recognition error: {error}");
    let guard = handlers.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handler) = &guard.error {
        handler(error);
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Provider whose events are scripted by the test and whose received
    /// audio is observable.
    pub struct ScriptedStt {
        pub events: Mutex<Option<mpsc::UnboundedReceiver<Result<SttEvent>>>>,
        pub audio: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl ScriptedStt {
        pub fn new() -> (
            Arc<Self>,
            mpsc::UnboundedSender<Result<SttEvent>>,
            mpsc::UnboundedReceiver<Vec<u8>>,
        ) {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (audio_tx, audio_rx) = mpsc::unbounded_channel();
            let provider = Arc::new(Self {
                events: Mutex::new(Some(event_rx)),
                audio: audio_tx,
            });
            (provider, event_tx, audio_rx)
        }
    }

    struct ScriptedConnection {
        events: mpsc::UnboundedReceiver<Result<SttEvent>>,
        audio: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl SpeechToText for ScriptedStt {
        fn open<'a>(&'a self, _config: &'a RecognitionConfig) -> BoxFuture<'a, Result<Box<dyn SttConnection>>> {
            let events = self.events.lock().unwrap().take();
            let audio = self.audio.clone();
            Box::pin(async move {
                let events = events.ok_or(Error::ConnectionClosed)?;
                Ok(Box::new(ScriptedConnection { events, audio }) as Box<dyn SttConnection>)
            })
        }
    }

    impl SttConnection for ScriptedConnection {
        fn send_audio(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
            let sent = self.audio.send(frame).map_err(|_| Error::ConnectionClosed);
            Box::pin(async move { sent })
        }

        fn next_event(&mut self) -> BoxFuture<'_, Result<Option<SttEvent>>> {
            Box::pin(async move { self.events.recv().await.transpose() })
        }

        fn finish(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    pub fn partial(text: &str) -> Result<SttEvent> {
        Ok(SttEvent::Transcript { text: text.to_string(), is_final: false })
    }

    pub fn final_(text: &str) -> Result<SttEvent> {
        Ok(SttEvent::Transcript { text: text.to_string(), is_final: true })
    }
}

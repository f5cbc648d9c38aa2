//! Turn Orchestrator: sequences recognition, generation and synthesis per
//! conversational turn and owns cancellation on barge-in.
//!
//! Each session runs one event loop task. Transport messages, recognition
//! callbacks and reply-task progress are all funnelled into its inbox, so turn
//! state is only ever touched from that task. Reply progress is tagged with
//! the turn it belongs to; anything tagged with a retired turn is dropped.

mod metrics;
mod session;
mod turn;

pub use metrics::SessionMetrics;
pub use session::Session;
pub use turn::{Phase, PhaseStarts, Turn};

use crate::Error;
use crate::generation::{ConversationContext, GenerationRequest, Generator, Role};
use crate::protocol::{AudioConfig, Message, StopReason, now_ms};
use crate::recognition::{RecognitionConfig, RecognitionStream, SpeechToText};
use crate::synthesis::{SynthesisEvent, Synthesizer};
use crate::transport::Outbound;
use futures::StreamExt;
use metrics::stamp_once;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Provider handles shared by every session, plus per-session defaults.
#[derive(Clone)]
pub struct Pipeline {
    pub recognizer: Arc<dyn SpeechToText>,
    pub recognition: RecognitionConfig,
    pub generator: Generator,
    pub synthesizer: Synthesizer,
    pub context: ConversationContext,
}

enum Input {
    Inbound(Message),
    Partial { text: String, at: u64 },
    Final { text: String, at: u64 },
    RecognitionFailed(Error),
    Reply { turn: u64, event: ReplyEvent },
    TransportReopened,
    Shutdown,
}

enum ReplyEvent {
    Token { text: String, at: u64 },
    Segment,
    Audio { bytes: Vec<u8>, at: u64 },
    Done,
    Failed(Error),
}

/// Feeds one session's event loop. Cheap to clone.
#[derive(Clone)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<Input>,
}

impl Inbox {
    /// Hand an inbound envelope to the session. Returns false once the
    /// session has ended.
    pub fn deliver(&self, message: Message) -> bool {
        self.tx.send(Input::Inbound(message)).is_ok()
    }

    /// The transport dropped and came back; any in-flight turn is stale.
    pub fn transport_reopened(&self) {
        let _ = self.tx.send(Input::TransportReopened);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Input::Shutdown);
    }
}

/// Owner's view of a running session.
pub struct SessionHandle {
    inbox: Inbox,
    metrics: watch::Receiver<SessionMetrics>,
    phase: watch::Receiver<Phase>,
    task: Option<JoinHandle<SessionMetrics>>,
}

impl SessionHandle {
    #[must_use]
    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn deliver(&self, message: Message) -> bool {
        self.inbox.deliver(message)
    }

    /// Snapshot of the metrics as of the last processed event.
    #[must_use]
    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.borrow().clone()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Stop the session and release its provider resources. Returns the
    /// final metrics.
    pub async fn close(mut self) -> SessionMetrics {
        self.inbox.shutdown();
        let last = self.metrics();
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                tracing::error!("Session task ended abnormally: {e}");
                last
            }),
            None => last,
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.inbox.shutdown();
        }
    }
}

struct PendingFinal {
    text: String,
    at: u64,
}

impl PendingFinal {
    fn append(&mut self, text: &str, at: u64) {
        self.text.push(' ');
        self.text.push_str(text);
        self.at = at;
    }
}

struct ActiveReply {
    generation: CancellationToken,
    synthesis: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveReply {
    /// After this returns no event from the reply can reach the loop under a
    /// live turn id, and neither provider call makes further progress.
    fn cancel(self) {
        self.generation.cancel();
        self.synthesis.cancel();
        self.task.abort();
    }
}

pub struct Orchestrator {
    session: Session,
    outbound: Arc<dyn Outbound>,
    inbox: mpsc::UnboundedSender<Input>,
    recognition: Option<RecognitionStream>,
    audio: AudioConfig,
    generator: Generator,
    synthesizer: Synthesizer,
    context: ConversationContext,
    metrics: SessionMetrics,
    turn: Option<Turn>,
    reply: Option<ActiveReply>,
    /// Caller speech finalized while a reply was active. It starts the next
    /// turn as soon as that reply ends, whether completed or interrupted.
    pending: Option<PendingFinal>,
    next_turn: u64,
    metrics_tx: watch::Sender<SessionMetrics>,
    phase_tx: watch::Sender<Phase>,
}

impl Orchestrator {
    /// Open recognition for `session` and start its event loop.
    ///
    /// A recognition provider that cannot be reached is reported to the
    /// caller as an `error` envelope; the session still runs so the owner
    /// decides when to close it.
    pub async fn spawn(pipeline: &Pipeline, session: Session, outbound: Arc<dyn Outbound>) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = SessionMetrics::new(session.id.clone());
        let (metrics_tx, metrics_rx) = watch::channel(metrics.clone());
        let (phase_tx, phase_rx) = watch::channel(Phase::Listening);

        let recognition = match RecognitionStream::start(pipeline.recognizer.as_ref(), &pipeline.recognition).await {
            Ok(stream) => {
                wire_recognition(&stream, &tx);
                outbound.send(&Message::event("recognition_connected", None)).await;
                Some(stream)
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, "Failed to start recognition: {e}");
                outbound
                    .send(&Message::error("Failed to initialize speech recognition", Some(e.code())))
                    .await;
                None
            }
        };

        tracing::info!(session_id = %session.id, "Session orchestrator started");
        let orchestrator = Self {
            session,
            outbound,
            inbox: tx.clone(),
            recognition,
            audio: pipeline.recognition.audio,
            generator: pipeline.generator.clone(),
            synthesizer: pipeline.synthesizer.clone(),
            context: pipeline.context.clone(),
            metrics,
            turn: None,
            reply: None,
            pending: None,
            next_turn: 1,
            metrics_tx,
            phase_tx,
        };
        let task = tokio::spawn(orchestrator.run(rx));

        SessionHandle {
            inbox: Inbox { tx },
            metrics: metrics_rx,
            phase: phase_rx,
            task: Some(task),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) -> SessionMetrics {
        while let Some(input) = rx.recv().await {
            match input {
                Input::Shutdown => break,
                Input::Inbound(message) => self.on_inbound(message).await,
                Input::Partial { text, at } => self.on_partial(text, at).await,
                Input::Final { text, at } => self.on_final(text, at).await,
                Input::RecognitionFailed(e) => self.on_recognition_error(e).await,
                Input::Reply { turn, event } => self.on_reply(turn, event).await,
                Input::TransportReopened => self.on_transport_reopened(),
            }
        }
        self.shutdown().await;
        self.metrics
    }

    fn phase(&self) -> Phase {
        self.turn.as_ref().map_or(Phase::Listening, Turn::phase)
    }

    fn publish(&self) {
        self.metrics_tx.send_replace(self.metrics.clone());
        self.phase_tx.send_replace(self.phase());
    }

    async fn send(&self, message: Message) {
        if !self.outbound.send(&message).await {
            tracing::debug!(session_id = %self.session.id, "Dropped outbound {}", message.tag());
        }
    }

    async fn emit(&self, name: &str, details: Option<serde_json::Value>) {
        self.send(Message::event(name, details)).await;
    }

    async fn on_inbound(&mut self, message: Message) {
        match message {
            Message::AudioChunk { audio, .. } => {
                self.metrics.total_audio_duration += self.audio.frame_duration_ms(audio.len());
                self.publish();
                if let Some(recognition) = &self.recognition {
                    recognition.send_audio(audio);
                } else {
                    tracing::warn!("No recognition stream, dropping {} byte frame", audio.len());
                }
            }
            Message::BargeIn { .. } => self.barge_in().await,
            Message::Ping { .. } | Message::Pong { .. } => {}
            other => {
                tracing::warn!(session_id = %self.session.id, "Ignoring outbound-only {} from caller", other.tag());
            }
        }
    }

    async fn on_partial(&mut self, text: String, at: u64) {
        if stamp_once(&mut self.metrics.t_first_partial, self.session.elapsed_at(at)) {
            tracing::debug!(latency_ms = ?self.metrics.t_first_partial, "First partial transcript");
        }
        if self.turn.is_none() {
            let id = self.next_turn;
            self.next_turn += 1;
            self.turn = Some(Turn::new(id, at));
        }
        if let Some(turn) = self.turn.as_mut().filter(|t| t.phase() == Phase::Recognizing) {
            turn.transcript.clone_from(&text);
        }
        self.publish();
        self.send(Message::SttPartial { text, timestamp: at }).await;
    }

    async fn on_final(&mut self, text: String, at: u64) {
        self.send(Message::SttFinal {
            text: text.clone(),
            timestamp: at,
        })
        .await;
        if text.trim().is_empty() {
            return;
        }
        if self.phase().is_replying() {
            tracing::info!(session_id = %self.session.id, "Final transcript during an active reply, queued");
            self.emit("transcript_queued", Some(json!({ "text": text }))).await;
            if let Some(pending) = self.pending.as_mut() {
                pending.append(&text, at);
            } else {
                self.pending = Some(PendingFinal { text, at });
            }
            return;
        }
        self.start_reply(text, at).await;
    }

    /// Answer caller speech that arrived while the previous reply was active.
    async fn start_pending(&mut self) {
        if let Some(PendingFinal { text, at }) = self.pending.take() {
            self.start_reply(text, at).await;
        }
    }

    async fn start_reply(&mut self, text: String, at: u64) {
        let next_turn = &mut self.next_turn;
        let turn = self.turn.get_or_insert_with(|| {
            let id = *next_turn;
            *next_turn += 1;
            Turn::new(id, at)
        });
        turn.transcript.clone_from(&text);
        turn.final_at = Some(at);
        turn.advance(Phase::Generating, now_ms());
        let turn_id = turn.id;
        self.metrics.conversation_turns += 1;

        let request = GenerationRequest {
            prompt: text.clone(),
            context: self.context.clone(),
        };
        self.context.push(Role::User, text.clone(), at);
        self.reply = Some(self.spawn_reply(turn_id, request));
        self.publish();

        tracing::info!(session_id = %self.session.id, turn = turn_id, "Generating reply");
        self.emit("processing_llm_response", Some(json!({ "text": text }))).await;
    }

    fn spawn_reply(&self, turn: u64, request: GenerationRequest) -> ActiveReply {
        let generation = CancellationToken::new();
        let synthesis = CancellationToken::new();
        let task = tokio::spawn(run_reply(
            ReplySink {
                turn,
                inbox: self.inbox.clone(),
            },
            self.generator.clone(),
            self.synthesizer.clone(),
            request,
            generation.clone(),
            synthesis.clone(),
        ));
        ActiveReply {
            generation,
            synthesis,
            task,
        }
    }

    async fn on_reply(&mut self, turn_id: u64, event: ReplyEvent) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.id == turn_id && t.phase().is_replying()) else {
            tracing::trace!(turn = turn_id, "Dropping event from a retired reply");
            return;
        };

        match event {
            ReplyEvent::Token { text, at } => {
                turn.generated.push_str(&text);
                let latency = at.saturating_sub(turn.final_at.unwrap_or(at));
                if stamp_once(&mut self.metrics.t_llm_first_token, latency) {
                    self.publish();
                    self.emit("llm_first_token", Some(json!({ "latency": latency }))).await;
                }
            }
            ReplyEvent::Segment => {
                if turn.advance(Phase::Synthesizing, now_ms()) {
                    self.publish();
                }
            }
            ReplyEvent::Audio { bytes, at } => {
                turn.advance(Phase::Speaking, at);
                let seq = turn.next_seq();
                let latency = self.session.elapsed_at(at);
                let first_audio = stamp_once(&mut self.metrics.t_tts_first_audio, latency);
                self.publish();
                if first_audio {
                    self.emit("tts_first_audio", Some(json!({ "latency": latency }))).await;
                }
                self.send(Message::TtsChunk {
                    audio: bytes,
                    seq,
                    timestamp: now_ms(),
                })
                .await;
            }
            ReplyEvent::Done => {
                turn.advance(Phase::Idle, now_ms());
                let reply = std::mem::take(&mut turn.generated);
                let transcript = std::mem::take(&mut turn.transcript);
                let started = turn.started;
                let chunks = turn.chunks_sent();
                if !reply.trim().is_empty() {
                    self.context.push(Role::Assistant, reply, now_ms());
                }
                self.reply = None;
                self.turn = None;
                self.publish();

                self.send(Message::tts_stop(StopReason::Completed)).await;
                tracing::info!(session_id = %self.session.id, turn = turn_id, chunks, "Turn completed");
                self.emit(
                    "turn_completed",
                    Some(json!({
                        "turn": turn_id,
                        "chunks": chunks,
                        "transcript": transcript,
                        "phaseStarts": started,
                    })),
                )
                .await;
                self.start_pending().await;
            }
            ReplyEvent::Failed(e) => {
                tracing::error!(session_id = %self.session.id, turn = turn_id, "Reply failed: {e}");
                if let Some(reply) = self.reply.take() {
                    reply.cancel();
                }
                self.turn = None;
                self.publish();
                self.send(Message::error(e.to_string(), Some(e.code()))).await;
                self.start_pending().await;
            }
        }
    }

    /// Interrupt the active reply. Without one this is a no-op.
    async fn barge_in(&mut self) {
        if !self.phase().is_replying() {
            tracing::debug!(session_id = %self.session.id, phase = ?self.phase(), "Barge-in with no active reply");
            return;
        }
        if let Some(reply) = self.reply.take() {
            reply.cancel();
        }
        if let Some(turn) = self.turn.as_mut() {
            turn.cancel();
        }
        self.phase_tx.send_replace(Phase::Cancelled);
        self.send(Message::tts_stop(StopReason::Interrupted)).await;

        self.metrics.interruptions += 1;
        self.turn = None;
        self.publish();

        tracing::info!(
            session_id = %self.session.id,
            interruptions = self.metrics.interruptions,
            "Barge-in, reply cancelled"
        );
        self.emit(
            "barge_in_detected",
            Some(json!({ "interruptions": self.metrics.interruptions })),
        )
        .await;
        self.start_pending().await;
    }

    async fn on_recognition_error(&mut self, error: Error) {
        if self.turn.as_ref().is_some_and(|t| t.phase() == Phase::Recognizing) {
            self.turn = None;
            self.publish();
        }
        self.send(Message::error(error.to_string(), Some(error.code()))).await;
    }

    fn on_transport_reopened(&mut self) {
        self.pending = None;
        let Some(turn) = self.turn.take() else {
            return;
        };
        if let Some(reply) = self.reply.take() {
            reply.cancel();
        }
        tracing::info!(
            session_id = %self.session.id,
            turn = turn.id,
            "Transport re-opened, discarding in-flight turn"
        );
        self.publish();
    }

    async fn shutdown(&mut self) {
        if let Some(reply) = self.reply.take() {
            reply.cancel();
        }
        self.turn = None;
        self.pending = None;
        if let Some(recognition) = self.recognition.take() {
            recognition.close().await;
        }
        self.publish();
        self.emit("session_cleanup", None).await;
        tracing::info!(
            session_id = %self.session.id,
            turns = self.metrics.conversation_turns,
            interruptions = self.metrics.interruptions,
            "Session closed"
        );
    }
}

fn wire_recognition(stream: &RecognitionStream, tx: &mpsc::UnboundedSender<Input>) {
    let partial = tx.clone();
    stream.on_partial(move |text, at| {
        let _ = partial.send(Input::Partial { text, at });
    });
    let final_ = tx.clone();
    stream.on_final(move |text, at| {
        let _ = final_.send(Input::Final { text, at });
    });
    let failed = tx.clone();
    stream.on_error(move |e| {
        let _ = failed.send(Input::RecognitionFailed(e));
    });
}

#[derive(Clone)]
struct ReplySink {
    turn: u64,
    inbox: mpsc::UnboundedSender<Input>,
}

impl ReplySink {
    fn send(&self, event: ReplyEvent) {
        let _ = self.inbox.send(Input::Reply {
            turn: self.turn,
            event,
        });
    }
}

/// Generation feeding synthesis for one turn. Tokens go to synthesis as they
/// arrive so early sentences are spoken while later ones are generated.
async fn run_reply(
    sink: ReplySink,
    generator: Generator,
    synthesizer: Synthesizer,
    request: GenerationRequest,
    generation: CancellationToken,
    synthesis: CancellationToken,
) {
    let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();
    let mut tokens = generator.generate(request, &generation);
    let mut audio = synthesizer.stream(
        futures::stream::poll_fn(move |cx| text_rx.poll_recv(cx)),
        &synthesis,
    );

    let produce = {
        let sink = sink.clone();
        async move {
            while let Some(token) = tokens.next().await {
                let text = token?;
                sink.send(ReplyEvent::Token {
                    text: text.clone(),
                    at: now_ms(),
                });
                let _ = text_tx.send(text);
            }
            Ok::<_, Error>(())
        }
    };
    let consume = {
        let sink = sink.clone();
        async move {
            while let Some(event) = audio.next().await {
                match event? {
                    SynthesisEvent::Segment(_) => sink.send(ReplyEvent::Segment),
                    SynthesisEvent::Audio(bytes) => sink.send(ReplyEvent::Audio { bytes, at: now_ms() }),
                }
            }
            Ok::<_, Error>(())
        }
    };

    let outcome = tokio::try_join!(produce, consume);
    if generation.is_cancelled() || synthesis.is_cancelled() {
        return;
    }
    match outcome {
        Ok(((), ())) => sink.send(ReplyEvent::Done),
        Err(e) => sink.send(ReplyEvent::Failed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::mock::ScriptedModel;
    use crate::recognition::SttEvent;
    use crate::recognition::mock::{ScriptedStt, final_, partial};
    use crate::synthesis::mock::ScriptedVoice;
    use crate::transport::BoxFuture;
    use std::time::Duration;

    struct ChannelOutbound(mpsc::UnboundedSender<Message>);

    impl Outbound for ChannelOutbound {
        fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, bool> {
            let sent = self.0.send(message.clone()).is_ok();
            Box::pin(async move { sent })
        }
    }

    struct Harness {
        handle: SessionHandle,
        out: mpsc::UnboundedReceiver<Message>,
        stt: mpsc::UnboundedSender<crate::Result<SttEvent>>,
        audio: mpsc::UnboundedReceiver<Vec<u8>>,
        model: Arc<ScriptedModel>,
        voice: Arc<ScriptedVoice>,
    }

    async fn harness(model: Arc<ScriptedModel>, voice: ScriptedVoice) -> Harness {
        let (provider, stt, audio) = ScriptedStt::new();
        let voice = Arc::new(voice);
        let pipeline = Pipeline {
            recognizer: provider,
            recognition: RecognitionConfig::default(),
            generator: Generator::new(model.clone()),
            synthesizer: Synthesizer::new(voice.clone()),
            context: ConversationContext::default(),
        };
        let (tx, mut out) = mpsc::unbounded_channel();
        let handle = Orchestrator::spawn(&pipeline, Session::new(), Arc::new(ChannelOutbound(tx))).await;
        assert!(is_event(&next(&mut out).await, "recognition_connected"));
        Harness {
            handle,
            out,
            stt,
            audio,
            model,
            voice,
        }
    }

    async fn next(out: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), out.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed")
    }

    /// Collect outbound messages up to and including the first match.
    async fn until(
        out: &mut mpsc::UnboundedReceiver<Message>,
        done: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let message = next(out).await;
            let stop = done(&message);
            seen.push(message);
            if stop {
                return seen;
            }
        }
    }

    async fn quiet(out: &mut mpsc::UnboundedReceiver<Message>) -> bool {
        tokio::time::timeout(Duration::from_millis(100), out.recv()).await.is_err()
    }

    fn is_event(message: &Message, expected: &str) -> bool {
        matches!(message, Message::Event { name, .. } if name == expected)
    }

    fn is_stop(message: &Message, expected: StopReason) -> bool {
        matches!(message, Message::TtsStop { reason, .. } if *reason == expected)
    }

    fn seqs(messages: &[Message]) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::TtsChunk { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    fn audio_chunk() -> Message {
        Message::AudioChunk {
            audio: vec![0; 640],
            timestamp: now_ms(),
        }
    }

    fn barge_in() -> Message {
        Message::BargeIn { timestamp: now_ms() }
    }

    #[tokio::test]
    async fn final_transcript_drives_a_full_turn() {
        let model = ScriptedModel::new(&["Sure", ", I can book", " a viewing tomorrow.", " What time suits you?"]);
        let mut h = harness(model, ScriptedVoice::new(2)).await;

        for _ in 0..3 {
            assert!(h.handle.deliver(audio_chunk()));
        }
        for _ in 0..3 {
            assert_eq!(h.audio.recv().await.unwrap().len(), 640);
        }

        h.stt.send(partial("book a")).unwrap();
        assert!(matches!(next(&mut h.out).await, Message::SttPartial { text, .. } if text == "book a"));
        assert!(h.model.requests().is_empty());

        h.stt.send(final_("book a viewing tomorrow")).unwrap();
        let seen = until(&mut h.out, |m| is_event(m, "turn_completed")).await;

        assert!(matches!(&seen[0], Message::SttFinal { text, .. } if text == "book a viewing tomorrow"));
        assert_eq!(seqs(&seen), vec![1, 2, 3, 4]);
        assert_eq!(seen.iter().filter(|m| is_event(m, "llm_first_token")).count(), 1);
        assert_eq!(seen.iter().filter(|m| is_event(m, "tts_first_audio")).count(), 1);
        let stop_at = seen.iter().position(|m| is_stop(m, StopReason::Completed)).unwrap();
        assert_eq!(stop_at, seen.len() - 2);
        assert!(!seen[stop_at..].iter().any(|m| matches!(m, Message::TtsChunk { .. })));

        let requests = h.model.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "book a viewing tomorrow");
        assert!(requests[0].context.history.is_empty());
        assert_eq!(h.voice.requests(), vec!["Sure, I can book a viewing tomorrow.", "What time suits you?"]);

        let metrics = h.handle.metrics();
        assert!(metrics.t_first_partial.is_some());
        assert!(metrics.t_llm_first_token.is_some());
        assert!(metrics.t_tts_first_audio.is_some());
        assert_eq!(metrics.conversation_turns, 1);
        assert_eq!(metrics.total_audio_duration, 60);
        assert_eq!(metrics.interruptions, 0);
        assert_eq!(h.handle.phase(), Phase::Listening);
    }

    #[tokio::test]
    async fn later_turns_see_earlier_ones_in_context() {
        let model = ScriptedModel::new(&["Happy to help."]);
        let mut h = harness(model, ScriptedVoice::new(1)).await;

        h.stt.send(final_("hello")).unwrap();
        until(&mut h.out, |m| is_event(m, "turn_completed")).await;
        h.stt.send(final_("book a viewing")).unwrap();
        let seen = until(&mut h.out, |m| is_event(m, "turn_completed")).await;
        assert_eq!(seqs(&seen), vec![1]);

        let requests = h.model.requests();
        assert_eq!(requests.len(), 2);
        let history: Vec<_> = requests[1]
            .context
            .history
            .iter()
            .map(|u| (u.role, u.content.as_str()))
            .collect();
        assert_eq!(history, vec![(Role::User, "hello"), (Role::Assistant, "Happy to help.")]);
        assert_eq!(h.handle.metrics().conversation_turns, 2);
    }

    #[tokio::test]
    async fn barge_in_after_two_chunks_cancels_the_reply() {
        let model = ScriptedModel::new(&["Let me check the calendar for you. ", "I have three openings."]);
        let mut h = harness(model, ScriptedVoice::new(3).stalling_after(2)).await;

        h.stt.send(final_("book a viewing tomorrow")).unwrap();
        let seen = until(&mut h.out, |m| matches!(m, Message::TtsChunk { seq: 2, .. })).await;
        assert_eq!(seqs(&seen), vec![1, 2]);
        assert_eq!(h.handle.phase(), Phase::Speaking);

        h.handle.deliver(barge_in());
        assert!(is_stop(&next(&mut h.out).await, StopReason::Interrupted));
        assert!(is_event(&next(&mut h.out).await, "barge_in_detected"));
        assert!(quiet(&mut h.out).await);

        assert_eq!(h.handle.metrics().interruptions, 1);
        assert_eq!(h.handle.phase(), Phase::Listening);

        assert!(h.handle.deliver(audio_chunk()));
        assert_eq!(h.audio.recv().await.unwrap().len(), 640);
    }

    #[tokio::test]
    async fn barge_in_while_listening_is_a_no_op() {
        let model = ScriptedModel::new(&["Hi."]);
        let mut h = harness(model, ScriptedVoice::new(1)).await;

        h.handle.deliver(barge_in());
        h.stt.send(partial("hel")).unwrap();
        assert!(matches!(next(&mut h.out).await, Message::SttPartial { .. }));
        assert_eq!(h.handle.metrics().interruptions, 0);
        assert_eq!(h.handle.phase(), Phase::Recognizing);
        assert!(h.model.requests().is_empty());
    }

    #[tokio::test]
    async fn barge_in_while_generating_stops_before_any_audio() {
        let model = ScriptedModel::stalling_after(&["Let me check. "], 0);
        let mut h = harness(model, ScriptedVoice::new(1)).await;

        h.stt.send(final_("book a viewing")).unwrap();
        until(&mut h.out, |m| is_event(m, "processing_llm_response")).await;
        assert_eq!(h.handle.phase(), Phase::Generating);

        h.handle.deliver(barge_in());
        assert!(is_stop(&next(&mut h.out).await, StopReason::Interrupted));
        assert!(is_event(&next(&mut h.out).await, "barge_in_detected"));
        assert!(quiet(&mut h.out).await);
        assert_eq!(h.handle.metrics().interruptions, 1);
        assert_eq!(h.handle.phase(), Phase::Listening);
        assert!(h.voice.requests().is_empty());
    }

    #[tokio::test]
    async fn barge_in_while_synthesizing_stops_before_any_audio() {
        let model = ScriptedModel::new(&["Let me check the calendar. "]);
        let mut h = harness(model, ScriptedVoice::new(2).stalling_after(0)).await;
        let mut phase = h.handle.watch_phase();

        h.stt.send(final_("book a viewing")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), phase.wait_for(|p| *p == Phase::Synthesizing))
            .await
            .unwrap()
            .unwrap();

        h.handle.deliver(barge_in());
        let seen = until(&mut h.out, |m| is_event(m, "barge_in_detected")).await;
        assert_eq!(seen.iter().filter(|m| is_stop(m, StopReason::Interrupted)).count(), 1);
        assert!(seqs(&seen).is_empty());
        assert!(quiet(&mut h.out).await);
        assert_eq!(h.handle.metrics().interruptions, 1);
        assert_eq!(h.handle.phase(), Phase::Listening);
    }

    #[tokio::test]
    async fn final_during_reply_is_answered_after_barge_in() {
        let model = ScriptedModel::new(&["One moment please. "]);
        let mut h = harness(model, ScriptedVoice::new(2).stalling_after(1)).await;

        h.stt.send(final_("book a viewing")).unwrap();
        until(&mut h.out, |m| matches!(m, Message::TtsChunk { .. })).await;

        h.stt.send(final_("actually make it friday")).unwrap();
        assert!(matches!(next(&mut h.out).await, Message::SttFinal { .. }));
        assert!(is_event(&next(&mut h.out).await, "transcript_queued"));
        assert_eq!(h.model.requests().len(), 1);

        h.handle.deliver(barge_in());
        let seen = until(&mut h.out, |m| is_event(m, "processing_llm_response")).await;
        assert!(is_stop(&seen[0], StopReason::Interrupted));
        assert!(is_event(&seen[1], "barge_in_detected"));

        let requests = h.model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].prompt, "actually make it friday");
        let history: Vec<_> = requests[1].context.history.iter().map(|u| u.content.as_str()).collect();
        assert_eq!(history, vec!["book a viewing"]);
        assert_eq!(h.handle.metrics().conversation_turns, 2);
        assert_eq!(h.handle.metrics().interruptions, 1);
        assert!(h.handle.phase().is_replying());
    }

    #[tokio::test(start_paused = true)]
    async fn final_during_reply_is_answered_once_the_reply_completes() {
        let model = ScriptedModel::new(&["Sure thing."]);
        let mut h = harness(model, ScriptedVoice::new(1).delayed(Duration::from_millis(50))).await;

        h.stt.send(final_("book a viewing")).unwrap();
        until(&mut h.out, |m| is_event(m, "processing_llm_response")).await;
        h.stt.send(final_("for two people")).unwrap();

        let first = until(&mut h.out, |m| is_event(m, "turn_completed")).await;
        assert!(first.iter().any(|m| is_event(m, "transcript_queued")));
        let second = until(&mut h.out, |m| is_event(m, "turn_completed")).await;
        assert_eq!(seqs(&second), vec![1]);
        assert!(is_stop(&second[second.len() - 2], StopReason::Completed));

        let prompts: Vec<_> = h.model.requests().into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["book a viewing", "for two people"]);
        assert_eq!(h.handle.metrics().interruptions, 0);
    }

    #[tokio::test]
    async fn completed_turn_reports_transcript_and_phase_starts() {
        let model = ScriptedModel::new(&["Hello."]);
        let mut h = harness(model, ScriptedVoice::new(1)).await;

        h.stt.send(final_("hi there")).unwrap();
        let seen = until(&mut h.out, |m| is_event(m, "turn_completed")).await;
        let Some(Message::Event { details: Some(details), .. }) = seen.last() else {
            panic!("turn_completed without details");
        };
        assert_eq!(details["transcript"], "hi there");
        assert_eq!(details["chunks"], 1);
        let starts = &details["phaseStarts"];
        for phase in ["recognizing", "generating", "synthesizing", "speaking", "idle"] {
            assert!(starts[phase].is_u64(), "missing {phase}");
        }
        assert!(starts["generating"].as_u64() <= starts["idle"].as_u64());
    }

    #[tokio::test]
    async fn generation_failure_reports_error_and_returns_to_listening() {
        let model = ScriptedModel::failing_after(&["never"], 0);
        let mut h = harness(model, ScriptedVoice::new(1)).await;

        h.stt.send(final_("book a viewing")).unwrap();
        let seen = until(&mut h.out, |m| matches!(m, Message::Error { .. })).await;
        assert!(matches!(seen.last(), Some(Message::Error { code: Some(code), .. }) if code == "LLM_ERROR"));
        assert!(!seen.iter().any(|m| matches!(m, Message::TtsStop { .. } | Message::TtsChunk { .. })));
        assert!(quiet(&mut h.out).await);
        assert_eq!(h.handle.phase(), Phase::Listening);

        h.stt.send(final_("hello?")).unwrap();
        until(&mut h.out, |m| matches!(m, Message::Error { .. })).await;
        assert_eq!(h.model.requests().len(), 2);
    }

    #[tokio::test]
    async fn synthesis_failure_is_a_tts_error() {
        let model = ScriptedModel::new(&["Hello there."]);
        let mut h = harness(model, ScriptedVoice::new(1).failing()).await;

        h.stt.send(final_("hi")).unwrap();
        let seen = until(&mut h.out, |m| matches!(m, Message::Error { .. })).await;
        assert!(matches!(seen.last(), Some(Message::Error { code: Some(code), .. }) if code == "TTS_ERROR"));
        assert_eq!(h.handle.phase(), Phase::Listening);
    }

    #[tokio::test]
    async fn recognition_error_is_reported() {
        let model = ScriptedModel::new(&["Hi."]);
        let mut h = harness(model, ScriptedVoice::new(1)).await;

        h.stt.send(partial("book")).unwrap();
        next(&mut h.out).await;
        h.stt.send(Err(Error::ConnectionClosed)).unwrap();
        let message = next(&mut h.out).await;
        assert!(matches!(message, Message::Error { code: Some(code), .. } if code == "RECOGNITION_ERROR"));
        assert_eq!(h.handle.phase(), Phase::Listening);
    }

    #[tokio::test]
    async fn reopened_transport_discards_the_turn_silently() {
        let model = ScriptedModel::new(&["Let me look that up. "]);
        let mut h = harness(model, ScriptedVoice::new(3).stalling_after(1)).await;

        h.stt.send(final_("book a viewing")).unwrap();
        until(&mut h.out, |m| matches!(m, Message::TtsChunk { .. })).await;

        h.handle.inbox().transport_reopened();
        h.handle.deliver(barge_in());
        assert!(quiet(&mut h.out).await);
        assert_eq!(h.handle.phase(), Phase::Listening);
        assert_eq!(h.handle.metrics().interruptions, 0);
    }

    #[tokio::test]
    async fn close_returns_final_metrics() {
        let model = ScriptedModel::new(&["Hi."]);
        let mut h = harness(model, ScriptedVoice::new(1)).await;

        h.handle.deliver(audio_chunk());
        h.audio.recv().await.unwrap();
        let metrics = h.handle.close().await;
        assert_eq!(metrics.total_audio_duration, 20);
        assert!(is_event(&next(&mut h.out).await, "session_cleanup"));
    }
}

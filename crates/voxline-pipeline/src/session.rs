//! The task that owns one running stream.
//!
//! A stream is driven by two tasks. The session task owns the buffer, the
//! transcription adapter, the timers and the state machine; it never awaits
//! anything slow, so audio keeps flowing while a reply is being produced.
//! The turn worker runs transcript handling (memory, dialogue, synthesis,
//! publishing) strictly in arrival order. All observer events for a stream
//! are published by the worker until teardown, then by the session task.

use crate::adapter::{AdapterStatus, TranscriptionAdapter, WriteOutcome};
use crate::buffer::AudioBuffer;
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::pipeline::Registry;
use crate::sink::EventSink;
use base64::Engine;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use voxline_memory::{ContextSeed, ConversationStore};
use voxline_types::{
    now_millis, ResponsePayload, ServerEvent, Speaker, StreamEndPayload, StreamState,
    StreamSummary, Topic, TranscriptionConfig, TranscriptionPayload, VoiceOptions,
};
use voxline_voice::{
    DialogueEngine, DialogueRequest, SpeechSynthesizer, TranscriptResult, TranscriptionError,
    TranscriptionService,
};

/// The collaborators every stream uses.
#[derive(Clone)]
pub struct PipelineServices {
    pub transcription: Arc<dyn TranscriptionService>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub dialogue: Arc<dyn DialogueEngine>,
    pub memory: Arc<ConversationStore>,
    pub sink: Arc<dyn EventSink>,
}

/// Per-stream options supplied by the transport when a stream starts.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub transcription: TranscriptionConfig,
    pub voice: VoiceOptions,
    /// Used only when the session has no conversation context yet.
    pub context: ContextSeed,
    /// Receives synthesized reply audio for playback to the caller.
    pub audio_out: Option<mpsc::Sender<Vec<u8>>>,
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Stopped on request.
    Completed,
    /// The audio source went away.
    TransportClosed,
    /// The pipeline is shutting down.
    Shutdown,
    /// The hard timeout elapsed.
    Timeout,
    BufferOverflow,
    /// Transcription failed fatally or ran out of retries.
    TranscriptionFailed,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TransportClosed => "transport_closed",
            Self::Shutdown => "shutdown",
            Self::Timeout => "timeout",
            Self::BufferOverflow => "buffer_overflow",
            Self::TranscriptionFailed => "transcription_failed",
        }
    }

    /// The message observers receive when this is a forced teardown.
    pub fn observer_error(self) -> Option<&'static str> {
        match self {
            Self::Timeout => Some("Stream timed out"),
            Self::BufferOverflow => Some("Audio buffer overflow"),
            Self::TranscriptionFailed => Some("Transcription unavailable"),
            Self::Completed | Self::TransportClosed | Self::Shutdown => None,
        }
    }
}

/// Point-in-time view of a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub stream_id: String,
    pub session_id: String,
    pub state: StreamState,
    pub adapter: AdapterStatus,
    pub retries: u32,
    pub buffered_bytes: usize,
    pub turn_count: usize,
    pub elapsed_ms: u64,
}

/// The part of [`StreamStatus`] owned by the session task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    pub state: StreamState,
    pub adapter: AdapterStatus,
    pub retries: u32,
    pub buffered_bytes: usize,
}

impl Snapshot {
    pub(crate) fn starting() -> Self {
        Self {
            state: StreamState::Starting,
            adapter: AdapterStatus::Disconnected,
            retries: 0,
            buffered_bytes: 0,
        }
    }
}

pub(crate) enum Command {
    Audio {
        chunk: Vec<u8>,
        ack: oneshot::Sender<Result<(), PipelineError>>,
    },
}

/// Everything a session task is created from.
pub(crate) struct SessionInit {
    pub stream_id: String,
    pub session_id: String,
    pub generation: Uuid,
    pub started_at: Instant,
    pub settings: PipelineSettings,
    pub services: PipelineServices,
    pub registry: Registry,
    pub transcription: TranscriptionConfig,
    pub voice: VoiceOptions,
    pub audio_out: Option<mpsc::Sender<Vec<u8>>>,
    pub snapshot: watch::Sender<Snapshot>,
    pub turns: Arc<AtomicUsize>,
}

/// Connects the stream and, on success, runs it to completion.
///
/// The outcome of connecting is reported on `ready`. Returns `None` when the
/// stream never became active.
pub(crate) async fn launch(
    init: SessionInit,
    commands: mpsc::Receiver<Command>,
    mut stop: oneshot::Receiver<EndReason>,
    ready: oneshot::Sender<Result<(), PipelineError>>,
) -> Option<StreamSummary> {
    let connect = TranscriptionAdapter::connect(
        init.services.transcription.clone(),
        init.transcription.clone(),
        init.settings.max_retries(),
        init.settings.retry_delay(),
    );

    let outcome = tokio::select! {
        biased;
        _ = &mut stop => Err(PipelineError::AdapterUnavailable(
            "stream stopped while connecting".to_string(),
        )),
        result = connect => result,
    };

    match outcome {
        Ok(adapter) => {
            let mut session = Session::new(init, adapter);
            session.transition(StreamState::Active);
            tracing::info!(
                stream_id = %session.stream_id,
                session_id = %session.session_id,
                "stream active"
            );
            let _ = ready.send(Ok(()));
            Some(session.run(commands, stop).await)
        }
        Err(err) => {
            tracing::warn!(
                stream_id = %init.stream_id,
                session_id = %init.session_id,
                error = %err,
                "stream failed to start"
            );
            init.registry.release(
                &init.stream_id,
                init.generation,
                &init.session_id,
                &init.services.memory,
            );
            let _ = ready.send(Err(err));
            None
        }
    }
}

struct Session {
    stream_id: String,
    session_id: String,
    generation: Uuid,
    topic: String,
    settings: PipelineSettings,
    services: PipelineServices,
    registry: Registry,
    adapter: TranscriptionAdapter,
    buffer: AudioBuffer,
    state: StreamState,
    retries: u32,
    started_at: Instant,
    hard_deadline: Instant,
    retry_at: Option<Instant>,
    last_write_at: Instant,
    snapshot: watch::Sender<Snapshot>,
    turns: Arc<AtomicUsize>,
    jobs: mpsc::Sender<TurnJob>,
    /// Final transcripts waiting for room in `jobs`, oldest first.
    backlog: VecDeque<TurnJob>,
    worker: JoinHandle<()>,
    worker_cancel: CancellationToken,
}

impl Session {
    fn new(init: SessionInit, adapter: TranscriptionAdapter) -> Self {
        let topic = Topic::voice_agent(&init.session_id).to_string();
        let (jobs, jobs_rx) = mpsc::channel(init.settings.command_queue.max(1));
        let worker_cancel = CancellationToken::new();
        let worker = TurnWorker {
            stream_id: init.stream_id.clone(),
            session_id: init.session_id.clone(),
            topic: topic.clone(),
            voice: init.voice,
            audio_out: init.audio_out,
            services: init.services.clone(),
            turns: init.turns.clone(),
        };
        let worker = tokio::spawn(worker.run(jobs_rx, worker_cancel.clone()));
        let now = Instant::now();

        Self {
            stream_id: init.stream_id,
            session_id: init.session_id,
            generation: init.generation,
            topic,
            buffer: AudioBuffer::new(init.settings.buffer_cap_bytes),
            hard_deadline: now + init.settings.hard_timeout(),
            settings: init.settings,
            services: init.services,
            registry: init.registry,
            adapter,
            state: StreamState::Starting,
            retries: 0,
            started_at: init.started_at,
            retry_at: None,
            last_write_at: now,
            snapshot: init.snapshot,
            turns: init.turns,
            jobs,
            backlog: VecDeque::new(),
            worker,
            worker_cancel,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stop: oneshot::Receiver<EndReason>,
    ) -> StreamSummary {
        let period = self.settings.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;
                reason = &mut stop => break reason.unwrap_or(EndReason::Shutdown),
                _ = tokio::time::sleep_until(self.hard_deadline) => {
                    tracing::warn!(stream_id = %self.stream_id, "stream hit hard timeout");
                    break EndReason::Timeout;
                }
                command = commands.recv() => match command {
                    Some(Command::Audio { chunk, ack }) => match self.ingest(&chunk) {
                        Ok(flow) => {
                            let _ = ack.send(Ok(()));
                            if let ControlFlow::Break(reason) = flow {
                                break reason;
                            }
                        }
                        Err(err) => {
                            let _ = ack.send(Err(err));
                            break EndReason::BufferOverflow;
                        }
                    },
                    None => break EndReason::Shutdown,
                },
                result = self.adapter.next_result() => {
                    let flow = match result {
                        Ok(result) => {
                            self.on_transcript(result);
                            ControlFlow::Continue(())
                        }
                        Err(err) => self.on_failure(err),
                    };
                    if let ControlFlow::Break(reason) = flow {
                        break reason;
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or(self.hard_deadline)), if retry_at.is_some() => {
                    if let ControlFlow::Break(reason) = self.recover().await {
                        break reason;
                    }
                }
                permit = self.jobs.clone().reserve_owned(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(job) = self.backlog.pop_front() {
                            permit.send(job);
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            stream_id = %self.stream_id,
                            dropped = self.backlog.len(),
                            "turn worker gone, transcripts dropped"
                        );
                        self.backlog.clear();
                    }
                },
                _ = keepalive.tick() => {
                    if let ControlFlow::Break(reason) = self.on_keepalive_tick(period) {
                        break reason;
                    }
                }
            }
        };

        self.teardown(reason).await
    }

    fn ingest(&mut self, chunk: &[u8]) -> Result<ControlFlow<EndReason>, PipelineError> {
        if let Err(overflow) = self.buffer.push(chunk) {
            tracing::error!(
                stream_id = %self.stream_id,
                buffered = overflow.buffered,
                cap = overflow.cap,
                "audio buffer overflow"
            );
            return Err(PipelineError::BufferOverflow {
                buffered: overflow.buffered,
                cap: overflow.cap,
            });
        }
        Ok(self.flush())
    }

    /// Writes whole threshold-sized slices while the connection accepts
    /// them. Anything left stays buffered.
    fn flush(&mut self) -> ControlFlow<EndReason> {
        if self.state != StreamState::Active {
            self.publish_snapshot();
            return ControlFlow::Continue(());
        }

        let threshold = self.settings.flush_threshold_bytes.max(1);
        while let Some(slice) = self.buffer.front(threshold) {
            match self.adapter.try_write(slice) {
                WriteOutcome::Accepted => {
                    self.buffer.consume(threshold);
                    self.last_write_at = Instant::now();
                }
                WriteOutcome::Busy => break,
                WriteOutcome::Closed => {
                    return self.on_failure(TranscriptionError::Transient(
                        "transcription connection closed".to_string(),
                    ));
                }
            }
        }
        self.publish_snapshot();
        ControlFlow::Continue(())
    }

    fn on_keepalive_tick(&mut self, period: std::time::Duration) -> ControlFlow<EndReason> {
        if self.state != StreamState::Active {
            return ControlFlow::Continue(());
        }
        if let ControlFlow::Break(reason) = self.flush() {
            return ControlFlow::Break(reason);
        }
        if self.last_write_at.elapsed() < period {
            return ControlFlow::Continue(());
        }
        match self.adapter.send_keepalive() {
            WriteOutcome::Accepted => {
                tracing::trace!(stream_id = %self.stream_id, "keepalive sent");
                self.last_write_at = Instant::now();
                ControlFlow::Continue(())
            }
            WriteOutcome::Busy => ControlFlow::Continue(()),
            WriteOutcome::Closed => self.on_failure(TranscriptionError::Transient(
                "transcription connection closed".to_string(),
            )),
        }
    }

    /// Hands a transcript to the turn worker without waiting on it.
    ///
    /// While the worker is busy, finals queue up in `backlog` (bounded by
    /// `command_queue`) and partials are dropped.
    fn on_transcript(&mut self, result: TranscriptResult) {
        if self.state != StreamState::Active {
            return;
        }
        if !result.is_final {
            if !self.settings.publish_partials || !self.backlog.is_empty() {
                return;
            }
            if let Err(TrySendError::Full(_)) = self.jobs.try_send(TurnJob::Partial(result)) {
                tracing::debug!(stream_id = %self.stream_id, "turn worker busy, partial dropped");
            }
            return;
        }

        let job = if self.backlog.is_empty() {
            match self.jobs.try_send(TurnJob::Final(result)) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) => job,
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!(stream_id = %self.stream_id, "turn worker gone, transcript dropped");
                    return;
                }
            }
        } else {
            TurnJob::Final(result)
        };

        if self.backlog.len() >= self.settings.command_queue.max(1) {
            tracing::warn!(
                stream_id = %self.stream_id,
                backlog = self.backlog.len(),
                "turn backlog full, final transcript dropped"
            );
            return;
        }
        self.backlog.push_back(job);
    }

    /// Counts a transcription failure and either schedules a reconnect or
    /// ends the stream.
    fn on_failure(&mut self, err: TranscriptionError) -> ControlFlow<EndReason> {
        self.adapter.disconnect();

        if !err.is_transient() {
            tracing::error!(stream_id = %self.stream_id, error = %err, "transcription failed");
            return ControlFlow::Break(EndReason::TranscriptionFailed);
        }

        self.retries += 1;
        let max_retries = self.settings.max_retries();
        if self.retries >= max_retries {
            tracing::error!(
                stream_id = %self.stream_id,
                retries = self.retries,
                error = %err,
                "transcription retries exhausted"
            );
            return ControlFlow::Break(EndReason::TranscriptionFailed);
        }

        let delay = self.settings.retry_delay() * self.retries;
        tracing::warn!(
            stream_id = %self.stream_id,
            retries = self.retries,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transcription interrupted, scheduling reconnect"
        );
        self.retry_at = Some(Instant::now() + delay);
        if self.state == StreamState::Active {
            self.transition(StreamState::Recovering);
        } else {
            self.publish_snapshot();
        }
        ControlFlow::Continue(())
    }

    async fn recover(&mut self) -> ControlFlow<EndReason> {
        self.retry_at = None;
        match self.adapter.reconnect().await {
            Ok(()) => {
                tracing::info!(
                    stream_id = %self.stream_id,
                    retries = self.retries,
                    "transcription reconnected"
                );
                let now = Instant::now();
                self.retries = 0;
                self.hard_deadline = now + self.settings.hard_timeout();
                self.last_write_at = now;
                self.transition(StreamState::Active);
                self.flush()
            }
            Err(err) => self.on_failure(err),
        }
    }

    async fn teardown(mut self, reason: EndReason) -> StreamSummary {
        self.transition(StreamState::Stopping);

        self.worker_cancel.cancel();
        if let Err(e) = (&mut self.worker).await {
            tracing::warn!(stream_id = %self.stream_id, error = %e, "turn worker panicked");
        }
        self.adapter.close();

        self.registry.release(
            &self.stream_id,
            self.generation,
            &self.session_id,
            &self.services.memory,
        );

        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let summary = StreamSummary {
            stream_id: self.stream_id.clone(),
            session_id: self.session_id.clone(),
            turn_count: self.turns.load(Ordering::Relaxed),
            duration_ms,
            reason: reason.as_str().to_string(),
        };

        let sink = &self.services.sink;
        if let Some(message) = reason.observer_error() {
            sink.publish(&self.topic, ServerEvent::error(message)).await;
        }
        sink.publish(
            &self.topic,
            ServerEvent::StreamEnd(StreamEndPayload {
                summary: summary.clone(),
                duration: duration_ms,
            }),
        )
        .await;

        self.transition(StreamState::Stopped);
        tracing::info!(
            stream_id = %self.stream_id,
            session_id = %self.session_id,
            reason = reason.as_str(),
            turn_count = summary.turn_count,
            duration_ms,
            "stream stopped"
        );
        summary
    }

    fn transition(&mut self, next: StreamState) {
        if !self.state.can_transition_to(next) {
            tracing::debug!(
                stream_id = %self.stream_id,
                from = %self.state,
                to = %next,
                "ignoring invalid state transition"
            );
            return;
        }
        self.state = next;
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(Snapshot {
            state: self.state,
            adapter: self.adapter.status(),
            retries: self.retries,
            buffered_bytes: self.buffer.len(),
        });
    }
}

enum TurnJob {
    Partial(TranscriptResult),
    Final(TranscriptResult),
}

/// Turns transcripts into conversation turns and observer events.
struct TurnWorker {
    stream_id: String,
    session_id: String,
    topic: String,
    voice: VoiceOptions,
    audio_out: Option<mpsc::Sender<Vec<u8>>>,
    services: PipelineServices,
    turns: Arc<AtomicUsize>,
}

impl TurnWorker {
    async fn run(self, mut jobs: mpsc::Receiver<TurnJob>, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.handle(job) => {}
            }
        }
    }

    async fn handle(&self, job: TurnJob) {
        match job {
            TurnJob::Partial(result) => self.publish_transcription(&result).await,
            TurnJob::Final(result) => self.handle_utterance(result).await,
        }
    }

    async fn publish_transcription(&self, result: &TranscriptResult) {
        let event = ServerEvent::Transcription(TranscriptionPayload {
            transcript: result.transcript.clone(),
            confidence: result.confidence,
            is_final: result.is_final,
            timestamp: now_millis(),
        });
        self.services.sink.publish(&self.topic, event).await;
    }

    async fn handle_utterance(&self, result: TranscriptResult) {
        let utterance = result.transcript.trim();
        if utterance.is_empty() {
            return;
        }
        let memory = &self.services.memory;

        self.publish_transcription(&result).await;
        let request = self.dialogue_request(utterance);
        if let Err(e) = memory.append_turn(&self.session_id, Speaker::User, utterance) {
            tracing::warn!(session_id = %self.session_id, error = %e, "user turn not recorded");
        }
        self.turns.fetch_add(1, Ordering::Relaxed);

        let reply = match self.services.dialogue.generate_reply(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    session_id = %self.session_id,
                    error = %e,
                    "dialogue engine failed, no reply for this turn"
                );
                return;
            }
        };

        if let Err(e) = memory.append_turn(&self.session_id, Speaker::Agent, reply.text.as_str()) {
            tracing::warn!(session_id = %self.session_id, error = %e, "agent turn not recorded");
        }
        if !reply.context.is_empty() {
            if let Err(e) = memory.merge_metadata(&self.session_id, reply.context.clone()) {
                tracing::warn!(session_id = %self.session_id, error = %e, "context update dropped");
            }
        }

        let audio = match self
            .services
            .synthesizer
            .synthesize(&reply.text, &self.voice)
            .await
        {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(stream_id = %self.stream_id, error = %e, "speech synthesis failed");
                Vec::new()
            }
        };

        if !audio.is_empty() {
            if let Some(out) = &self.audio_out {
                if out.try_send(audio.clone()).is_err() {
                    tracing::warn!(stream_id = %self.stream_id, "reply audio dropped, playback sink full or closed");
                }
            }
        }

        let event = ServerEvent::Response(ResponsePayload {
            text: reply.text,
            audio: base64::engine::general_purpose::STANDARD.encode(&audio),
            timestamp: now_millis(),
        });
        self.services.sink.publish(&self.topic, event).await;
    }

    /// Built from the context as it was before this utterance.
    fn dialogue_request(&self, utterance: &str) -> DialogueRequest {
        let (persona, metadata, history) = match self.services.memory.context(&self.session_id) {
            Ok(context) => (
                context.persona,
                context.metadata,
                context.history.into_iter().collect(),
            ),
            Err(_) => (String::new(), BTreeMap::new(), Vec::new()),
        };
        DialogueRequest {
            session_id: self.session_id.clone(),
            utterance: utterance.to_string(),
            persona,
            metadata,
            history,
        }
    }
}

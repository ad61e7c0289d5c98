use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::session::{
    self, Command, EndReason, PipelineServices, SessionInit, Snapshot, StreamOptions,
    StreamStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;
use voxline_memory::{ConversationStore, MemoryError};
use voxline_types::StreamSummary;

/// Registry bookkeeping for one running stream.
struct StreamEntry {
    session_id: String,
    /// Distinguishes this entry from a later stream reusing the same id.
    generation: Uuid,
    started_at: Instant,
    commands: mpsc::Sender<Command>,
    stop: Option<oneshot::Sender<EndReason>>,
    task: JoinHandle<Option<StreamSummary>>,
    snapshot: watch::Receiver<Snapshot>,
    turns: Arc<AtomicUsize>,
}

/// Process-wide map of running streams, keyed by stream id.
///
/// Uses `std::sync::Mutex`: every acquisition is a brief map operation that
/// never spans an `.await`. When both this lock and the conversation store
/// are needed, this one is taken first.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    streams: Arc<Mutex<HashMap<String, StreamEntry>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("stream registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Removes the stream (if this generation is still registered) and ends
    /// the session's conversation once no other stream shares it.
    pub(crate) fn release(
        &self,
        stream_id: &str,
        generation: Uuid,
        session_id: &str,
        memory: &ConversationStore,
    ) {
        let mut streams = self.lock();
        if streams
            .get(stream_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            streams.remove(stream_id);
        }
        if streams.values().any(|entry| entry.session_id == session_id) {
            return;
        }
        if let Err(e) = memory.end(session_id) {
            tracing::debug!(session_id, error = %e, "no conversation to end");
        }
    }
}

/// Entry point for running audio streams.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct StreamPipeline {
    settings: PipelineSettings,
    services: PipelineServices,
    registry: Registry,
}

impl StreamPipeline {
    pub fn new(settings: PipelineSettings, services: PipelineServices) -> Self {
        Self {
            settings,
            services,
            registry: Registry::default(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Starts a stream and returns once its transcription connection is up.
    ///
    /// The session's conversation context is created from
    /// `options.context` unless one already exists, in which case the
    /// stream joins it.
    pub async fn start_stream(
        &self,
        stream_id: &str,
        session_id: &str,
        options: StreamOptions,
    ) -> Result<(), PipelineError> {
        if stream_id.is_empty() || session_id.is_empty() {
            return Err(PipelineError::InvalidTransport(
                "stream id and session id are required".to_string(),
            ));
        }
        options
            .transcription
            .validate()
            .map_err(PipelineError::InvalidTransport)?;

        let (commands_tx, commands_rx) = mpsc::channel(self.settings.command_queue.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::starting());
        let generation = Uuid::new_v4();
        let started_at = Instant::now();
        let turns = Arc::new(AtomicUsize::new(0));

        let init = SessionInit {
            stream_id: stream_id.to_string(),
            session_id: session_id.to_string(),
            generation,
            started_at,
            settings: self.settings.clone(),
            services: self.services.clone(),
            registry: self.registry.clone(),
            transcription: options.transcription,
            voice: options.voice,
            audio_out: options.audio_out,
            snapshot: snapshot_tx,
            turns: turns.clone(),
        };

        {
            let mut streams = self.registry.lock();
            if streams.contains_key(stream_id) {
                return Err(PipelineError::AlreadyActive(stream_id.to_string()));
            }
            match self
                .services
                .memory
                .initialize(session_id, options.context)
            {
                Ok(()) => {}
                Err(MemoryError::AlreadyExists(_)) => {
                    tracing::debug!(session_id, "joining existing conversation");
                }
                Err(e) => tracing::warn!(session_id, error = %e, "conversation not initialized"),
            }
            // Spawned under the lock so a concurrent stop always finds the task.
            let task = tokio::spawn(session::launch(init, commands_rx, stop_rx, ready_tx));
            streams.insert(
                stream_id.to_string(),
                StreamEntry {
                    session_id: session_id.to_string(),
                    generation,
                    started_at,
                    commands: commands_tx,
                    stop: Some(stop_tx),
                    task,
                    snapshot: snapshot_rx,
                    turns,
                },
            );
        }

        tracing::info!(stream_id, session_id, "starting stream");

        ready_rx.await.unwrap_or_else(|_| {
            Err(PipelineError::AdapterUnavailable(
                "stream task ended while connecting".to_string(),
            ))
        })
    }

    /// Hands a chunk of audio to the stream.
    ///
    /// Fails with [`PipelineError::BufferOverflow`] when the chunk would take
    /// the stream's buffer past its cap; the stream is torn down in that
    /// case.
    pub async fn feed_audio(&self, stream_id: &str, chunk: Vec<u8>) -> Result<(), PipelineError> {
        let commands = self
            .registry
            .lock()
            .get(stream_id)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| PipelineError::NotFound(stream_id.to_string()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(Command::Audio { chunk, ack: ack_tx })
            .await
            .map_err(|_| PipelineError::NotFound(stream_id.to_string()))?;
        ack_rx
            .await
            .map_err(|_| PipelineError::NotFound(stream_id.to_string()))?
    }

    /// Stops a stream on request. See [`StreamPipeline::stop_stream_with`].
    pub async fn stop_stream(&self, stream_id: &str) -> Option<StreamSummary> {
        self.stop_stream_with(stream_id, EndReason::Completed).await
    }

    /// Stops a stream and waits for its teardown to finish.
    ///
    /// Returns `None` if no such stream is running. A stream that is still
    /// connecting is abandoned: its start fails, it never becomes active and
    /// no `stream_end` is published, so this also returns `None` once the
    /// task has released it. Calling this again for the same id is a no-op.
    pub async fn stop_stream_with(
        &self,
        stream_id: &str,
        reason: EndReason,
    ) -> Option<StreamSummary> {
        let entry = self.registry.lock().remove(stream_id)?;
        if let Some(stop) = entry.stop {
            let _ = stop.send(reason);
        }
        match entry.task.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(stream_id, error = %e, "stream task failed");
                None
            }
        }
    }

    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        let streams = self.registry.lock();
        let entry = streams.get(stream_id)?;
        let snapshot = *entry.snapshot.borrow();
        Some(StreamStatus {
            stream_id: stream_id.to_string(),
            session_id: entry.session_id.clone(),
            state: snapshot.state,
            adapter: snapshot.adapter,
            retries: snapshot.retries,
            buffered_bytes: snapshot.buffered_bytes,
            turn_count: entry.turns.load(Ordering::Relaxed),
            elapsed_ms: entry.started_at.elapsed().as_millis() as u64,
        })
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.registry.lock().keys().cloned().collect()
    }

    /// Removes conversations idle past the store's TTL whose session has no
    /// registered stream. Returns the removed session ids.
    ///
    /// Holds the registry lock for the sweep so a stream cannot join a
    /// conversation while it is being reaped.
    pub fn reap_orphaned(&self, now: DateTime<Utc>) -> Vec<String> {
        let streams = self.registry.lock();
        let live: HashSet<&str> = streams
            .values()
            .map(|entry| entry.session_id.as_str())
            .collect();
        self.services
            .memory
            .reap_idle(now, |session_id| live.contains(session_id))
    }

    /// Stops every running stream.
    pub async fn shutdown(&self) {
        let ids = self.stream_ids();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "stopping all streams");
        futures_util::future::join_all(
            ids.iter()
                .map(|id| self.stop_stream_with(id, EndReason::Shutdown)),
        )
        .await;
    }
}

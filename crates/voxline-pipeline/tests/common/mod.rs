#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voxline_memory::{ConversationStore, MemorySettings};
use voxline_pipeline::{
    EventSink, PipelineServices, PipelineSettings, StreamPipeline, StreamStatus,
};
use voxline_types::{ServerEvent, StreamState, TranscriptionConfig, VoiceOptions};
use voxline_voice::{
    AudioFrame, DialogueEngine, DialogueReply, DialogueRequest, SpeechSynthesizer,
    TranscriptResult, TranscriptionError, TranscriptionService, TranscriptionStream, VoiceError,
};

/// The test's end of one connection opened by [`FakeTranscription`].
pub struct FakeConnection {
    pub results: mpsc::Sender<Result<TranscriptResult, TranscriptionError>>,
    pub frames: mpsc::Receiver<AudioFrame>,
}

impl FakeConnection {
    pub async fn say_final(&self, text: &str) {
        self.results
            .send(Ok(TranscriptResult::final_result(text, 0.9)))
            .await
            .expect("session is listening");
    }

    pub async fn fail(&self, err: TranscriptionError) {
        self.results.send(Err(err)).await.expect("session is listening");
    }

    /// Frames the session has written so far.
    pub fn drain_frames(&mut self) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Transcription backend whose connection attempts follow a script.
///
/// Every successful open hands the test a [`FakeConnection`] through the
/// receiver returned by [`FakeTranscription::new`].
pub struct FakeTranscription {
    plan: Mutex<VecDeque<TranscriptionError>>,
    opens: AtomicUsize,
    frame_capacity: usize,
    connections: mpsc::UnboundedSender<FakeConnection>,
}

impl FakeTranscription {
    pub fn new(frame_capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            plan: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
            frame_capacity,
            connections: tx,
        });
        (service, rx)
    }

    /// The next open attempt fails with `err`.
    pub fn fail_next(&self, err: TranscriptionError) {
        self.plan.lock().unwrap().push_back(err);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionService for FakeTranscription {
    async fn open_stream(
        &self,
        _config: &TranscriptionConfig,
    ) -> Result<TranscriptionStream, TranscriptionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.plan.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (audio_tx, audio_rx) = mpsc::channel(self.frame_capacity);
        let (results_tx, results_rx) = mpsc::channel(16);
        let _ = self.connections.send(FakeConnection {
            results: results_tx,
            frames: audio_rx,
        });
        Ok(TranscriptionStream {
            audio: audio_tx,
            results: results_rx,
        })
    }
}

/// Replies from a fixed table, echoing anything it does not know.
/// Utterances listed in `failures` make the engine error.
#[derive(Default)]
pub struct ScriptedDialogue {
    pub replies: HashMap<String, String>,
    pub failures: Vec<String>,
    pub requests: Mutex<Vec<DialogueRequest>>,
    /// How long each reply takes.
    pub latency: Option<Duration>,
}

impl ScriptedDialogue {
    pub fn with_reply(mut self, utterance: &str, reply: &str) -> Self {
        self.replies.insert(utterance.to_string(), reply.to_string());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn failing_on(mut self, utterance: &str) -> Self {
        self.failures.push(utterance.to_string());
        self
    }

    pub fn requests(&self) -> Vec<DialogueRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogueEngine for ScriptedDialogue {
    async fn generate_reply(&self, request: &DialogueRequest) -> Result<DialogueReply, VoiceError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failures.contains(&request.utterance) {
            return Err(VoiceError::Dialogue("scripted failure".to_string()));
        }
        let text = self
            .replies
            .get(&request.utterance)
            .cloned()
            .unwrap_or_else(|| format!("echo: {}", request.utterance));
        Ok(DialogueReply {
            text,
            context: Default::default(),
        })
    }
}

/// "Synthesizes" the reply text as its UTF-8 bytes.
pub struct TextSynthesizer;

#[async_trait]
impl SpeechSynthesizer for TextSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        Ok(text.as_bytes().to_vec())
    }
}

/// Records every published event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, ServerEvent)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(String, ServerEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|(_, e)| e.kind()).collect()
    }

    /// Waits until at least `count` events have been published.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, ServerEvent)> {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let events = self.events();
                if events.len() >= count {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for events")
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, topic: &str, event: ServerEvent) {
        self.events.lock().unwrap().push((topic.to_string(), event));
    }
}

pub struct Harness {
    pub pipeline: StreamPipeline,
    pub transcription: Arc<FakeTranscription>,
    pub connections: mpsc::UnboundedReceiver<FakeConnection>,
    pub dialogue: Arc<ScriptedDialogue>,
    pub sink: Arc<RecordingSink>,
    pub memory: Arc<ConversationStore>,
}

impl Harness {
    pub async fn next_connection(&mut self) -> FakeConnection {
        tokio::time::timeout(Duration::from_secs(30), self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transcription service dropped")
    }

    /// Polls the stream's status until `check` holds or the stream is gone.
    pub async fn wait_status<F>(&self, stream_id: &str, check: F) -> Option<StreamStatus>
    where
        F: Fn(&StreamStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match self.pipeline.status(stream_id) {
                    Some(status) if check(&status) => return Some(status),
                    None => return None,
                    Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .expect("timed out waiting for stream status")
    }

    pub async fn wait_state(&self, stream_id: &str, state: StreamState) -> Option<StreamStatus> {
        self.wait_status(stream_id, |status| status.state == state).await
    }

    /// Waits until the stream has left the registry.
    pub async fn wait_gone(&self, stream_id: &str) {
        let status = self.wait_status(stream_id, |_| false).await;
        assert!(status.is_none());
    }
}

/// Small thresholds so tests can reason about individual bytes.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        flush_threshold_bytes: 4,
        buffer_cap_bytes: 64,
        hard_timeout_seconds: 300,
        keepalive_interval_ms: 5_000,
        retry_delay_ms: 100,
        max_retries: 3,
        command_queue: 16,
        publish_partials: true,
    }
}

pub fn harness(settings: PipelineSettings) -> Harness {
    harness_with(settings, ScriptedDialogue::default(), 32)
}

pub fn harness_with(
    settings: PipelineSettings,
    dialogue: ScriptedDialogue,
    frame_capacity: usize,
) -> Harness {
    let (transcription, connections) = FakeTranscription::new(frame_capacity);
    let dialogue = Arc::new(dialogue);
    let sink = Arc::new(RecordingSink::default());
    let memory = Arc::new(ConversationStore::new(MemorySettings::default()));
    let services = PipelineServices {
        transcription: transcription.clone(),
        synthesizer: Arc::new(TextSynthesizer),
        dialogue: dialogue.clone(),
        memory: memory.clone(),
        sink: sink.clone(),
    };
    Harness {
        pipeline: StreamPipeline::new(settings, services),
        transcription,
        connections,
        dialogue,
        sink,
        memory,
    }
}

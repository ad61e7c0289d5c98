//! Real-time stream pipeline.
//!
//! [`StreamPipeline`] owns every running audio stream. Each stream buffers
//! inbound audio, forwards it to a transcription connection, keeps that
//! connection alive and recovers it after transient failures, and turns
//! final transcripts into conversation turns, dialogue replies and
//! synthesized audio. Events for observers go to an [`EventSink`] on the
//! topic `voice_agent:<session_id>`.

pub mod adapter;
pub mod buffer;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod sink;

pub use adapter::AdapterStatus;
pub use config::PipelineSettings;
pub use error::PipelineError;
pub use pipeline::StreamPipeline;
pub use session::{EndReason, PipelineServices, StreamOptions, StreamStatus};
pub use sink::EventSink;

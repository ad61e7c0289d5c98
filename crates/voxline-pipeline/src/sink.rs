use async_trait::async_trait;
use voxline_types::ServerEvent;

/// Destination for events produced by running streams.
///
/// Publishing is best effort: a sink never reports failure back to the
/// stream that produced the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, event: ServerEvent);
}

use serde::Deserialize;
use std::time::Duration;

fn default_flush_threshold_bytes() -> usize {
    4096
}

fn default_buffer_cap_bytes() -> usize {
    1024 * 1024
}

fn default_hard_timeout_seconds() -> u64 {
    300
}

fn default_keepalive_interval_ms() -> u64 {
    5_000
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_command_queue() -> usize {
    64
}

fn default_publish_partials() -> bool {
    true
}

/// Stream pipeline tunables, deserialized from the `[pipeline]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Buffered bytes at which a slice is flushed to transcription.
    #[serde(default = "default_flush_threshold_bytes")]
    pub flush_threshold_bytes: usize,
    /// Hard ceiling on buffered audio; exceeding it is fatal.
    #[serde(default = "default_buffer_cap_bytes")]
    pub buffer_cap_bytes: usize,
    /// Maximum lifetime of a stream regardless of health.
    #[serde(default = "default_hard_timeout_seconds")]
    pub hard_timeout_seconds: u64,
    /// Idle period after which a keepalive frame is sent.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Base delay of the linear reconnect backoff.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Consecutive transcription failures tolerated before teardown.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Capacity of each session's inbound command queue.
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
    /// Whether partial transcripts are published to observers.
    #[serde(default = "default_publish_partials")]
    pub publish_partials: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: default_flush_threshold_bytes(),
            buffer_cap_bytes: default_buffer_cap_bytes(),
            hard_timeout_seconds: default_hard_timeout_seconds(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            command_queue: default_command_queue(),
            publish_partials: default_publish_partials(),
        }
    }
}

impl PipelineSettings {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_seconds)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Always at least one attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries.max(1)
    }
}

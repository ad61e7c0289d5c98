//! Error types for the conversation store.

/// Errors that can occur during conversation store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// A context for this session already exists and was not ended.
    #[error("conversation already exists: {0}")]
    AlreadyExists(String),

    /// No context exists for this session.
    #[error("conversation not found: {0}")]
    NotFound(String),
}

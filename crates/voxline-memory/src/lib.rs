//! Conversation memory for the voxline pipeline.
//!
//! Holds one [`ConversationContext`] per session: a persona descriptor,
//! opaque domain metadata (company, position, required skills, ...) and a
//! bounded, ordered turn history. The history never exceeds the store's
//! configured maximum; when it would, the oldest turn is evicted first.
//!
//! # Lifecycle
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`ConversationStore::initialize`] | creates a context, fails if one exists |
//! | [`ConversationStore::append_turn`] | appends a turn, trims FIFO to the cap |
//! | [`ConversationStore::end`] | removes the context and returns a summary |
//! | [`ConversationStore::reap_idle`] | removes orphaned contexts past the TTL |
//!
//! The store is an owned object shared by `Arc`; there is no process-wide
//! state.

mod context;
mod error;
mod store;

pub use context::{ContextSeed, ConversationContext, ConversationSummary};
pub use error::MemoryError;
pub use store::{ConversationStore, MemorySettings};

//! In-memory conversation store.
//!
//! Uses `std::sync::RwLock` intentionally: every lock acquisition is a brief
//! `HashMap` operation that never spans an `.await`, so a synchronous lock
//! is safe and cheaper than `tokio::sync::RwLock`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use voxline_types::{Speaker, Turn};

use crate::context::{ContextSeed, ConversationContext, ConversationSummary};
use crate::error::MemoryError;

/// Default maximum number of turns retained per conversation.
const DEFAULT_MAX_HISTORY: usize = 50;

/// Default idle time after which an orphaned context is reaped (24 hours).
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for a [`ConversationStore`].
#[derive(Debug, Clone, Copy)]
pub struct MemorySettings {
    /// Maximum turns kept per conversation (`H`). Values below 1 are
    /// treated as 1.
    pub max_history: usize,
    /// Idle time after which [`ConversationStore::reap_idle`] may remove a
    /// context.
    pub ttl: Duration,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Bounded, addressable conversation state keyed by session id.
#[derive(Debug, Default)]
pub struct ConversationStore {
    settings: MemorySettings,
    conversations: RwLock<HashMap<String, ConversationContext>>,
}

impl ConversationStore {
    pub fn new(settings: MemorySettings) -> Self {
        Self {
            settings,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> MemorySettings {
        self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConversationContext>> {
        match self.conversations.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("conversation store lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConversationContext>> {
        match self.conversations.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("conversation store lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Creates the context for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::AlreadyExists`] if a context exists and has not
    /// been ended.
    pub fn initialize(&self, session_id: &str, seed: ContextSeed) -> Result<(), MemoryError> {
        let mut conversations = self.write();
        if conversations.contains_key(session_id) {
            return Err(MemoryError::AlreadyExists(session_id.to_string()));
        }
        conversations.insert(
            session_id.to_string(),
            ConversationContext::new(session_id, seed, Utc::now()),
        );
        tracing::debug!(session_id, "conversation initialized");
        Ok(())
    }

    /// Appends a turn to the session's history, trimming the oldest turns
    /// so the history never exceeds the configured maximum.
    pub fn append_turn(
        &self,
        session_id: &str,
        speaker: Speaker,
        text: impl Into<String>,
    ) -> Result<(), MemoryError> {
        let max_history = self.settings.max_history.max(1);
        let mut conversations = self.write();
        let context = conversations
            .get_mut(session_id)
            .ok_or_else(|| MemoryError::NotFound(session_id.to_string()))?;
        context.push_turn(speaker, text.into(), Utc::now(), max_history);
        Ok(())
    }

    /// Merges metadata returned by the dialogue engine into the context.
    pub fn merge_metadata(
        &self,
        session_id: &str,
        updates: BTreeMap<String, String>,
    ) -> Result<(), MemoryError> {
        let mut conversations = self.write();
        let context = conversations
            .get_mut(session_id)
            .ok_or_else(|| MemoryError::NotFound(session_id.to_string()))?;
        context.metadata.extend(updates);
        Ok(())
    }

    /// Returns the session's history in arrival order.
    pub fn history(&self, session_id: &str) -> Result<Vec<Turn>, MemoryError> {
        self.read()
            .get(session_id)
            .map(|c| c.history.iter().cloned().collect())
            .ok_or_else(|| MemoryError::NotFound(session_id.to_string()))
    }

    /// Returns a copy of the session's full context.
    pub fn context(&self, session_id: &str) -> Result<ConversationContext, MemoryError> {
        self.read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| MemoryError::NotFound(session_id.to_string()))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Removes the context and returns its summary.
    pub fn end(&self, session_id: &str) -> Result<ConversationSummary, MemoryError> {
        let context = self
            .write()
            .remove(session_id)
            .ok_or_else(|| MemoryError::NotFound(session_id.to_string()))?;
        let summary = context.summarize(Utc::now());
        tracing::debug!(
            session_id,
            message_count = summary.message_count,
            "conversation ended"
        );
        Ok(summary)
    }

    /// Removes every context idle for longer than the TTL as of `now`,
    /// skipping any session for which `is_protected` returns true.
    ///
    /// Returns the ids of the removed sessions.
    pub fn reap_idle<F>(&self, now: DateTime<Utc>, is_protected: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let ttl = ChronoDuration::from_std(self.settings.ttl).unwrap_or(ChronoDuration::MAX);
        let mut conversations = self.write();
        let expired: Vec<String> = conversations
            .values()
            .filter(|c| now - c.last_interaction > ttl)
            .filter(|c| !is_protected(&c.session_id))
            .map(|c| c.session_id.clone())
            .collect();
        for session_id in &expired {
            conversations.remove(session_id);
        }
        expired
    }
}

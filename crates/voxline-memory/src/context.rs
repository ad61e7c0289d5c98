//! Conversation context and summary records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use voxline_types::{Speaker, Turn};

/// Caller-supplied data used to create a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSeed {
    /// Role or persona the agent plays, e.g. "technical recruiter".
    pub persona: String,
    /// Opaque domain metadata such as company, position, required skills.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Conversation state for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub persona: String,
    pub metadata: BTreeMap<String, String>,
    pub history: VecDeque<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
}

impl ConversationContext {
    pub(crate) fn new(session_id: &str, seed: ContextSeed, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            persona: seed.persona,
            metadata: seed.metadata,
            history: VecDeque::new(),
            created_at: now,
            last_interaction: now,
        }
    }

    /// Appends a turn, evicting from the front until `max_history` holds.
    pub(crate) fn push_turn(
        &mut self,
        speaker: Speaker,
        text: String,
        now: DateTime<Utc>,
        max_history: usize,
    ) {
        self.history.push_back(Turn {
            speaker,
            text,
            at: now,
        });
        while self.history.len() > max_history {
            self.history.pop_front();
        }
        self.last_interaction = now;
    }

    pub(crate) fn summarize(&self, now: DateTime<Utc>) -> ConversationSummary {
        let duration_ms = (now - self.created_at).num_milliseconds().max(0) as u64;
        ConversationSummary {
            session_id: self.session_id.clone(),
            message_count: self.history.len(),
            duration_ms,
            started_at: self.created_at,
            last_interaction: self.last_interaction,
        }
    }
}

/// Snapshot returned when a conversation ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub session_id: String,
    /// Turns retained in the history at the time of ending.
    pub message_count: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
}

//! Conversation isolation policy.
//!
//! Admissibility is a pure function of chunk metadata and the querying
//! [`ConversationScope`]. It knows nothing about the index that produced
//! the candidate, so it can be exercised without any vector backend.
//!
//! Under [`IsolationPolicy::Strict`] a chunk is admissible for conversation
//! `X` iff its resolved owner ([`DocumentChunk::owner`]) is `X`. There is no
//! fallback to recent or global chunks, and a scope without an id admits
//! nothing.

use serde::{Deserialize, Serialize};

use crate::models::DocumentChunk;

/// How far retrieval may reach across conversation boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPolicy {
    /// Only chunks owned by the querying conversation.
    #[default]
    Strict,
    /// Every live chunk. Operator tooling only; never used for chat queries.
    Unscoped,
}

impl std::fmt::Display for IsolationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationPolicy::Strict => f.write_str("strict"),
            IsolationPolicy::Unscoped => f.write_str("unscoped"),
        }
    }
}

/// The querying side of an admissibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationScope<'a> {
    conversation_id: Option<&'a str>,
    policy: IsolationPolicy,
}

impl<'a> ConversationScope<'a> {
    /// Build a scope. Empty ids are normalised to `None`.
    pub fn new(conversation_id: Option<&'a str>, policy: IsolationPolicy) -> Self {
        Self {
            conversation_id: conversation_id.filter(|id| !id.trim().is_empty()),
            policy,
        }
    }

    pub fn strict(conversation_id: &'a str) -> Self {
        Self::new(Some(conversation_id), IsolationPolicy::Strict)
    }

    pub fn conversation_id(&self) -> Option<&'a str> {
        self.conversation_id
    }

    pub fn policy(&self) -> IsolationPolicy {
        self.policy
    }

    /// True when no chunk can possibly be admitted, so callers may skip
    /// the search entirely.
    pub fn admits_nothing(&self) -> bool {
        self.policy == IsolationPolicy::Strict && self.conversation_id.is_none()
    }

    /// Decide whether `chunk` may be used as context for this scope.
    pub fn admits(&self, chunk: &DocumentChunk) -> bool {
        is_admissible(chunk, self)
    }
}

/// Admissibility rule shared by the selector and its tests.
pub fn is_admissible(chunk: &DocumentChunk, scope: &ConversationScope<'_>) -> bool {
    match scope.policy {
        IsolationPolicy::Unscoped => true,
        IsolationPolicy::Strict => match (scope.conversation_id, chunk.owner()) {
            (Some(current), Some(owner)) => current == owner,
            _ => false,
        },
    }
}

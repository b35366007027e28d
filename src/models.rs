//! Core data models for the fan vault orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

/// Verdict produced by the input guardrail for a single user turn.
/// Ephemeral: computed fresh per turn, never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailVerdict {
    Allow,
    BlockToken,
    BlockTeam,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

//
// ================= Vault =================
//

/// A prize pool tied to one club. Invariant: available_prize <= total_prize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub id: i64,
    /// Club code, e.g. "PSG".
    pub name: String,
    pub total_prize: f64,
    pub available_prize: f64,
    pub sponsor: Option<String>,
    /// Personality override: replaces the per-club persona when present.
    pub ai_prompt: Option<String>,
    pub sponsor_links: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

//
// ================= Conversation =================
//

/// One conversation per (user, vault) pair; created lazily on first chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub user_wallet: String,
    pub vault_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Persisted chat transcript entry. Append-only; never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub content: String,
    pub role: MessageRole,
    pub created_at: DateTime<Utc>,
}

//
// ================= Chat Turns =================
//

/// A single turn as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

//
// ================= Tool I/O =================
//

/// A tool invocation requested by the model within one orchestration run.
/// The id is opaque and only used to match results back to their call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Uuid,
    pub name: String,
    pub args: serde_json::Value,
}

/// Result of executing one tool call. Failures are carried as strings so a
/// single failing tool never aborts the orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: Uuid,
    pub name: String,
    pub content: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for GuardrailVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GuardrailVerdict::Allow => "ALLOW",
            GuardrailVerdict::BlockToken => "BLOCK_TOKEN",
            GuardrailVerdict::BlockTeam => "BLOCK_TEAM",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display_matches_wire_literals() {
        assert_eq!(GuardrailVerdict::Allow.to_string(), "ALLOW");
        assert_eq!(GuardrailVerdict::BlockToken.to_string(), "BLOCK_TOKEN");
        assert_eq!(GuardrailVerdict::BlockTeam.to_string(), "BLOCK_TEAM");
    }

    #[test]
    fn test_tool_call_ids_are_unique() {
        let a = ToolCall::new("get_token_balance", serde_json::json!({}));
        let b = ToolCall::new("get_token_balance", serde_json::json!({}));
        assert_ne!(a.id, b.id);
    }
}

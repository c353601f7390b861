//! Persisted record types: per-message records, processing states, the
//! existence index entry and the per-agent watermark.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::{
    AttachmentMeta, Classification, Decision, MailAction, ParsedEmail, SenderStatus, TopicMatch,
};

// ── Processing state ────────────────────────────────────────────────

/// Where a message is in the fetch → classify → decide → act pipeline.
///
/// States only move forward. `Error` can be entered from any non-terminal
/// state and is itself terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Fetched and saved, nothing decided yet.
    New,
    /// Category, topics and sender status recorded.
    Classified,
    /// Decision applied (or logged under dry-run).
    Actioned,
    /// Moved to trash.
    Deleted,
    /// Processing failed; left for an operator or a later retry policy.
    Error,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 5] = [
        Self::New,
        Self::Classified,
        Self::Actioned,
        Self::Deleted,
        Self::Error,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ProcessingState) -> bool {
        use ProcessingState::*;

        matches!(
            (self, target),
            (New, Classified) | (New, Actioned) | (New, Deleted) | (New, Error) |
            (Classified, Actioned) | (Classified, Deleted) | (Classified, Error) |
            (Actioned, Deleted)
        )
    }

    /// Terminal records are skipped by the normal pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Actioned | Self::Deleted | Self::Error)
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Classified => "classified",
            Self::Actioned => "actioned",
            Self::Deleted => "deleted",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

// ── Record ──────────────────────────────────────────────────────────

/// Everything known about one message. Never physically removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub hash: String,
    pub provider_id: String,
    pub message_id: Option<String>,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub body_excerpt: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    pub size: usize,
    pub age_days: Option<i64>,
    pub classification: Option<Classification>,
    pub topic_match: Option<TopicMatch>,
    pub sender_status: Option<SenderStatus>,
    pub decision: Option<Decision>,
    pub decision_reason: Option<String>,
    /// Action actually executed against the mailbox. `None` under dry-run.
    pub action: Option<MailAction>,
    #[serde(default)]
    pub calendar_event_ids: Vec<String>,
    pub state: ProcessingState,
    pub last_error: Option<String>,
    pub saved_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailRecord {
    /// Fresh record for a just-parsed message.
    pub fn from_parsed(email: &ParsedEmail) -> Self {
        let now = Utc::now();
        Self {
            hash: email.hash.clone(),
            provider_id: email.provider_id.clone(),
            message_id: email.message_id.clone(),
            subject: email.subject.clone(),
            from_address: email.from_address.clone(),
            from_name: email.from_name.clone(),
            to: email.to.clone(),
            date: email.date,
            body_excerpt: email.body_excerpt.clone(),
            attachments: email.attachments.clone(),
            size: email.size,
            age_days: email.age_days,
            classification: None,
            topic_match: None,
            sender_status: None,
            decision: None,
            decision_reason: None,
            action: None,
            calendar_event_ids: Vec::new(),
            state: ProcessingState::New,
            last_error: None,
            saved_at: now,
            updated_at: now,
        }
    }

    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            state: self.state,
            size: self.size as u64,
            has_attachments: !self.attachments.is_empty(),
        }
    }
}

/// Signals computed for a message before the decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationUpdate {
    pub classification: Classification,
    pub topic_match: TopicMatch,
    pub sender_status: SenderStatus,
}

/// Result of the decide/act step.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub decision: Decision,
    pub reason: String,
    pub action: Option<MailAction>,
    pub calendar_event_ids: Vec<String>,
}

// ── Index ───────────────────────────────────────────────────────────

/// Lightweight per-message summary kept in the index file, enough for
/// existence checks and stats without touching full records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub state: ProcessingState,
    pub size: u64,
    pub has_attachments: bool,
}

/// Aggregate counts over one agent's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub total_size: u64,
    pub with_attachments: usize,
}

impl StoreStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a IndexEntry>) -> Self {
        let mut stats = StoreStats::default();
        for entry in entries {
            stats.total += 1;
            *stats.by_state.entry(entry.state.to_string()).or_default() += 1;
            stats.total_size += entry.size;
            if entry.has_attachments {
                stats.with_attachments += 1;
            }
        }
        stats
    }

    pub fn count(&self, state: ProcessingState) -> usize {
        self.by_state.get(&state.to_string()).copied().unwrap_or(0)
    }
}

// ── Watermark ───────────────────────────────────────────────────────

/// Per-agent cursor: the newest message that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_date: DateTime<Utc>,
    pub last_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_allowed() {
        use ProcessingState::*;
        assert!(New.can_transition_to(Classified));
        assert!(Classified.can_transition_to(Actioned));
        assert!(Actioned.can_transition_to(Deleted));
        assert!(New.can_transition_to(Error));
        assert!(Classified.can_transition_to(Error));
    }

    #[test]
    fn backward_and_terminal_transitions_rejected() {
        use ProcessingState::*;
        assert!(!Classified.can_transition_to(New));
        assert!(!Actioned.can_transition_to(Classified));
        assert!(!Deleted.can_transition_to(Actioned));
        assert!(!Error.can_transition_to(New));
        assert!(!Error.can_transition_to(Actioned));
        assert!(!Actioned.can_transition_to(Error));
        assert!(!Deleted.can_transition_to(Error));
    }

    #[test]
    fn every_forward_transition_increases_rank() {
        for from in ProcessingState::ALL {
            for to in ProcessingState::ALL {
                if from.can_transition_to(to) {
                    assert!(to > from, "{from} -> {to} goes backward");
                }
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!ProcessingState::New.is_terminal());
        assert!(!ProcessingState::Classified.is_terminal());
        assert!(ProcessingState::Actioned.is_terminal());
        assert!(ProcessingState::Deleted.is_terminal());
        assert!(ProcessingState::Error.is_terminal());
    }

    #[test]
    fn stats_from_entries() {
        let entries = [
            IndexEntry {
                state: ProcessingState::Actioned,
                size: 100,
                has_attachments: true,
            },
            IndexEntry {
                state: ProcessingState::Actioned,
                size: 50,
                has_attachments: false,
            },
            IndexEntry {
                state: ProcessingState::Error,
                size: 10,
                has_attachments: false,
            },
        ];
        let stats = StoreStats::from_entries(entries.iter());
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(ProcessingState::Actioned), 2);
        assert_eq!(stats.count(ProcessingState::Error), 1);
        assert_eq!(stats.count(ProcessingState::Deleted), 0);
        assert_eq!(stats.total_size, 160);
        assert_eq!(stats.with_attachments, 1);
    }
}

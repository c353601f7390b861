//! Shared types for the triage pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Parsed email ────────────────────────────────────────────────────

/// Attachment metadata. Raw bytes are never kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
}

/// A message as the pipeline sees it, produced by the parser from the raw
/// bytes the mail collaborator returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEmail {
    /// Identifier the mail collaborator uses for actions (UID, file name).
    pub provider_id: String,
    /// Dedup hash, stable across fetches of the same message.
    pub hash: String,
    pub message_id: Option<String>,
    pub subject: String,
    /// Lowercased sender address.
    pub from_address: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    /// Plain-text excerpt of the body with quoted replies removed.
    pub body_excerpt: String,
    pub attachments: Vec<AttachmentMeta>,
    /// Size of the raw message in bytes.
    pub size: usize,
    /// Whole days between `date` and parse time, when the date is known.
    pub age_days: Option<i64>,
}

impl ParsedEmail {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Age used for policy decisions. Undated mail counts as brand new.
    pub fn age_days_or_zero(&self) -> i64 {
        self.age_days.unwrap_or(0).max(0)
    }

    /// Domain part of the sender address, if any.
    pub fn sender_domain(&self) -> Option<&str> {
        self.from_address.rsplit_once('@').map(|(_, d)| d)
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Mail category. Declaration order is the tie-break precedence: earlier
/// variants win equal scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Transactions,
    Feed,
    Promotions,
    Inbox,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Self::Transactions,
        Self::Feed,
        Self::Promotions,
        Self::Inbox,
    ];

    /// Map a free-form label (model output, CLI argument) to a category.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "transactions" | "transaction" => Some(Self::Transactions),
            "feed" | "feeds" | "newsletter" => Some(Self::Feed),
            "promotions" | "promotion" | "promo" | "promotional" => Some(Self::Promotions),
            "inbox" | "primary" => Some(Self::Inbox),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transactions => "transactions",
            Self::Feed => "feed",
            Self::Promotions => "promotions",
            Self::Inbox => "inbox",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// Which strategy produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Model,
    RuleBased,
    /// The model was configured but unusable for this message.
    RuleBasedFallback,
}

impl std::fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Model => "model",
            Self::RuleBased => "rule_based",
            Self::RuleBasedFallback => "rule_based_fallback",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub method: ClassificationMethod,
}

// ── Topic and sender signals ────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicMatch {
    pub matched: bool,
    pub matched_topics: Vec<String>,
    /// In `[0, 1]`.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderStatus {
    Whitelisted,
    Blacklisted,
    Neutral,
}

impl std::fmt::Display for SenderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Whitelisted => "whitelisted",
            Self::Blacklisted => "blacklisted",
            Self::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

// ── Decision ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Keep,
    /// Mark read and archive.
    Archive,
    /// Trash or label, depending on the agent's deletion policy.
    DeleteOrLabel,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Keep => "keep",
            Self::Archive => "archive",
            Self::DeleteOrLabel => "delete_or_label",
        };
        write!(f, "{s}")
    }
}

/// A decision plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
}

/// Concrete operation against the mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum MailAction {
    MarkReadAndArchive,
    MoveToTrash,
    ApplyLabel(String),
}

impl std::fmt::Display for MailAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MarkReadAndArchive => write!(f, "mark_read_and_archive"),
            Self::MoveToTrash => write!(f, "move_to_trash"),
            Self::ApplyLabel(label) => write!(f, "apply_label({label})"),
        }
    }
}

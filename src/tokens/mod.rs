//! Resource tokens: named, advisory, cross-process exclusive locks.
//!
//! Agents run in separate worker processes and share a handful of resources
//! that tolerate only one user at a time. Each resource is modelled as one
//! token backed by a lock file in a shared directory.

pub mod manager;

pub use manager::{TokenLease, TokenManager};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A shared resource guarded by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// The inference accelerator. Its handle is not reentrant.
    Inference,
    /// The mail-protocol connection.
    MailChannel,
    /// Calendar API quota.
    Calendar,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Inference, Self::MailChannel, Self::Calendar];

    /// File name of the lock backing this token.
    pub fn lock_file_name(&self) -> String {
        format!("{self}.lock")
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inference => "inference",
            Self::MailChannel => "mail_channel",
            Self::Calendar => "calendar",
        };
        write!(f, "{s}")
    }
}

/// Metadata the holder writes into the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Observed state of one token.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TokenStatus {
    Available,
    HeldBy {
        holder: String,
        acquired_at: Option<DateTime<Utc>>,
        /// Seconds since acquisition, when the holder's metadata is readable.
        age_secs: Option<i64>,
    },
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::HeldBy {
                holder,
                age_secs: Some(age),
                ..
            } => write!(f, "held by {holder} ({age}s)"),
            Self::HeldBy { holder, .. } => write!(f, "held by {holder}"),
        }
    }
}

/// Holder identity for one agent run: `<agent>:<pid>:<run id>`.
pub fn holder_id(agent: &str, run_id: Uuid) -> String {
    format!("{agent}:{}:{run_id}", std::process::id())
}

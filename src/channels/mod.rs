//! Mail collaborator abstraction.
//!
//! The runner only talks to a mailbox through [`MailClient`]: fetch raw
//! messages newer than the agent's watermark, then apply one action per
//! message. Protocol clients and their authentication live outside the core;
//! [`SpoolMailbox`] is a local directory implementation for development,
//! dry runs and tests.

pub mod spool;

pub use spool::SpoolMailbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;
use crate::store::Watermark;

pub use crate::pipeline::types::MailAction;

/// One fetched message, exactly as the provider returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Provider-native identifier used for follow-up actions.
    pub provider_id: String,
    pub bytes: Vec<u8>,
}

/// Bounds for one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFilters {
    pub limit: usize,
    pub unread_only: bool,
    /// Oldest message date to include when there is no watermark.
    pub since: Option<DateTime<Utc>>,
    /// Newest message date to include.
    pub until: Option<DateTime<Utc>>,
}

impl Default for FetchFilters {
    fn default() -> Self {
        Self {
            limit: 100,
            unread_only: true,
            since: None,
            until: None,
        }
    }
}

impl FetchFilters {
    /// Lower date bound: the watermark wins over `since` when present.
    pub fn lower_bound(&self, watermark: Option<&Watermark>) -> Option<DateTime<Utc>> {
        watermark.map(|w| w.last_date).or(self.since)
    }
}

#[async_trait]
pub trait MailClient: Send + Sync {
    /// Human-readable mailbox name for logs.
    fn name(&self) -> &str;

    /// Fetch messages at or after the watermark (or `filters.since`), oldest
    /// first, at most `filters.limit`.
    async fn fetch(
        &self,
        since: Option<&Watermark>,
        filters: &FetchFilters,
    ) -> Result<Vec<RawMessage>, MailError>;

    /// Apply `action` to one message.
    async fn perform_action(&self, provider_id: &str, action: &MailAction)
    -> Result<(), MailError>;
}

//! Calendar collaborator seams.
//!
//! Event extraction heuristics and the calendar API both live outside the
//! core. The runner only needs to ask for candidate events and create them
//! idempotently under a dedup key while holding the calendar token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CalendarError;
use crate::pipeline::types::ParsedEmail;

/// A calendar event proposed for a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub description: Option<String>,
}

#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Create `event`, returning its external id. Creating the same
    /// `dedup_key` twice must return the first event's id.
    async fn create_event(
        &self,
        event: &CalendarEvent,
        dedup_key: &str,
    ) -> Result<String, CalendarError>;
}

/// Finds events (meetings, deadlines, bookings) in a message.
pub trait EventExtractor: Send + Sync {
    fn extract(&self, email: &ParsedEmail) -> Vec<CalendarEvent>;
}

/// Dedup key for the `index`-th event of a message.
pub fn event_dedup_key(hash: &str, index: usize) -> String {
    format!("{hash}:{index}")
}

//! `EmailStore` trait: the per-agent persistence seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::store::record::{
    ActionOutcome, ClassificationUpdate, EmailRecord, ProcessingState, StoreStats, Watermark,
};

/// Durable, hash-keyed record store scoped to one agent.
#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Whether a record with this hash exists. Answered from the index.
    async fn exists(&self, hash: &str) -> bool;

    /// Current state of a record, from the index.
    async fn state_of(&self, hash: &str) -> Option<ProcessingState>;

    /// Load the full record.
    async fn load(&self, hash: &str) -> Result<Option<EmailRecord>, StorageError>;

    /// Insert or update a record. An existing record's state is never moved
    /// backward by a save.
    async fn save(&self, record: &EmailRecord, state: ProcessingState)
    -> Result<(), StorageError>;

    /// Attach classification signals; `new` records become `classified`.
    async fn update_classification(
        &self,
        hash: &str,
        update: ClassificationUpdate,
    ) -> Result<(), StorageError>;

    /// Move a record to `new_state`. Backward moves are rejected.
    async fn update_state(&self, hash: &str, new_state: ProcessingState)
    -> Result<(), StorageError>;

    /// Record the decision and executed action, and move to `state`.
    async fn record_outcome(
        &self,
        hash: &str,
        outcome: ActionOutcome,
        state: ProcessingState,
    ) -> Result<(), StorageError>;

    /// Move a non-terminal record to `error` with a reason.
    async fn mark_error(&self, hash: &str, reason: &str) -> Result<(), StorageError>;

    async fn stats(&self) -> StoreStats;

    async fn watermark(&self) -> Option<Watermark>;

    /// Move the watermark to `(date, hash)` if `date` is newer than the
    /// current one. Returns whether it moved.
    async fn advance_watermark(
        &self,
        date: DateTime<Utc>,
        hash: &str,
    ) -> Result<bool, StorageError>;
}

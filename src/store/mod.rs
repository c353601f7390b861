//! Email state store: durable per-agent records, the existence index and the
//! watermark.

pub mod file_store;
pub mod record;
pub mod traits;

pub use file_store::FileEmailStore;
pub use record::{
    ActionOutcome, ClassificationUpdate, EmailRecord, IndexEntry, ProcessingState, StoreStats,
    Watermark,
};
pub use traits::EmailStore;

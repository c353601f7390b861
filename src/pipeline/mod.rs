//! Per-message decision pipeline.
//!
//! Every fetched message flows through:
//! 1. `parser::parse_message()`: raw bytes to [`ParsedEmail`](types::ParsedEmail)
//! 2. `classifier::Classifier::classify()`: model or rules, never fails
//! 3. `topics::TopicMatcher` and `senders::SenderManager`: relevance and reputation
//! 4. `decision::decide()`: pure keep / archive / delete-or-label
//!
//! Nothing in here touches the mailbox or the store.

pub mod classifier;
pub mod decision;
pub mod parser;
pub mod rules;
pub mod senders;
pub mod topics;
pub mod types;

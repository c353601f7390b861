//! Mailwarden: scheduled mail triage for independently configured agents.

pub mod calendar;
pub mod channels;
pub mod config;
pub mod error;
pub mod inference;
pub mod pipeline;
pub mod store;
pub mod tokens;
pub mod worker;

//! Error types for mailwarden.

use std::path::PathBuf;
use std::time::Duration;

use crate::tokens::ResourceKind;

/// Configuration-related errors. Fatal to the run that hit them.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Agent {0} has no configuration file")]
    UnknownAgent(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Duplicate agent name {name} in {path}")]
    DuplicateAgent { name: String, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource token errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Resource {kind} busy, not acquired within {waited:?}")]
    Timeout { kind: ResourceKind, waited: Duration },

    #[error("Lock file {path} unusable: {reason}")]
    LockFile { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Email state store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Corrupt store file {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("Record {hash} not found")]
    NotFound { hash: String },

    #[error("Record {hash} is {from}, cannot move to {to}")]
    InvalidTransition {
        hash: String,
        from: String,
        to: String,
    },

    #[error("Invalid namespace {0:?}")]
    InvalidNamespace(String),

    #[error("Invalid record key {0:?}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mail collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Message {id} not found in mailbox")]
    MessageNotFound { id: String },

    #[error("Action {action} failed for {id}: {reason}")]
    ActionFailed {
        id: String,
        action: String,
        reason: String,
    },

    #[error("Unparseable message {id}")]
    Unparseable { id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inference collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference request failed: {0}")]
    RequestFailed(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid inference response: {0}")]
    InvalidResponse(String),
}

/// Calendar collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Event creation failed: {0}")]
    CreateFailed(String),

    #[error("Calendar quota exhausted")]
    QuotaExhausted,
}

/// Any failure of an external collaborator. Recoverable per message.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Mail: {0}")]
    Mail(#[from] MailError),

    #[error("Inference: {0}")]
    Inference(#[from] InferenceError),

    #[error("Calendar: {0}")]
    Calendar(#[from] CalendarError),
}

/// Run-level failures for a single agent.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Resource busy, skipping cycle: {0}")]
    ResourceTimeout(#[source] TokenError),

    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage: {0}")]
    Storage(#[from] StorageError),

    #[error("Collaborator: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Token: {0}")]
    Token(TokenError),

    #[error("Agent {agent} found its resources busy, skipping cycle")]
    Busy { agent: String },

    #[error("Worker for agent {agent} failed: {reason}")]
    Worker { agent: String, reason: String },
}

impl From<TokenError> for RunError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Timeout { .. } => RunError::ResourceTimeout(e),
            other => RunError::Token(other),
        }
    }
}

impl From<MailError> for RunError {
    fn from(e: MailError) -> Self {
        RunError::Collaborator(e.into())
    }
}

impl RunError {
    /// Whether the next scheduling cycle can simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ResourceTimeout(_) | Self::Busy { .. } | Self::Collaborator(_)
        )
    }
}

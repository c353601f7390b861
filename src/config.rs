//! Configuration types.
//!
//! Each agent is described by one YAML file in the config directory. Every
//! section rejects unknown keys so a typo fails loudly at load time instead of
//! silently falling back to a default.
//!
//! Orchestrator-wide knobs (token timeouts, scheduler sleep cap) come from the
//! environment via [`OrchestratorConfig::from_env`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

// ── Agent file ──────────────────────────────────────────────────────

/// Full configuration of one agent, as read from `<config_dir>/<name>.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentSection,
    #[serde(default)]
    pub email: EmailSection,
    #[serde(default)]
    pub classification: ClassificationSection,
    #[serde(default)]
    pub deletion: DeletionSection,
    #[serde(default)]
    pub calendar: CalendarSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    /// Unique agent name. Also the store namespace, so it must be a plain
    /// path component.
    pub name: String,
    #[serde(default = "default_interval")]
    pub schedule_interval_minutes: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Mail collaborator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailSection {
    /// Spool directory used by the local mailbox adapter. Defaults to
    /// `<data_dir>/<agent>/mailbox` when unset.
    #[serde(default)]
    pub mailbox_dir: Option<PathBuf>,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default = "default_true")]
    pub unread_only: bool,
    #[serde(default = "default_since_days")]
    pub since_days: u32,
}

impl Default for EmailSection {
    fn default() -> Self {
        Self {
            mailbox_dir: None,
            fetch_limit: default_fetch_limit(),
            unread_only: true,
            since_days: default_since_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationSection {
    #[serde(default)]
    pub topics_of_interest: Vec<String>,
    #[serde(default)]
    pub whitelisted_senders: Vec<String>,
    #[serde(default)]
    pub blacklisted_senders: Vec<String>,
    #[serde(default)]
    pub use_ai_model: bool,
    /// Model results below this confidence are replaced by the rule-based
    /// result.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub inference_endpoint: Option<String>,
    #[serde(default = "default_inference_timeout")]
    pub inference_timeout_secs: u64,
}

impl Default for ClassificationSection {
    fn default() -> Self {
        Self {
            topics_of_interest: Vec::new(),
            whitelisted_senders: Vec::new(),
            blacklisted_senders: Vec::new(),
            use_ai_model: false,
            confidence_threshold: default_confidence_threshold(),
            inference_endpoint: None,
            inference_timeout_secs: default_inference_timeout(),
        }
    }
}

/// What `delete_or_label` turns into against the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionAction {
    #[default]
    MoveToTrash,
    ApplyLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeletionSection {
    #[serde(default)]
    pub action_on_deletion: DeletionAction,
    #[serde(default = "default_true")]
    pub delete_promotional: bool,
    #[serde(default = "default_age_threshold")]
    pub age_threshold_days: u32,
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for DeletionSection {
    fn default() -> Self {
        Self {
            action_on_deletion: DeletionAction::MoveToTrash,
            delete_promotional: true,
            age_threshold_days: default_age_threshold(),
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalendarSection {
    #[serde(default)]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    60
}
fn default_fetch_limit() -> usize {
    100
}
fn default_since_days() -> u32 {
    7
}
fn default_confidence_threshold() -> f64 {
    0.5
}
fn default_inference_timeout() -> u64 {
    10
}
fn default_age_threshold() -> u32 {
    30
}

impl AgentConfig {
    /// An agent with every other setting at its default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            agent: AgentSection {
                name: name.into(),
                schedule_interval_minutes: default_interval(),
                enabled: true,
            },
            email: EmailSection::default(),
            classification: ClassificationSection::default(),
            deletion: DeletionSection::default(),
            calendar: CalendarSection::default(),
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(source: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(source).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate one agent file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml(&source, path)
    }

    pub fn name(&self) -> &str {
        &self.agent.name
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.agent.schedule_interval_minutes * 60)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.classification.inference_timeout_secs)
    }

    /// Check every constraint serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_name(&self.agent.name)?;

        if self.agent.schedule_interval_minutes < 1 {
            return Err(invalid(
                "agent.schedule_interval_minutes",
                "must be at least 1",
            ));
        }
        if self.email.fetch_limit < 1 {
            return Err(invalid("email.fetch_limit", "must be at least 1"));
        }
        let threshold = self.classification.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "classification.confidence_threshold",
                &format!("{threshold} is outside [0, 1]"),
            ));
        }
        if self.classification.inference_timeout_secs < 1 {
            return Err(invalid(
                "classification.inference_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Agent names double as directory names, so only `[A-Za-z0-9_-]` is allowed.
pub fn validate_agent_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(invalid("agent.name", "must not be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(
            "agent.name",
            &format!("{name:?} may only contain letters, digits, '-' and '_'"),
        ));
    }
    Ok(())
}

// ── Config directory ────────────────────────────────────────────────

/// Whether a directory entry looks like an agent file.
fn is_agent_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Load every agent file in `dir`, sorted by file name.
///
/// A single malformed file fails the whole load; duplicate names are rejected.
pub fn load_agent_dir(dir: &Path) -> Result<Vec<AgentConfig>, ConfigError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_agent_file(p))
        .collect();
    paths.sort();

    let mut seen = HashSet::new();
    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        let config = AgentConfig::load(&path)?;
        if !seen.insert(config.agent.name.clone()) {
            return Err(ConfigError::DuplicateAgent {
                name: config.agent.name,
                path,
            });
        }
        debug!(agent = %config.agent.name, path = %path.display(), "Loaded agent config");
        configs.push(config);
    }

    if configs.is_empty() {
        warn!(dir = %dir.display(), "No agent configuration files found");
    }
    Ok(configs)
}

/// Re-read the configuration of a single agent by name.
///
/// Looks for `<dir>/<name>.yaml` / `.yml` first, then scans the directory for
/// a file whose `agent.name` matches.
pub fn reload_agent(dir: &Path, name: &str) -> Result<AgentConfig, ConfigError> {
    validate_agent_name(name)?;
    for ext in ["yaml", "yml"] {
        let path = dir.join(format!("{name}.{ext}"));
        if path.is_file() {
            let config = AgentConfig::load(&path)?;
            if config.agent.name == name {
                return Ok(config);
            }
        }
    }
    load_agent_dir(dir)?
        .into_iter()
        .find(|c| c.agent.name == name)
        .ok_or_else(|| ConfigError::UnknownAgent(name.to_string()))
}

// ── Orchestrator ────────────────────────────────────────────────────

/// Process-wide settings shared by every agent run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// How long a run waits for a resource token before skipping the cycle.
    pub token_timeout: Duration,
    /// Age after which a held token is considered abandoned.
    pub stale_lock_after: Duration,
    pub token_poll_interval: Duration,
    /// Upper bound on one scheduler sleep, so config edits are noticed.
    pub max_sleep: Duration,
}

impl OrchestratorConfig {
    /// Build from paths plus `MAILWARDEN_*` environment variables.
    pub fn from_env(config_dir: PathBuf, data_dir: PathBuf, lock_dir: Option<PathBuf>) -> Self {
        let token_timeout_secs: u64 = std::env::var("MAILWARDEN_TOKEN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let stale_lock_secs: u64 = std::env::var("MAILWARDEN_STALE_LOCK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600);

        let poll_ms: u64 = std::env::var("MAILWARDEN_TOKEN_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(250);

        let max_sleep_secs: u64 = std::env::var("MAILWARDEN_MAX_SLEEP_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(60);

        let lock_dir = lock_dir.unwrap_or_else(|| data_dir.join("locks"));

        Self {
            config_dir,
            data_dir,
            lock_dir,
            token_timeout: Duration::from_secs(token_timeout_secs),
            stale_lock_after: Duration::from_secs(stale_lock_secs),
            token_poll_interval: Duration::from_millis(poll_ms),
            max_sleep: Duration::from_secs(max_sleep_secs),
        }
    }
}

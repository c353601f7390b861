//! Agent runner: one pass of one agent's pipeline.
//!
//! acquire tokens → fetch → dedup → classify → decide → act → persist →
//! release. Per-message failures are recorded as `error` and the batch moves
//! on; only token timeouts, fetch failures and storage failures end a run
//! early. Tokens are held as leases, so every exit path releases them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::calendar::{CalendarClient, EventExtractor, event_dedup_key};
use crate::channels::{FetchFilters, MailAction, MailClient, RawMessage, SpoolMailbox};
use crate::config::{AgentConfig, OrchestratorConfig};
use crate::error::{CollaboratorError, RunError, StorageError};
use crate::inference::{HttpInference, InferenceClient};
use crate::pipeline::classifier::{Classifier, build_classifier};
use crate::pipeline::decision::{decide, mail_action_for};
use crate::pipeline::parser::{parse_message, unparseable_placeholder};
use crate::pipeline::senders::SenderManager;
use crate::pipeline::topics::TopicMatcher;
use crate::pipeline::types::{Category, Decision, ParsedEmail};
use crate::store::{
    ActionOutcome, ClassificationUpdate, EmailRecord, EmailStore, FileEmailStore,
    ProcessingState,
};
use crate::tokens::{ResourceKind, TokenLease, TokenManager, holder_id};
use crate::worker::shutdown::Shutdown;
use crate::worker::state::{RunContext, RunPhase};

/// Label applied by historical reprocessing.
pub const HISTORICAL_LABEL: &str = "MarkedForDeletion";

/// Default wait for a resource token.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(300);

// ── Summaries ───────────────────────────────────────────────────────

/// Counts for one completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub agent: String,
    pub fetched: usize,
    pub kept: usize,
    pub archived: usize,
    pub deleted_or_labeled: usize,
    pub errors: usize,
    /// Already terminal from an earlier run.
    pub skipped: usize,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn new(agent: &str, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            agent: agent.to_string(),
            fetched: 0,
            kept: 0,
            archived: 0,
            deleted_or_labeled: 0,
            errors: 0,
            skipped: 0,
            dry_run,
            started_at: now,
            finished_at: now,
        }
    }

    fn count(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Decided(Decision::Keep) => self.kept += 1,
            MessageOutcome::Decided(Decision::Archive) => self.archived += 1,
            MessageOutcome::Decided(Decision::DeleteOrLabel) => self.deleted_or_labeled += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::Failed => self.errors += 1,
        }
    }

    /// Messages that ended this run in a recorded state.
    pub fn accounted(&self) -> usize {
        self.kept + self.archived + self.deleted_or_labeled + self.errors + self.skipped
    }
}

/// Counts for a historical reprocessing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalSummary {
    pub agent: String,
    pub fetched: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub labeled: usize,
    pub whitelisted: usize,
    pub errors: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Decided(Decision),
    Skipped,
    Failed,
}

// ── Runner ──────────────────────────────────────────────────────────

/// Calendar collaborator plus the extractor that feeds it.
#[derive(Clone)]
pub struct CalendarDeps {
    pub client: Arc<dyn CalendarClient>,
    pub extractor: Arc<dyn EventExtractor>,
}

/// Collaborators a runner needs.
pub struct RunnerDeps {
    pub store: Arc<dyn EmailStore>,
    pub mail: Arc<dyn MailClient>,
    pub tokens: Arc<TokenManager>,
    pub inference: Option<Arc<dyn InferenceClient>>,
    pub calendar: Option<CalendarDeps>,
}

pub struct AgentRunner {
    config: AgentConfig,
    store: Arc<dyn EmailStore>,
    mail: Arc<dyn MailClient>,
    tokens: Arc<TokenManager>,
    classifier: Arc<dyn Classifier>,
    topics: TopicMatcher,
    senders: SenderManager,
    calendar: Option<CalendarDeps>,
    token_timeout: Duration,
    shutdown: Shutdown,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, deps: RunnerDeps) -> Self {
        let classifier = build_classifier(&config.classification, deps.inference);
        let topics = TopicMatcher::new(&config.classification.topics_of_interest);
        let senders = SenderManager::new(
            &config.classification.whitelisted_senders,
            &config.classification.blacklisted_senders,
        );
        Self {
            config,
            store: deps.store,
            mail: deps.mail,
            tokens: deps.tokens,
            classifier,
            topics,
            senders,
            calendar: deps.calendar,
            token_timeout: DEFAULT_TOKEN_TIMEOUT,
            shutdown: Shutdown::new(),
        }
    }

    /// Wire a runner from configuration: file store under the data dir,
    /// spool mailbox, HTTP inference when the model strategy is on.
    pub async fn open(
        config: AgentConfig,
        settings: &OrchestratorConfig,
        tokens: Arc<TokenManager>,
    ) -> Result<Self, RunError> {
        let name = config.name().to_string();
        let store = FileEmailStore::open(&settings.data_dir, &name).await?;

        let mailbox_dir = config
            .email
            .mailbox_dir
            .clone()
            .unwrap_or_else(|| settings.data_dir.join(&name).join("mailbox"));
        let mail = SpoolMailbox::open(name.clone(), mailbox_dir).await?;

        let inference: Option<Arc<dyn InferenceClient>> = match (
            config.classification.use_ai_model,
            &config.classification.inference_endpoint,
        ) {
            (true, Some(endpoint)) => {
                let client = HttpInference::new(endpoint.clone(), config.inference_timeout())
                    .map_err(CollaboratorError::from)?;
                debug!(agent = %name, endpoint = %client.endpoint(), "Model classification enabled");
                Some(Arc::new(client))
            }
            _ => None,
        };

        let runner = Self::new(
            config,
            RunnerDeps {
                store: Arc::new(store),
                mail: Arc::new(mail),
                tokens,
                inference,
                calendar: None,
            },
        );
        Ok(runner.with_token_timeout(settings.token_timeout))
    }

    pub fn with_token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn store(&self) -> &Arc<dyn EmailStore> {
        &self.store
    }

    /// Run one pass over the agent's new mail.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let mut ctx = RunContext::new(self.name());
        let holder = holder_id(self.name(), ctx.run_id);
        let mut summary = RunSummary::new(self.name(), self.config.deletion.dry_run);

        info!(
            agent = %self.name(),
            run_id = %ctx.run_id,
            dry_run = summary.dry_run,
            "Run started"
        );

        let result = self.run_inner(&mut ctx, &holder, &mut summary).await;
        // Leases are gone by now; this only catches tokens taken outside them.
        self.tokens.release_all(&holder);
        summary.finished_at = Utc::now();

        match result {
            Ok(()) => {
                ctx.finish();
                info!(
                    agent = %self.name(),
                    fetched = summary.fetched,
                    kept = summary.kept,
                    archived = summary.archived,
                    deleted_or_labeled = summary.deleted_or_labeled,
                    errors = summary.errors,
                    skipped = summary.skipped,
                    "Run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                ctx.fail(e.to_string());
                if e.is_transient() {
                    warn!(agent = %self.name(), error = %e, "Run skipped");
                } else {
                    error!(
                        agent = %self.name(),
                        error = %e,
                        processed = summary.accounted(),
                        "Run aborted"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        ctx: &mut RunContext,
        holder: &str,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        set_phase(ctx, RunPhase::AcquiringResources);
        let _mail_lease = self
            .tokens
            .lease(ResourceKind::MailChannel, holder, self.token_timeout)
            .await?;
        let _inference_lease = if self.classifier.uses_inference() {
            Some(
                self.tokens
                    .lease(ResourceKind::Inference, holder, self.token_timeout)
                    .await?,
            )
        } else {
            None
        };
        let calendar_lease = self.calendar_lease(holder).await;
        let calendar = calendar_lease.as_ref().and(self.calendar.as_ref());

        set_phase(ctx, RunPhase::Fetching);
        let watermark = self.store.watermark().await;
        let filters = FetchFilters {
            limit: self.config.email.fetch_limit,
            unread_only: self.config.email.unread_only,
            since: Some(Utc::now() - chrono::Duration::days(i64::from(self.config.email.since_days))),
            until: None,
        };
        let messages = self.mail.fetch(watermark.as_ref(), &filters).await?;
        summary.fetched = messages.len();
        debug!(agent = %self.name(), fetched = messages.len(), "Fetched batch");

        let now = Utc::now();
        for raw in &messages {
            if self.shutdown.is_triggered() {
                info!(
                    agent = %self.name(),
                    remaining = summary.fetched - summary.accounted(),
                    "Shutdown requested, stopping before next message"
                );
                break;
            }
            set_phase(ctx, RunPhase::Processing);

            match self.process_message(ctx, raw, now, calendar).await {
                Ok(outcome) => summary.count(outcome),
                Err(StorageError::InvalidTransition { hash, from, to }) => {
                    warn!(
                        agent = %self.name(),
                        %hash,
                        %from,
                        %to,
                        "Record changed underneath the run, leaving it as is"
                    );
                    summary.errors += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Calendar token, if events are enabled and a calendar is wired.
    /// A busy calendar only disables events for this run.
    async fn calendar_lease(&self, holder: &str) -> Option<TokenLease> {
        if !self.config.calendar.enabled {
            return None;
        }
        if self.calendar.is_none() {
            debug!(agent = %self.name(), "Calendar enabled but no calendar client wired");
            return None;
        }
        match self
            .tokens
            .lease(ResourceKind::Calendar, holder, self.token_timeout)
            .await
        {
            Ok(lease) => Some(lease),
            Err(e) => {
                warn!(agent = %self.name(), error = %e, "Calendar unavailable, skipping events");
                None
            }
        }
    }

    async fn process_message(
        &self,
        ctx: &mut RunContext,
        raw: &RawMessage,
        now: DateTime<Utc>,
        calendar: Option<&CalendarDeps>,
    ) -> Result<MessageOutcome, StorageError> {
        let email = match parse_message(&raw.provider_id, &raw.bytes, now) {
            Ok(email) => email,
            Err(e) => {
                let placeholder = unparseable_placeholder(&raw.provider_id, &raw.bytes);
                if self.is_terminal(&placeholder.hash).await {
                    return Ok(MessageOutcome::Skipped);
                }
                warn!(agent = %self.name(), provider_id = %raw.provider_id, error = %e, "Unparseable message");
                self.store
                    .save(&EmailRecord::from_parsed(&placeholder), ProcessingState::New)
                    .await?;
                self.store.mark_error(&placeholder.hash, &e.to_string()).await?;
                return Ok(MessageOutcome::Failed);
            }
        };

        if self.is_terminal(&email.hash).await {
            debug!(agent = %self.name(), hash = %email.hash, "Already processed, skipping");
            self.advance_watermark(&email, now).await?;
            return Ok(MessageOutcome::Skipped);
        }

        self.store
            .save(&EmailRecord::from_parsed(&email), ProcessingState::New)
            .await?;
        // A record that got ahead of its index entry before a crash is
        // recovered by the save and may already be finished.
        if self.is_terminal(&email.hash).await {
            debug!(agent = %self.name(), hash = %email.hash, "Recovered finished record, skipping");
            self.advance_watermark(&email, now).await?;
            return Ok(MessageOutcome::Skipped);
        }

        let classification = self.classifier.classify(&email).await;
        let topic_match = self.topics.match_email(&email);
        let sender_status = self.senders.status(&email.from_address);
        self.store
            .update_classification(
                &email.hash,
                ClassificationUpdate {
                    classification: classification.clone(),
                    topic_match: topic_match.clone(),
                    sender_status,
                },
            )
            .await?;

        let verdict = decide(
            &classification,
            &topic_match,
            sender_status,
            email.age_days_or_zero(),
            &self.config.deletion,
        );
        let action = mail_action_for(verdict.decision, &self.config.deletion);
        debug!(
            agent = %self.name(),
            hash = %email.hash,
            category = %classification.category,
            method = %classification.method,
            sender = %sender_status,
            decision = %verdict.decision,
            reason = %verdict.reason,
            "Decided"
        );

        set_phase(ctx, RunPhase::Acting);
        let dry_run = self.config.deletion.dry_run;
        let (executed, state) = match action {
            None => (None, ProcessingState::Actioned),
            Some(action) if dry_run => {
                info!(
                    agent = %self.name(),
                    hash = %email.hash,
                    subject = %email.subject,
                    %action,
                    reason = %verdict.reason,
                    "Dry run, action not executed"
                );
                (None, ProcessingState::Actioned)
            }
            Some(action) => match self.mail.perform_action(&email.provider_id, &action).await {
                Ok(()) => {
                    let state = if action == MailAction::MoveToTrash {
                        ProcessingState::Deleted
                    } else {
                        ProcessingState::Actioned
                    };
                    (Some(action), state)
                }
                Err(e) => {
                    warn!(
                        agent = %self.name(),
                        hash = %email.hash,
                        %action,
                        error = %e,
                        "Mail action failed"
                    );
                    self.store.mark_error(&email.hash, &e.to_string()).await?;
                    self.advance_watermark(&email, now).await?;
                    return Ok(MessageOutcome::Failed);
                }
            },
        };

        let calendar_event_ids = match calendar {
            Some(calendar) if !dry_run => self.create_events(calendar, &email).await,
            _ => Vec::new(),
        };

        self.store
            .record_outcome(
                &email.hash,
                ActionOutcome {
                    decision: verdict.decision,
                    reason: verdict.reason,
                    action: executed,
                    calendar_event_ids,
                },
                state,
            )
            .await?;
        self.advance_watermark(&email, now).await?;

        Ok(MessageOutcome::Decided(verdict.decision))
    }

    async fn create_events(&self, calendar: &CalendarDeps, email: &ParsedEmail) -> Vec<String> {
        let mut ids = Vec::new();
        for (index, event) in calendar.extractor.extract(email).iter().enumerate() {
            let key = event_dedup_key(&email.hash, index);
            match calendar.client.create_event(event, &key).await {
                Ok(id) => {
                    debug!(agent = %self.name(), hash = %email.hash, event_id = %id, "Calendar event created");
                    ids.push(id);
                }
                Err(e) => {
                    warn!(agent = %self.name(), hash = %email.hash, error = %e, "Calendar event failed");
                }
            }
        }
        ids
    }

    async fn is_terminal(&self, hash: &str) -> bool {
        self.store
            .state_of(hash)
            .await
            .is_some_and(|state| state.is_terminal())
    }

    /// Dates come from the sender. One later than the batch time never
    /// moves the watermark, or every message arriving before that date
    /// would fall under it.
    async fn advance_watermark(
        &self,
        email: &ParsedEmail,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        match email.date {
            Some(date) if date <= now => {
                self.store.advance_watermark(date, &email.hash).await?;
            }
            Some(date) => {
                debug!(agent = %self.name(), hash = %email.hash, %date, "Future-dated message, watermark unchanged");
            }
            None => {}
        }
        Ok(())
    }

    // ── Historical mode ─────────────────────────────────────────────

    /// Reclassify every message in `[start, end]`, ignoring the watermark
    /// and dedup state, and label non-whitelisted mail whose category is in
    /// `targets` (all categories when empty). The store is not touched.
    pub async fn run_historical(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        targets: &[Category],
    ) -> Result<HistoricalSummary, RunError> {
        let mut ctx = RunContext::new(self.name());
        let holder = holder_id(self.name(), ctx.run_id);
        let dry_run = self.config.deletion.dry_run;
        let mut summary = HistoricalSummary {
            agent: self.name().to_string(),
            fetched: 0,
            by_category: BTreeMap::new(),
            labeled: 0,
            whitelisted: 0,
            errors: 0,
            dry_run,
        };

        info!(agent = %self.name(), %start, %end, ?targets, dry_run, "Historical run started");
        let result = self
            .historical_inner(&mut ctx, &holder, start, end, targets, &mut summary)
            .await;
        self.tokens.release_all(&holder);

        match result {
            Ok(()) => {
                ctx.finish();
                info!(
                    agent = %self.name(),
                    fetched = summary.fetched,
                    labeled = summary.labeled,
                    errors = summary.errors,
                    "Historical run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                ctx.fail(e.to_string());
                error!(agent = %self.name(), error = %e, "Historical run failed");
                Err(e)
            }
        }
    }

    async fn historical_inner(
        &self,
        ctx: &mut RunContext,
        holder: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        targets: &[Category],
        summary: &mut HistoricalSummary,
    ) -> Result<(), RunError> {
        set_phase(ctx, RunPhase::AcquiringResources);
        let _mail_lease = self
            .tokens
            .lease(ResourceKind::MailChannel, holder, self.token_timeout)
            .await?;
        let _inference_lease = if self.classifier.uses_inference() {
            Some(
                self.tokens
                    .lease(ResourceKind::Inference, holder, self.token_timeout)
                    .await?,
            )
        } else {
            None
        };

        set_phase(ctx, RunPhase::Fetching);
        let filters = FetchFilters {
            limit: self.config.email.fetch_limit,
            unread_only: false,
            since: Some(start),
            until: Some(end),
        };
        let messages = self.mail.fetch(None, &filters).await?;
        summary.fetched = messages.len();

        let now = Utc::now();
        let label = MailAction::ApplyLabel(HISTORICAL_LABEL.to_string());
        for raw in &messages {
            if self.shutdown.is_triggered() {
                info!(agent = %self.name(), "Shutdown requested, stopping historical run");
                break;
            }
            set_phase(ctx, RunPhase::Processing);

            let email = match parse_message(&raw.provider_id, &raw.bytes, now) {
                Ok(email) => email,
                Err(e) => {
                    warn!(agent = %self.name(), provider_id = %raw.provider_id, error = %e, "Unparseable message");
                    summary.errors += 1;
                    continue;
                }
            };
            let category = self.classifier.classify(&email).await.category;
            *summary.by_category.entry(category).or_default() += 1;

            if !targets.is_empty() && !targets.contains(&category) {
                continue;
            }
            if self.senders.is_whitelisted(&email.from_address) {
                summary.whitelisted += 1;
                continue;
            }

            set_phase(ctx, RunPhase::Acting);
            if summary.dry_run {
                info!(
                    agent = %self.name(),
                    subject = %email.subject,
                    %category,
                    "Dry run, would label {HISTORICAL_LABEL}"
                );
                summary.labeled += 1;
                continue;
            }
            match self.mail.perform_action(&email.provider_id, &label).await {
                Ok(()) => summary.labeled += 1,
                Err(e) => {
                    warn!(agent = %self.name(), provider_id = %raw.provider_id, error = %e, "Labeling failed");
                    summary.errors += 1;
                }
            }
        }
        Ok(())
    }
}

/// Phase bookkeeping never fails a run; a rejected move is a bug worth a log.
fn set_phase(ctx: &mut RunContext, phase: RunPhase) {
    if let Err(e) = ctx.transition_to(phase, None) {
        debug!(agent = %ctx.agent, error = %e, "Unexpected phase transition");
    }
}

//! Run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of a single agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Run created, nothing acquired yet.
    Idle,
    /// Waiting on resource tokens.
    AcquiringResources,
    /// Pulling messages from the mailbox.
    Fetching,
    /// Parsing, deduplicating, classifying and deciding.
    Processing,
    /// Executing a mailbox or calendar action.
    Acting,
    /// Finished; tokens released.
    Done,
    /// Run-level failure; always followed by `Done`.
    Error,
}

impl RunPhase {
    /// Check if this phase allows moving to another phase.
    pub fn can_transition_to(&self, target: RunPhase) -> bool {
        use RunPhase::*;

        if target == Error {
            return !self.is_terminal() && *self != Error;
        }

        matches!(
            (self, target),
            (Idle, AcquiringResources) |
            (AcquiringResources, Fetching) |
            // Empty mailbox or shutdown before the first message
            (Fetching, Processing) | (Fetching, Done) |
            (Processing, Acting) | (Acting, Processing) |
            (Processing, Done) | (Acting, Done) |
            (Error, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AcquiringResources => "acquiring_resources",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Acting => "acting",
            Self::Done => "done",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A phase transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: RunPhase,
    pub to: RunPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Bookkeeping for one run of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub agent: String,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the run entered `Error`, if it did.
    pub failure: Option<String>,
    pub transitions: Vec<PhaseTransition>,
}

impl RunContext {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            agent: agent.into(),
            phase: RunPhase::Idle,
            started_at: Utc::now(),
            finished_at: None,
            failure: None,
            transitions: Vec::new(),
        }
    }

    /// Move to a new phase.
    pub fn transition_to(
        &mut self,
        new_phase: RunPhase,
        reason: Option<String>,
    ) -> Result<(), String> {
        if self.phase == new_phase {
            return Ok(());
        }
        if !self.phase.can_transition_to(new_phase) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.phase, new_phase
            ));
        }

        if new_phase == RunPhase::Error {
            self.failure = reason.clone();
        }

        self.transitions.push(PhaseTransition {
            from: self.phase,
            to: new_phase,
            timestamp: Utc::now(),
            reason,
        });

        // Acting ⇄ Processing repeats per message
        const MAX_TRANSITIONS: usize = 200;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.phase = new_phase;
        if new_phase == RunPhase::Done {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a run-level failure and finish.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.phase.is_terminal() {
            let _ = self.transition_to(RunPhase::Error, Some(reason));
        }
        let _ = self.transition_to(RunPhase::Done, None);
    }

    /// Finish normally from wherever the run stopped.
    pub fn finish(&mut self) {
        let _ = self.transition_to(RunPhase::Done, None);
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut ctx = RunContext::new("work");
        for phase in [
            RunPhase::AcquiringResources,
            RunPhase::Fetching,
            RunPhase::Processing,
            RunPhase::Acting,
            RunPhase::Processing,
            RunPhase::Acting,
            RunPhase::Done,
        ] {
            ctx.transition_to(phase, None).unwrap();
        }
        assert!(ctx.phase.is_terminal());
        assert!(ctx.finished_at.is_some());
        assert!(!ctx.failed());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut ctx = RunContext::new("work");
        assert!(ctx.transition_to(RunPhase::Acting, None).is_err());
        assert!(ctx.transition_to(RunPhase::Done, None).is_err());
        assert_eq!(ctx.phase, RunPhase::Idle);
    }

    #[test]
    fn error_reachable_from_every_active_phase() {
        for phase in [
            RunPhase::Idle,
            RunPhase::AcquiringResources,
            RunPhase::Fetching,
            RunPhase::Processing,
            RunPhase::Acting,
        ] {
            assert!(phase.can_transition_to(RunPhase::Error), "{phase}");
        }
        assert!(!RunPhase::Done.can_transition_to(RunPhase::Error));
        assert!(RunPhase::Error.can_transition_to(RunPhase::Done));
        assert!(!RunPhase::Error.can_transition_to(RunPhase::Processing));
    }

    #[test]
    fn fail_ends_in_done_with_reason() {
        let mut ctx = RunContext::new("work");
        ctx.transition_to(RunPhase::AcquiringResources, None).unwrap();
        ctx.fail("mail channel busy");
        assert_eq!(ctx.phase, RunPhase::Done);
        assert_eq!(ctx.failure.as_deref(), Some("mail channel busy"));
        let phases: Vec<_> = ctx.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![RunPhase::AcquiringResources, RunPhase::Error, RunPhase::Done]
        );
    }

    #[test]
    fn transition_history_is_capped() {
        let mut ctx = RunContext::new("work");
        ctx.transition_to(RunPhase::AcquiringResources, None).unwrap();
        ctx.transition_to(RunPhase::Fetching, None).unwrap();
        ctx.transition_to(RunPhase::Processing, None).unwrap();
        for _ in 0..300 {
            ctx.transition_to(RunPhase::Acting, None).unwrap();
            ctx.transition_to(RunPhase::Processing, None).unwrap();
        }
        assert!(ctx.transitions.len() <= 200);
    }
}

//! Agent execution: run state machine, per-agent runner, scheduler.
//!
//! Core components:
//! - `state`: Run phases (Idle → AcquiringResources → Fetching → Processing ⇄ Acting → Done)
//! - `runner`: One pass of one agent's pipeline, plus historical reprocessing
//! - `launcher`: In-process or child-process execution of a run
//! - `scheduler`: Most-overdue-first scheduling, continuous and single-shot
//! - `shutdown`: Shared shutdown signal

pub mod launcher;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod state;

pub use launcher::{AgentLauncher, InProcessLauncher, ProcessLauncher};
pub use runner::{AgentRunner, CalendarDeps, HistoricalSummary, RunSummary, RunnerDeps};
pub use scheduler::{AgentSlot, Scheduler};
pub use shutdown::Shutdown;
pub use state::{RunContext, RunPhase};

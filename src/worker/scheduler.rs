//! Agent scheduler.
//!
//! Keeps a `last_run` per configured agent and launches whichever agent is
//! most overdue (`last_run + interval` furthest in the past; never-run agents
//! first). Continuous mode loops until shutdown, single-shot mode makes one
//! pass over every due agent. A failing agent never stops the others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, load_agent_dir, reload_agent};
use crate::error::{ConfigError, RunError};
use crate::worker::launcher::AgentLauncher;
use crate::worker::runner::RunSummary;
use crate::worker::shutdown::Shutdown;

/// Scheduling state of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSlot {
    pub interval: Duration,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
}

impl AgentSlot {
    fn from_config(config: &AgentConfig) -> Self {
        Self {
            interval: config.schedule_interval(),
            enabled: config.agent.enabled,
            last_run: None,
        }
    }

    /// When the agent is next due. `None` means it has never run.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::MAX);
        self.last_run
            .map(|last| last.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at().is_none_or(|due| due <= now)
    }
}

/// Outcome of one launched run.
pub type RunResult = (String, Result<RunSummary, RunError>);

/// Runs in flight in continuous mode, keyed by task so a run that panics can
/// still be traced back to its agent.
type InFlight = JoinSet<Result<RunSummary, RunError>>;
type Running = HashMap<task::Id, String>;

pub struct Scheduler {
    config_dir: PathBuf,
    max_sleep: Duration,
    launcher: Arc<dyn AgentLauncher>,
    shutdown: Shutdown,
    agents: BTreeMap<String, AgentSlot>,
}

impl Scheduler {
    /// Load every agent in `config_dir`.
    pub fn new(
        config_dir: impl Into<PathBuf>,
        launcher: Arc<dyn AgentLauncher>,
        shutdown: Shutdown,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();
        let agents = load_agent_dir(&config_dir)?
            .iter()
            .map(|config| (config.name().to_string(), AgentSlot::from_config(config)))
            .collect();
        Ok(Self {
            config_dir,
            max_sleep: Duration::from_secs(60),
            launcher,
            shutdown,
            agents,
        })
    }

    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }

    pub fn agents(&self) -> &BTreeMap<String, AgentSlot> {
        &self.agents
    }

    /// Due agents, most overdue first. Never-run agents come first, in name
    /// order.
    pub fn due_agents(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(Option<DateTime<Utc>>, &String)> = self
            .agents
            .iter()
            .filter(|(_, slot)| slot.is_due(now))
            .map(|(name, slot)| (slot.due_at(), name))
            .collect();
        // None sorts before Some, and earlier due times are more overdue.
        due.sort();
        due.into_iter().map(|(_, name)| name.clone()).collect()
    }

    /// Time until the next agent outside `running` is due.
    pub fn next_due_in(&self, now: DateTime<Utc>, running: &HashSet<String>) -> Option<Duration> {
        self.agents
            .iter()
            .filter(|(name, _)| !running.contains(*name))
            .map(|(_, slot)| match slot.due_at() {
                None => Duration::ZERO,
                Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO),
            })
            .min()
    }

    /// Re-read an agent's file before launching it. Returns `None` when it
    /// must not run this cycle, in which case its `last_run` is advanced so
    /// it is retried one interval later.
    fn prepare(&mut self, name: &str, now: DateTime<Utc>) -> Option<AgentConfig> {
        let config = match reload_agent(&self.config_dir, name) {
            Ok(config) => config,
            Err(e) => {
                warn!(agent = %name, error = %e, "Agent config failed to load, skipping this cycle");
                if let Some(slot) = self.agents.get_mut(name) {
                    slot.last_run = Some(now);
                }
                return None;
            }
        };

        let slot = self.agents.get_mut(name)?;
        slot.interval = config.schedule_interval();
        slot.enabled = config.agent.enabled;
        if !slot.enabled {
            debug!(agent = %name, "Agent disabled");
            slot.last_run = Some(now);
            return None;
        }
        Some(config)
    }

    fn finish(&mut self, name: &str, result: &Result<RunSummary, RunError>) {
        if let Some(slot) = self.agents.get_mut(name) {
            slot.last_run = Some(Utc::now());
        }
        match result {
            Ok(summary) => info!(
                agent = %name,
                fetched = summary.fetched,
                kept = summary.kept,
                archived = summary.archived,
                deleted_or_labeled = summary.deleted_or_labeled,
                errors = summary.errors,
                "Agent run complete"
            ),
            Err(e) if e.is_transient() => warn!(agent = %name, error = %e, "Agent run skipped"),
            Err(e) => error!(agent = %name, error = %e, "Agent run failed"),
        }
    }

    /// One pass over every due agent, launched together. Resource tokens
    /// serialize whatever they contend on.
    pub async fn run_once(&mut self) -> Vec<RunResult> {
        let now = Utc::now();
        let configs: Vec<AgentConfig> = self
            .due_agents(now)
            .into_iter()
            .filter_map(|name| self.prepare(&name, now))
            .collect();
        info!(agents = configs.len(), "Single pass over due agents");

        let launches = configs.into_iter().map(|config| {
            let launcher = Arc::clone(&self.launcher);
            async move {
                let name = config.name().to_string();
                let result = launcher.launch(config).await;
                (name, result)
            }
        });
        let results = futures::future::join_all(launches).await;

        for (name, result) in &results {
            self.finish(name, result);
        }
        results
    }

    /// Loop until shutdown, keeping at most one run per agent in flight.
    /// In-flight runs are awaited before returning.
    pub async fn run_forever(mut self) {
        info!(
            agents = self.agents.len(),
            dir = %self.config_dir.display(),
            "Scheduler started"
        );

        let mut in_flight = InFlight::new();
        let mut running = Running::new();

        while !self.shutdown.is_triggered() {
            let now = Utc::now();
            for name in self.due_agents(now) {
                if running.values().any(|n| *n == name) {
                    continue;
                }
                let Some(config) = self.prepare(&name, now) else {
                    continue;
                };
                self.launch_into(&mut in_flight, &mut running, config);
            }

            let busy: HashSet<String> = running.values().cloned().collect();
            let sleep = self
                .next_due_in(Utc::now(), &busy)
                .unwrap_or(self.max_sleep)
                .min(self.max_sleep);
            let shutdown = self.shutdown.clone();

            tokio::select! {
                Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    self.complete(joined, &mut running);
                }
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.wait() => {}
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight runs");
        }
        while let Some(joined) = in_flight.join_next_with_id().await {
            self.complete(joined, &mut running);
        }
        info!("Scheduler stopped");
    }

    fn launch_into(&self, in_flight: &mut InFlight, running: &mut Running, config: AgentConfig) {
        let name = config.name().to_string();
        info!(agent = %name, "Launching agent");
        let launcher = Arc::clone(&self.launcher);
        let handle = in_flight.spawn(async move { launcher.launch(config).await });
        running.insert(handle.id(), name);
    }

    fn complete(
        &mut self,
        joined: Result<(task::Id, Result<RunSummary, RunError>), JoinError>,
        running: &mut Running,
    ) {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => {
                let id = e.id();
                let agent = running.get(&id).cloned().unwrap_or_default();
                error!(agent = %agent, error = %e, "Agent task ended abnormally");
                let reason = if e.is_panic() {
                    "run task panicked".to_string()
                } else {
                    "run task cancelled".to_string()
                };
                (id, Err(RunError::Worker { agent, reason }))
            }
        };
        let Some(name) = running.remove(&id) else {
            warn!(task = %id, "Finished task has no agent");
            return;
        };
        self.finish(&name, &result);
    }

    /// Spawn [`run_forever`](Self::run_forever) in the background.
    ///
    /// Returns the task handle and the shutdown signal that stops it.
    pub fn spawn(self) -> (JoinHandle<()>, Shutdown) {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(self.run_forever());
        (handle, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    #[derive(Default)]
    struct MockLauncher {
        launched: Mutex<Vec<String>>,
        fail: Vec<String>,
        panic_on: Vec<String>,
        delay: Duration,
    }

    #[async_trait]
    impl AgentLauncher for MockLauncher {
        async fn launch(&self, config: AgentConfig) -> Result<RunSummary, RunError> {
            let name = config.name().to_string();
            self.launched.lock().unwrap().push(name.clone());
            tokio::time::sleep(self.delay).await;
            if self.panic_on.contains(&name) {
                panic!("launcher blew up for {name}");
            }
            if self.fail.contains(&name) {
                return Err(RunError::Worker {
                    agent: name,
                    reason: "boom".into(),
                });
            }
            let now = Utc::now();
            Ok(RunSummary {
                agent: name,
                fetched: 0,
                kept: 0,
                archived: 0,
                deleted_or_labeled: 0,
                errors: 0,
                skipped: 0,
                dry_run: true,
                started_at: now,
                finished_at: now,
            })
        }
    }

    fn write_agent(dir: &std::path::Path, name: &str, extra: &str) {
        std::fs::write(
            dir.join(format!("{name}.yaml")),
            format!("agent:\n  name: {name}\n{extra}"),
        )
        .unwrap();
    }

    fn slot(minutes: u64, last_run: Option<DateTime<Utc>>) -> AgentSlot {
        AgentSlot {
            interval: Duration::from_secs(minutes * 60),
            enabled: true,
            last_run,
        }
    }

    fn scheduler_with(
        agents: Vec<(&str, AgentSlot)>,
        launcher: Arc<MockLauncher>,
    ) -> (tempfile::TempDir, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(dir.path(), launcher, Shutdown::new()).unwrap();
        scheduler.agents = agents
            .into_iter()
            .map(|(name, slot)| (name.to_string(), slot))
            .collect();
        (dir, scheduler)
    }

    #[test]
    fn most_overdue_agent_comes_first() {
        let now = Utc::now();
        let minutes = |m| chrono::Duration::minutes(m);
        let (_dir, scheduler) = scheduler_with(
            vec![
                // due 10 minutes ago
                ("a", slot(60, Some(now - minutes(70)))),
                // due 50 minutes ago
                ("b", slot(10, Some(now - minutes(60)))),
                // not due for 50 minutes
                ("c", slot(60, Some(now - minutes(10)))),
                ("d", slot(60, None)),
            ],
            Arc::new(MockLauncher::default()),
        );
        assert_eq!(scheduler.due_agents(now), vec!["d", "b", "a"]);
    }

    #[test]
    fn next_due_ignores_running_agents() {
        let now = Utc::now();
        let (_dir, scheduler) = scheduler_with(
            vec![
                ("a", slot(60, None)),
                ("b", slot(30, Some(now - chrono::Duration::minutes(20)))),
            ],
            Arc::new(MockLauncher::default()),
        );
        assert_eq!(scheduler.next_due_in(now, &HashSet::new()), Some(Duration::ZERO));

        let running = HashSet::from(["a".to_string()]);
        let wait = scheduler.next_due_in(now, &running).unwrap();
        assert!(wait > Duration::from_secs(9 * 60) && wait <= Duration::from_secs(10 * 60));
    }

    #[tokio::test]
    async fn run_once_launches_enabled_agents_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "alpha", "");
        write_agent(dir.path(), "beta", "");
        write_agent(dir.path(), "gamma", "  enabled: false\n");

        let launcher = Arc::new(MockLauncher {
            fail: vec!["alpha".into()],
            ..Default::default()
        });
        let mut scheduler =
            Scheduler::new(dir.path(), launcher.clone(), Shutdown::new()).unwrap();
        let results = scheduler.run_once().await;

        let mut launched = launcher.launched.lock().unwrap().clone();
        launched.sort();
        assert_eq!(launched, vec!["alpha", "beta"]);
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|(n, r)| n == "alpha" && r.is_err()));
        assert!(results.iter().any(|(n, r)| n == "beta" && r.is_ok()));

        // Failed and disabled agents still advance.
        for name in ["alpha", "beta", "gamma"] {
            assert!(scheduler.agents()[name].last_run.is_some(), "{name}");
        }
        assert!(!scheduler.agents()["gamma"].enabled);
        assert!(scheduler.due_agents(Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn broken_config_skips_agent_for_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "alpha", "");
        let launcher = Arc::new(MockLauncher::default());
        let mut scheduler =
            Scheduler::new(dir.path(), launcher.clone(), Shutdown::new()).unwrap();

        std::fs::write(dir.path().join("alpha.yaml"), "agent:\n  name: alpha\n  bogus: 1\n")
            .unwrap();
        let results = scheduler.run_once().await;

        assert!(results.is_empty());
        assert!(launcher.launched.lock().unwrap().is_empty());
        assert!(scheduler.agents()["alpha"].last_run.is_some());
    }

    #[tokio::test]
    async fn continuous_mode_runs_each_agent_then_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "alpha", "");
        write_agent(dir.path(), "beta", "");

        let launcher = Arc::new(MockLauncher {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let scheduler = Scheduler::new(dir.path(), launcher.clone(), Shutdown::new())
            .unwrap()
            .with_max_sleep(Duration::from_millis(20));
        let (handle, shutdown) = scheduler.spawn();

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let mut launched = launcher.launched.lock().unwrap().clone();
        launched.sort();
        // 60-minute interval: exactly one run each.
        assert_eq!(launched, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn panicked_run_frees_its_agent() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "alpha", "");
        let launcher = Arc::new(MockLauncher {
            panic_on: vec!["alpha".into()],
            ..Default::default()
        });
        let mut scheduler =
            Scheduler::new(dir.path(), launcher.clone(), Shutdown::new()).unwrap();

        let config = scheduler.prepare("alpha", Utc::now()).unwrap();
        let mut in_flight = InFlight::new();
        let mut running = Running::new();
        scheduler.launch_into(&mut in_flight, &mut running, config);
        assert_eq!(running.len(), 1);

        let joined = in_flight.join_next_with_id().await.unwrap();
        assert!(joined.as_ref().is_err_and(|e| e.is_panic()));
        scheduler.complete(joined, &mut running);

        assert!(running.is_empty());
        assert!(scheduler.agents()["alpha"].last_run.is_some());
        assert!(scheduler.due_agents(Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_runs() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "slow", "");

        let launcher = Arc::new(MockLauncher {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let scheduler = Scheduler::new(dir.path(), launcher.clone(), Shutdown::new()).unwrap();
        let (handle, shutdown) = scheduler.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        let started = std::time::Instant::now();
        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }
}

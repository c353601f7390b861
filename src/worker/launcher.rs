//! Ways to start one agent run on behalf of the scheduler.
//!
//! The default [`ProcessLauncher`] gives every run its own OS process, so a
//! crashed or wedged run never takes the scheduler down and an inference
//! handle is never shared between agents. Coordination between those
//! processes happens only through the resource tokens.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, OrchestratorConfig};
use crate::error::RunError;
use crate::tokens::TokenManager;
use crate::worker::runner::{AgentRunner, RunSummary};
use crate::worker::shutdown::Shutdown;

/// Exit code of `run-agent` when a resource token stayed busy.
pub const EXIT_RESOURCE_BUSY: i32 = 75;

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Run `config`'s agent once and report its summary.
    async fn launch(&self, config: AgentConfig) -> Result<RunSummary, RunError>;
}

/// Runs agents inside the scheduler process.
pub struct InProcessLauncher {
    settings: OrchestratorConfig,
    tokens: Arc<TokenManager>,
    shutdown: Shutdown,
}

impl InProcessLauncher {
    pub fn new(settings: OrchestratorConfig, tokens: Arc<TokenManager>, shutdown: Shutdown) -> Self {
        Self {
            settings,
            tokens,
            shutdown,
        }
    }
}

#[async_trait]
impl AgentLauncher for InProcessLauncher {
    async fn launch(&self, config: AgentConfig) -> Result<RunSummary, RunError> {
        AgentRunner::open(config, &self.settings, Arc::clone(&self.tokens))
            .await?
            .with_shutdown(self.shutdown.clone())
            .run()
            .await
    }
}

/// Spawns `<exe> <global args> run-agent <name>` and reads the JSON summary
/// the child prints on stdout.
///
/// Shutdown is forwarded to the child as SIGTERM, so it finishes the message
/// in hand and still reports a summary.
pub struct ProcessLauncher {
    exe: PathBuf,
    global_args: Vec<OsString>,
    shutdown: Shutdown,
}

impl ProcessLauncher {
    pub fn new(exe: impl Into<PathBuf>, global_args: Vec<OsString>, shutdown: Shutdown) -> Self {
        Self {
            exe: exe.into(),
            global_args,
            shutdown,
        }
    }

    /// Launcher that re-executes the running binary with the same paths.
    pub fn current_exe(
        settings: &OrchestratorConfig,
        log_dir: Option<&Path>,
        shutdown: Shutdown,
    ) -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            child_args(settings, log_dir),
            shutdown,
        ))
    }
}

/// Global flags that point a child at the scheduler's directories.
fn child_args(settings: &OrchestratorConfig, log_dir: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--config-dir".into(),
        settings.config_dir.clone().into_os_string(),
        "--data-dir".into(),
        settings.data_dir.clone().into_os_string(),
        "--lock-dir".into(),
        settings.lock_dir.clone().into_os_string(),
    ];
    if let Some(dir) = log_dir {
        args.push("--log-dir".into());
        args.push(dir.as_os_str().to_os_string());
    }
    args
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, config: AgentConfig) -> Result<RunSummary, RunError> {
        let agent = config.name().to_string();
        let worker_err = |reason: String| RunError::Worker {
            agent: agent.clone(),
            reason,
        };

        debug!(agent = %agent, exe = %self.exe.display(), "Spawning agent process");
        let mut child = tokio::process::Command::new(&self.exe)
            .args(&self.global_args)
            .arg("run-agent")
            .arg(&agent)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| worker_err(format!("spawn failed: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| worker_err("child stdout not captured".into()))?;
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        let waited = tokio::select! {
            status = child.wait() => status,
            _ = self.shutdown.wait() => {
                info!(agent = %agent, "Forwarding shutdown to agent process");
                terminate(&mut child);
                child.wait().await
            }
        };
        let status = waited.map_err(|e| worker_err(format!("wait failed: {e}")))?;

        let stdout = reader
            .await
            .map_err(|e| worker_err(format!("stdout reader failed: {e}")))?
            .map_err(|e| worker_err(format!("reading stdout: {e}")))?;

        if !status.success() {
            return Err(match status.code() {
                Some(EXIT_RESOURCE_BUSY) => RunError::Busy {
                    agent: agent.clone(),
                },
                _ => worker_err(format!("exited with {status}")),
            });
        }

        parse_summary(&stdout).map_err(worker_err)
    }
}

/// Ask the child to stop after its current message.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, error = %e, "SIGTERM to agent process failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Stopping agent process failed");
    }
}

/// The summary is the last non-empty stdout line.
fn parse_summary(stdout: &[u8]) -> Result<RunSummary, String> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| "no summary on stdout".to_string())?;
    serde_json::from_str(line).map_err(|e| format!("bad summary: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_is_last_line() {
        let stdout = br#"noise
{"agent":"work","fetched":3,"kept":1,"archived":1,"deleted_or_labeled":1,"errors":0,"skipped":0,"dry_run":true,"started_at":"2026-03-01T10:00:00Z","finished_at":"2026-03-01T10:00:05Z"}

"#;
        let summary = parse_summary(stdout).unwrap();
        assert_eq!(summary.agent, "work");
        assert_eq!(summary.fetched, 3);
        assert!(summary.dry_run);
    }

    #[test]
    fn empty_or_garbled_stdout_is_an_error() {
        assert!(parse_summary(b"").is_err());
        assert!(parse_summary(b"not json\n").is_err());
    }

    const SUMMARY: &str = r#"{"agent":"work","fetched":2,"kept":0,"archived":1,"deleted_or_labeled":0,"errors":0,"skipped":0,"dry_run":false,"started_at":"2026-03-01T10:00:00Z","finished_at":"2026-03-01T10:00:05Z"}"#;

    fn shell(script: String) -> ProcessLauncher {
        ProcessLauncher::new("/bin/sh", vec!["-c".into(), script.into()], Shutdown::new())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_child_is_a_worker_error() {
        let launcher = ProcessLauncher::new("/bin/false", Vec::new(), Shutdown::new());
        let err = launcher
            .launch(AgentConfig::named("work"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Worker { ref agent, .. } if agent == "work"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_worker_error() {
        let launcher = ProcessLauncher::new("/nonexistent/mailwarden", Vec::new(), Shutdown::new());
        let err = launcher
            .launch(AgentConfig::named("work"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("spawn failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_summary_is_returned() {
        let launcher = shell(format!("echo starting; echo '{SUMMARY}'"));
        let summary = launcher.launch(AgentConfig::named("work")).await.unwrap();
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.archived, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn busy_exit_code_is_transient() {
        let launcher = shell(format!("exit {EXIT_RESOURCE_BUSY}"));
        let err = launcher
            .launch(AgentConfig::named("work"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Busy { ref agent } if agent == "work"));
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_is_forwarded_to_the_child() {
        let script = format!(
            "finish() {{ echo '{SUMMARY}'; exit 0; }}; trap finish TERM; while :; do sleep 0.05; done"
        );
        let shutdown = Shutdown::new();
        let launcher = ProcessLauncher::new(
            "/bin/sh",
            vec!["-c".into(), script.into()],
            shutdown.clone(),
        );

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            trigger.trigger();
        });

        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            launcher.launch(AgentConfig::named("work")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.agent, "work");
    }

    #[test]
    fn child_args_carry_every_directory() {
        let settings = OrchestratorConfig::from_env(
            PathBuf::from("cfg"),
            PathBuf::from("data"),
            Some(PathBuf::from("locks")),
        );
        let args = child_args(&settings, Some(Path::new("logs")));
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--config-dir",
                "cfg",
                "--data-dir",
                "data",
                "--lock-dir",
                "locks",
                "--log-dir",
                "logs"
            ]
        );
        assert!(!child_args(&settings, None).contains(&OsString::from("--log-dir")));
    }
}

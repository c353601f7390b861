use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mailwarden::config::{OrchestratorConfig, reload_agent};
use mailwarden::error::RunError;
use mailwarden::pipeline::types::Category;
use mailwarden::store::{EmailStore, FileEmailStore};
use mailwarden::tokens::TokenManager;
use mailwarden::worker::launcher::EXIT_RESOURCE_BUSY;
use mailwarden::worker::{
    AgentLauncher, AgentRunner, InProcessLauncher, ProcessLauncher, Scheduler, Shutdown,
};

#[derive(Parser)]
#[command(name = "mailwarden", version, about = "Scheduled mail triage agents")]
struct Cli {
    /// Directory of agent YAML files.
    #[arg(long, global = true, default_value = "config/agents")]
    config_dir: PathBuf,

    /// Root of per-agent state.
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    /// Shared resource-token directory. Defaults to `<data-dir>/locks`.
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    /// Also write daily-rotated logs here.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule every configured agent.
    Run {
        /// One pass over due agents, then exit.
        #[arg(long)]
        once: bool,
        /// Run agents inside this process instead of one process per run.
        #[arg(long)]
        in_process: bool,
    },
    /// Run one agent once and print its summary as JSON.
    RunAgent { name: String },
    /// Reclassify a date range and label matching mail, ignoring the watermark.
    Historical {
        #[arg(long)]
        agent: String,
        /// YYYY-MM-DD, inclusive.
        #[arg(long)]
        start_date: NaiveDate,
        /// YYYY-MM-DD, inclusive.
        #[arg(long)]
        end_date: NaiveDate,
        /// Categories to label. Defaults to promotions.
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        target_categories: Vec<Category>,
    },
    /// Persisted record counts for an agent.
    Stats { agent: String },
    /// Current holder of every resource token.
    Tokens,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    let settings = OrchestratorConfig::from_env(
        cli.config_dir.clone(),
        cli.data_dir.clone(),
        cli.lock_dir.clone(),
    );
    let tokens = Arc::new(
        TokenManager::new(&settings.lock_dir)
            .context("opening lock directory")?
            .with_stale_after(settings.stale_lock_after)
            .with_poll_interval(settings.token_poll_interval),
    );
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let result = match cli.command {
        Command::Run { once, in_process } => {
            run_scheduler(
                &settings,
                &tokens,
                &shutdown,
                cli.log_dir.as_deref(),
                once,
                in_process,
            )
            .await
        }
        Command::RunAgent { name } => run_agent(&settings, &tokens, &shutdown, &name).await,
        Command::Historical {
            agent,
            start_date,
            end_date,
            target_categories,
        } => {
            run_historical(
                &settings,
                &tokens,
                &shutdown,
                &agent,
                start_date,
                end_date,
                target_categories,
            )
            .await
        }
        Command::Stats { agent } => print_stats(&settings, &agent).await,
        Command::Tokens => print_tokens(&tokens),
    };

    tokens.release_everything();
    result
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter())
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "mailwarden.log"));
    tracing_subscriber::registry()
        .with(filter())
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing current message");
        shutdown.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_scheduler(
    settings: &OrchestratorConfig,
    tokens: &Arc<TokenManager>,
    shutdown: &Shutdown,
    log_dir: Option<&Path>,
    once: bool,
    in_process: bool,
) -> anyhow::Result<()> {
    let launcher: Arc<dyn AgentLauncher> = if in_process {
        Arc::new(InProcessLauncher::new(
            settings.clone(),
            Arc::clone(tokens),
            shutdown.clone(),
        ))
    } else {
        Arc::new(
            ProcessLauncher::current_exe(settings, log_dir, shutdown.clone())
                .context("locating own executable")?,
        )
    };

    let mut scheduler = Scheduler::new(&settings.config_dir, launcher, shutdown.clone())
        .with_context(|| format!("loading agents from {}", settings.config_dir.display()))?
        .with_max_sleep(settings.max_sleep);

    eprintln!("mailwarden v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agents: {}", scheduler.agents().len());
    eprintln!("   Config: {}", settings.config_dir.display());
    eprintln!("   Data:   {}", settings.data_dir.display());
    eprintln!("   Locks:  {}", settings.lock_dir.display());
    eprintln!(
        "   Mode:   {}{}",
        if once { "single pass" } else { "continuous" },
        if in_process { ", in-process" } else { "" }
    );

    if once {
        let results = scheduler.run_once().await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(runs = results.len(), failed, "Single pass complete");
    } else {
        scheduler.run_forever().await;
    }
    Ok(())
}

async fn run_agent(
    settings: &OrchestratorConfig,
    tokens: &Arc<TokenManager>,
    shutdown: &Shutdown,
    name: &str,
) -> anyhow::Result<()> {
    let config = reload_agent(&settings.config_dir, name)?;
    let runner = AgentRunner::open(config, settings, Arc::clone(tokens))
        .await?
        .with_shutdown(shutdown.clone());

    match runner.run().await {
        Ok(summary) => {
            println!("{}", serde_json::to_string(&summary)?);
            Ok(())
        }
        Err(e @ RunError::ResourceTimeout(_)) => {
            warn!(agent = %name, error = %e, "Resources busy");
            tokens.release_everything();
            std::process::exit(EXIT_RESOURCE_BUSY);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_historical(
    settings: &OrchestratorConfig,
    tokens: &Arc<TokenManager>,
    shutdown: &Shutdown,
    agent: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
    target_categories: Vec<Category>,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        start_date <= end_date,
        "start date {start_date} is after end date {end_date}"
    );
    let start = Utc.from_utc_datetime(&start_date.and_time(chrono::NaiveTime::MIN));
    let end = Utc.from_utc_datetime(
        &end_date
            .and_hms_opt(23, 59, 59)
            .context("building end of day")?,
    );
    let targets = if target_categories.is_empty() {
        vec![Category::Promotions]
    } else {
        target_categories
    };

    let config = reload_agent(&settings.config_dir, agent)?;
    let runner = AgentRunner::open(config, settings, Arc::clone(tokens))
        .await?
        .with_shutdown(shutdown.clone());
    let summary = runner.run_historical(start, end, &targets).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn print_stats(settings: &OrchestratorConfig, agent: &str) -> anyhow::Result<()> {
    let store = FileEmailStore::open(&settings.data_dir, agent).await?;
    let stats = store.stats().await;
    let watermark = store.watermark().await;
    let out = serde_json::json!({
        "agent": agent,
        "stats": stats,
        "watermark": watermark,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_tokens(tokens: &TokenManager) -> anyhow::Result<()> {
    for (kind, status) in tokens.status()? {
        println!("{:<14} {status}", kind.to_string());
    }
    Ok(())
}

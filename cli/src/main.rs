use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use lookout_monitor::{ControlPlaneClient, Monitor, MonitorConfig, MonitorEvent};
use lookout_observability::{init_logging, redact_credential, LogOptions};
use lookout_types::{derive_state, LifecycleState};

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "lookout")]
#[command(about = "Operator console for live worker sessions")]
struct Cli {
    /// Control-plane API base, e.g. http://127.0.0.1:3000/api
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Bearer credential attached to every control-plane call.
    #[arg(long, global = true, hide_env_values = true, env = "LOOKOUT_API_TOKEN")]
    api_token: Option<String>,
    /// Poll-only: do not open the push channel.
    #[arg(long, global = true, default_value_t = false)]
    no_push: bool,
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One-shot listing with derived lifecycle states.
    Sessions {
        /// Show one session in detail instead of the listing.
        #[arg(long)]
        id: Option<String>,
    },
    /// Follow the live view, reporting every change until interrupted.
    Watch,
    /// Terminate a session.
    Kill {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Restart a failed or stalled session.
    Respawn {
        id: String,
        /// Respawn configuration as a JSON object.
        #[arg(long, default_value = "{}")]
        config_json: String,
    },
    /// Fetch recent log lines for a session.
    Logs {
        id: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Fetch provider-defined metrics for a session.
    Metrics { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let state_dir = std::env::var("LOOKOUT_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".lookout"));
    let log = init_logging(&LogOptions::new("cli", &state_dir, LOG_RETENTION_DAYS))?;

    let config = build_config(&cli);
    info!(
        api_url = %config.base_url,
        token = %config
            .bearer_token
            .as_deref()
            .map(redact_credential)
            .unwrap_or_default(),
        logs_dir = %log.dir.display(),
        "lookout starting"
    );

    let monitor = Monitor::new(config.clone());
    match cli.command {
        Command::Sessions { id } => sessions(&config, id.as_deref()).await,
        Command::Watch => watch(&monitor).await,
        Command::Kill { id, reason } => {
            monitor
                .kill(&id, reason)
                .await
                .with_context(|| format!("failed to kill session {id}"))?;
            println!("kill accepted for {id}");
            Ok(())
        }
        Command::Respawn { id, config_json } => {
            let respawn_config: serde_json::Value =
                serde_json::from_str(&config_json).context("--config-json is not valid JSON")?;
            monitor
                .respawn(&id, respawn_config)
                .await
                .with_context(|| format!("failed to respawn session {id}"))?;
            println!("respawn accepted for {id}");
            Ok(())
        }
        Command::Logs { id, limit } => {
            let entries = monitor
                .logs(&id, limit)
                .await
                .with_context(|| format!("failed to fetch logs for {id}"))?;
            for entry in entries {
                println!(
                    "{} [{}] {}",
                    entry.timestamp.format("%H:%M:%S"),
                    if entry.level.is_empty() { "info" } else { entry.level.as_str() },
                    entry.message
                );
            }
            Ok(())
        }
        Command::Metrics { id } => {
            let metrics = monitor
                .metrics(&id)
                .await
                .with_context(|| format!("failed to fetch metrics for {id}"))?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
    }
}

fn build_config(cli: &Cli) -> MonitorConfig {
    let mut config = MonitorConfig::from_env();
    if let Some(url) = &cli.api_url {
        config.base_url = url.clone();
    }
    if let Some(token) = &cli.api_token {
        if !token.trim().is_empty() {
            config.bearer_token = Some(token.clone());
        }
    }
    if cli.no_push {
        config.use_push = false;
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    config
}

/// One direct poll, rendered as a fixed-width listing (or one session in
/// detail when an id is given).
async fn sessions(config: &MonitorConfig, id: Option<&str>) -> anyhow::Result<()> {
    let client = ControlPlaneClient::new(config);
    let now = Utc::now();

    if let Some(id) = id {
        let record = client
            .get_session(id)
            .await
            .with_context(|| format!("failed to fetch session {id}"))?
            .into_record(now);
        let state = derive_state(&record, now);
        println!("id:            {}", record.id);
        println!("name:          {}", record.name);
        println!("task:          {}", record.task);
        println!("state:         {state} (raw: {})", record.raw_status);
        println!("progress:      {}%", record.effective_progress());
        println!(
            "tokens:        {}/{}",
            record.tokens_used, record.tokens_limit
        );
        println!("priority:      {}", record.priority);
        if let Some(start) = record.start_time {
            println!("started:       {start}");
        }
        if let Some(activity) = record.last_activity {
            println!("last activity: {activity}");
        }
        if let Some(path) = &record.output_path {
            println!("output:        {path}");
        }
        return Ok(());
    }

    let raw = client
        .list_sessions()
        .await
        .context("failed to list sessions")?;
    let mut records: Vec<_> = raw.into_iter().map(|r| r.into_record(now)).collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    if records.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    println!(
        "{:<10} {:<9} {:>4} {:>9} {:<8} NAME",
        "ID", "STATE", "PROG", "TOKENS", "PRIORITY"
    );
    for record in records {
        let state = derive_state(&record, now);
        println!(
            "{:<10} {:<9} {:>3}% {:>9} {:<8} {}",
            short_id(&record.id),
            state,
            record.effective_progress(),
            format!("{}/{}", record.tokens_used, record.tokens_limit),
            record.priority,
            record.name
        );
    }
    Ok(())
}

/// Follow mode: start the pipeline, summarize every accepted snapshot, and
/// surface pipeline-level errors as they happen.
async fn watch(monitor: &Monitor) -> anyhow::Result<()> {
    let mut events = monitor.subscribe();
    monitor.start();
    info!("watching; press ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                monitor.stop();
                break;
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::SnapshotUpdated { generation }) => {
                    println!("[gen {generation}] {}", summarize(monitor));
                }
                Ok(MonitorEvent::PollFailed { error }) => {
                    warn!(%error, "poll failed; showing last good view");
                }
                Ok(MonitorEvent::PushConnected) => info!("push channel connected"),
                Ok(MonitorEvent::PushLost { error }) => warn!(%error, "push channel lost"),
                Ok(MonitorEvent::PushDegraded { attempts }) => {
                    warn!(attempts, "push abandoned; poll-only from here");
                }
                Ok(MonitorEvent::Stopped) => break,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

fn summarize(monitor: &Monitor) -> String {
    let now = Utc::now();
    let sessions = monitor.sessions();
    let mut parts = vec![format!("{} sessions", sessions.len())];
    for state in [
        LifecycleState::Working,
        LifecycleState::Spawning,
        LifecycleState::Completed,
        LifecycleState::Stalled,
        LifecycleState::Failed,
    ] {
        let count = sessions
            .iter()
            .filter(|r| derive_state(r, now) == state)
            .count();
        if count > 0 {
            parts.push(format!("{count} {state}"));
        }
    }
    let mut line = parts.join(", ");
    let attention: Vec<&str> = sessions
        .iter()
        .filter(|r| derive_state(r, now).needs_intervention())
        .map(|r| r.id.as_str())
        .collect();
    if !attention.is_empty() {
        line.push_str(&format!(
            "; intervention required: {}",
            attention.join(", ")
        ));
    }
    line
}

fn short_id(id: &str) -> String {
    let head: String = id.chars().take(8).collect();
    if head.len() < id.len() {
        format!("{head}…")
    } else {
        head
    }
}

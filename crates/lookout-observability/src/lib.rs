//! Logging for lookout processes.
//!
//! Each process writes one JSONL log file per day under the state directory
//! alongside a compact stderr stream, both filtered by `RUST_LOG`. Stale
//! files are pruned on startup so a long-lived operator machine never
//! accumulates them. Credentials go through [`redact_credential`] before
//! they may appear in any log line.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_SUFFIX: &str = "jsonl";

/// Where a process logs and for how long the files are kept.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Short process label; becomes part of the file name ("cli", ...).
    pub process: String,
    /// Directory the rolling files live in; created if missing.
    pub dir: PathBuf,
    /// Rolled files older than this are deleted on startup.
    pub retention: Duration,
}

impl LogOptions {
    pub fn new(process: &str, state_dir: &Path, retention_days: u64) -> Self {
        Self {
            process: process.to_string(),
            dir: state_dir.join("logs"),
            retention: Duration::from_secs(retention_days * 24 * 60 * 60),
        }
    }

    fn file_prefix(&self) -> String {
        format!("lookout.{}", self.process)
    }
}

/// Keeps the background file writer alive; dropping it flushes buffered
/// lines, so hold it for the life of the process.
pub struct LogHandle {
    _guard: WorkerGuard,
    pub dir: PathBuf,
    pub file_prefix: String,
}

/// Install the global subscriber: JSONL to a daily-rolling file plus a
/// compact stderr stream. `RUST_LOG` controls the filter, defaulting to
/// `info`. Safe to call more than once; later calls keep the first
/// subscriber and still return a usable handle.
pub fn init_logging(options: &LogOptions) -> anyhow::Result<LogHandle> {
    fs::create_dir_all(&options.dir)?;
    prune_stale_logs(&options.dir, &options.file_prefix(), options.retention)?;

    let file = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(options.file_prefix())
        .filename_suffix(LOG_SUFFIX)
        .build(&options.dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .ok();

    Ok(LogHandle {
        _guard: guard,
        dir: options.dir.clone(),
        file_prefix: options.file_prefix(),
    })
}

/// Delete this process's rolled files once their mtime falls outside the
/// retention window. Files that do not carry our prefix/suffix are never
/// touched. Returns how many files were removed.
fn prune_stale_logs(dir: &Path, prefix: &str, retention: Duration) -> anyhow::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(prefix) || !name.ends_with(LOG_SUFFIX) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let expired = meta
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age > retention);
        if expired && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Mask a credential for diagnostics: keep only the tail, enough for the
/// operator to tell which token is configured, never the value itself.
pub fn redact_credential(secret: &str) -> String {
    let secret = secret.trim();
    if secret.is_empty() {
        return String::new();
    }
    let count = secret.chars().count();
    if count < 8 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{tail}")
}

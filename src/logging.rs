//! Structured logging: console plus a daily rolling file under the data dir.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{PosError, Result};

/// Rolled log files kept on disk.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "pos";
const DEFAULT_FILTER: &str = "info,small_pos_offline=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line in the file layer; console stays text.
    Json,
}

pub fn log_dir_for(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process; dropping it flushes and stops the file writer.
pub fn init_logging(log_dir: &Path, format: LogFormat) -> Result<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fs::create_dir_all(log_dir)?;
    prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (text_file, json_file) = match format {
        LogFormat::Text => (
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true),
            ),
        ),
    };
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file)
        .with(json_file)
        .try_init()
        .map_err(|e| PosError::invalid(format!("logging already initialized: {e}")))?;

    Ok(guard)
}

/// Delete rolled log files beyond the newest [`MAX_LOG_FILES`]. Returns how
/// many were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let file = File::create(dir.join(name)).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_prune_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 0..14u64 {
            touch(dir.path(), &format!("pos.2026-01-{:02}", day + 1), (14 - day) * 86_400);
        }
        touch(dir.path(), "pos-offline.db", 30 * 86_400);

        let removed = prune_old_logs(dir.path());
        assert_eq!(removed, 4);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), MAX_LOG_FILES + 1);
        assert!(left.contains(&"pos-offline.db".to_string()));
        assert!(!left.contains(&"pos.2026-01-01".to_string()));
        assert!(left.contains(&"pos.2026-01-14".to_string()));
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prune_old_logs(&dir.path().join("nope")), 0);
    }

    #[test]
    fn test_log_dir_under_data_dir() {
        let data = Path::new("/var/lib/pos");
        assert_eq!(log_dir_for(data), PathBuf::from("/var/lib/pos/logs"));
    }
}

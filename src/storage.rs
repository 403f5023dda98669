use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;

const FORBIDDEN_NAME_CHARS: [char; 7] = ['/', '\\', '?', '*', '[', ']', ':'];

pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !FORBIDDEN_NAME_CHARS.contains(c))
        .collect()
}

pub fn store_path(cfg: &Config, organization: &str) -> PathBuf {
    cfg.tmp_csv_dir
        .join(format!("{}.csv", sanitize_name(organization)))
}

pub fn prepare_dirs(cfg: &Config) -> Result<()> {
    for dir in [&cfg.output_dir, &cfg.tmp_csv_dir, &cfg.tmp_log_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

/// Delete the intermediate stores that made it into the workbook. Stores
/// skipped during consolidation are not listed here and stay on disk as the
/// data of record. Best-effort: a locked file is a warning, never an error.
pub fn remove_stores(stores: &[PathBuf]) {
    for path in stores {
        match fs::remove_file(path) {
            Ok(()) => info!("Removed store {}", path.display()),
            Err(e) => warn!("Failed to remove store {}: {}", path.display(), e),
        }
    }
}

/// Age-based log cleanup, keyed on file modification time. Best-effort.
pub fn cleanup_old_logs(dir: &Path, retention_days: u64) {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 86_400);
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Cannot list log dir {}: {}", dir.display(), e);
            return;
        }
    };
    for path in entries.filter_map(|e| e.ok().map(|e| e.path())) {
        if !path.extension().is_some_and(|ext| ext == "log") {
            continue;
        }
        let stale = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if stale {
            match fs::remove_file(&path) {
                Ok(()) => info!("Removed stale log {}", path.display()),
                Err(e) => warn!("Failed to remove log {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_names_drop_forbidden_characters() {
        assert_eq!(sanitize_name("A/B:C?商事"), "ABC商事");
    }

    #[test]
    fn fresh_logs_survive_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("20260829.log");
        fs::write(&log, "line").unwrap();

        cleanup_old_logs(dir.path(), 10);
        assert!(log.exists());
    }

    #[test]
    fn cleanup_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        cleanup_old_logs(&dir.path().join("nope"), 10);
        remove_stores(&[dir.path().join("nope").join("org.csv")]);
    }

    #[test]
    fn remove_stores_deletes_only_listed_files() {
        let dir = tempfile::tempdir().unwrap();
        let consolidated = dir.path().join("a.csv");
        let skipped = dir.path().join("b.csv");
        fs::write(&consolidated, "a").unwrap();
        fs::write(&skipped, "b").unwrap();

        remove_stores(&[consolidated.clone()]);
        assert!(!consolidated.exists());
        assert!(skipped.exists());
    }
}

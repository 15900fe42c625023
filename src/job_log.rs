use crate::paths::{path_with_suffix, AppPaths};
use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const JOB_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const JOB_LOG_MAX_AGE_DAYS: u64 = 30;
const JOB_LOG_TOTAL_CAP_BYTES: u64 = 256 * 1024 * 1024;

/// Appends one `{ts_ms, job_id, level, event, data}` line to the job's JSONL log.
pub fn log_line(
    paths: &AppPaths,
    job_id: &str,
    level: &str,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "job_id": job_id,
        "level": level,
        "event": event,
        "data": data
    })
    .to_string();

    let path = paths.job_log_path(job_id);
    std::fs::create_dir_all(paths.job_logs_dir())?;
    rotate_if_needed(&path)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())?;
    Ok(())
}

/// Same as [`log_line`], but failures only reach the tracing log.
pub fn log_line_best_effort(
    paths: &AppPaths,
    job_id: &str,
    level: &str,
    event: &str,
    data: serde_json::Value,
) {
    if let Err(err) = log_line(paths, job_id, level, event, data) {
        tracing::debug!(job_id, event, error = %err, "job log write failed");
    }
}

fn rotate_if_needed(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };
    if len < JOB_LOG_ROTATE_BYTES {
        return Ok(());
    }

    let backup = path_with_suffix(path, ".1");
    if backup.exists() {
        std::fs::remove_file(&backup)?;
    }
    std::fs::rename(path, backup)?;
    Ok(())
}

/// Drops job logs older than the retention window, then the oldest ones until under the size cap.
pub fn prune_job_logs(paths: &AppPaths) -> Result<usize> {
    let dir = paths.job_logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(JOB_LOG_MAX_AGE_DAYS * 24 * 60 * 60))
        .unwrap_or(UNIX_EPOCH);
    prune_dir(&dir, cutoff, JOB_LOG_TOTAL_CAP_BYTES)
}

fn prune_dir(dir: &Path, cutoff: SystemTime, total_cap: u64) -> Result<usize> {
    let mut removed = 0_usize;
    let mut kept: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let path = entry.path();
        if modified < cutoff {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            continue;
        }
        kept.push((path, modified, meta.len()));
    }

    kept.sort_by_key(|(_, modified, _)| *modified);
    let mut total: u64 = kept.iter().map(|(_, _, size)| *size).sum();
    for (path, _, size) in kept {
        if total <= total_cap {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
        total = total.saturating_sub(size);
    }
    Ok(removed)
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

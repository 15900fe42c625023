use crate::history::WEEKDAY_LABELS;
use crate::jobs::{Job, JobState};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyActivity {
    pub name: String,
    pub downloads: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub active_count: usize,
    pub current_throughput: String,
    pub weekly_activity: Vec<DailyActivity>,
}

pub fn compute_stats(jobs: &[Job], daily_activity: &BTreeMap<String, u64>) -> EngineStats {
    let running: Vec<&Job> = jobs
        .iter()
        .filter(|job| job.state == JobState::Running)
        .collect();
    // An empty f64 `sum` is -0.0.
    let total = running
        .iter()
        .filter_map(|job| speed_to_bytes_per_sec(&job.speed))
        .fold(0.0_f64, |acc, v| acc + v);

    EngineStats {
        active_count: running.len(),
        current_throughput: format_throughput(total),
        weekly_activity: weekly_activity(daily_activity),
    }
}

pub fn weekly_activity(daily_activity: &BTreeMap<String, u64>) -> Vec<DailyActivity> {
    WEEKDAY_LABELS
        .iter()
        .map(|day| DailyActivity {
            name: day.to_string(),
            downloads: daily_activity.get(*day).copied().unwrap_or(0),
        })
        .collect()
}

/// `"1.5MiB/s"`, `"300KB/s"`, `"12 B/s"` -> bytes per second. Units are binary
/// regardless of the `i` marker.
pub fn speed_to_bytes_per_sec(speed: &str) -> Option<f64> {
    static SPEED_RE: OnceLock<Regex> = OnceLock::new();
    let re = SPEED_RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*([A-Za-z]+)/s").unwrap());
    let caps = re.captures(speed)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let multiplier = match unit.chars().next() {
        Some('k') => KIB,
        Some('m') => MIB,
        Some('g') => GIB,
        _ => 1.0,
    };
    Some(value * multiplier)
}

pub fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= GIB {
        format!("{:.1}GiB/s", bytes_per_sec / GIB)
    } else if bytes_per_sec >= MIB {
        format!("{:.1}MiB/s", bytes_per_sec / MIB)
    } else if bytes_per_sec >= KIB {
        format!("{:.1}KiB/s", bytes_per_sec / KIB)
    } else if bytes_per_sec > 0.0 {
        format!("{bytes_per_sec:.0}B/s")
    } else {
        "0B/s".to_string()
    }
}

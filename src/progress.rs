//! Progress scraping for the fetcher's `--newline` output.
//!
//! The only contract the rest of the crate relies on is [`parse_progress_line`]:
//! one raw line in, a structured event or `None` out. Lines without a
//! `[download] NN.N%` anchor are informational chatter, never errors.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Placeholder for fields absent from an otherwise valid progress line.
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub percent: f64,
    pub speed: String,
    pub eta: String,
    pub total_size: String,
}

struct ProgressPatterns {
    percent: Regex,
    speed: Regex,
    eta: Regex,
    total_size: Regex,
}

fn patterns() -> &'static ProgressPatterns {
    static PATTERNS: OnceLock<ProgressPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ProgressPatterns {
        percent: Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").unwrap(),
        speed: Regex::new(r"\bat\s+~?\s*(\d+(?:\.\d+)?[A-Za-z]+/s)").unwrap(),
        eta: Regex::new(r"\bETA\s+(\d+(?::\d+)+)").unwrap(),
        total_size: Regex::new(r"\bof\s+~?\s*(\d+(?:\.\d+)?[A-Za-z]+)\b").unwrap(),
    })
}

pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let p = patterns();
    let percent: f64 = p.percent.captures(line)?.get(1)?.as_str().parse().ok()?;

    let capture = |re: &Regex| {
        re.captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    };

    Some(ProgressEvent {
        percent,
        speed: capture(&p.speed),
        eta: capture(&p.eta),
        total_size: capture(&p.total_size),
    })
}

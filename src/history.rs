use crate::db;
use crate::paths::AppPaths;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, Weekday};

const KEY_HISTORY: &str = "history";
const KEY_DAILY_ACTIVITY: &str = "daily_activity";

/// Monday-first weekday labels used as activity counter keys.
pub const WEEKDAY_LABELS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub thumbnail: String,
    pub format: String,
    pub quality: String,
    pub size: String,
    /// RFC 3339 time of the terminal transition.
    pub date: String,
    pub status: HistoryStatus,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct HistoryState {
    history: Vec<HistoryEntry>,
    daily_activity: BTreeMap<String, u64>,
}

/// Persisted history list and weekday activity counters.
///
/// All mutations go through one mutex: the store rewrites whole collections,
/// so concurrent writers would otherwise lose updates. A failed write leaves
/// the in-memory change in place and reports the error to the caller.
#[derive(Debug)]
pub struct HistoryStore {
    paths: AppPaths,
    state: Mutex<HistoryState>,
}

impl HistoryStore {
    pub fn open(paths: &AppPaths) -> Result<Self> {
        let conn = db::open_migrated(paths)?;
        let history = match db::kv_get(&conn, KEY_HISTORY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        let daily_activity = match db::kv_get(&conn, KEY_DAILY_ACTIVITY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            paths: paths.clone(),
            state: Mutex::new(HistoryState {
                history,
                daily_activity,
            }),
        })
    }

    /// Most recent first.
    pub fn list(&self) -> Vec<HistoryEntry> {
        self.lock().history.clone()
    }

    pub fn append(&self, entry: HistoryEntry) -> Result<()> {
        let mut state = self.lock();
        state.history.insert(0, entry);
        self.persist(&state)
    }

    /// Appends a completed entry and bumps the counter for `weekday` in one write.
    pub fn record_completion(&self, entry: HistoryEntry, weekday: Weekday) -> Result<()> {
        let mut state = self.lock();
        state.history.insert(0, entry);
        *state
            .daily_activity
            .entry(weekday_label(weekday).to_string())
            .or_insert(0) += 1;
        self.persist(&state)
    }

    /// Empties the history list. Activity counters are left alone.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        state.history.clear();
        self.persist(&state)
    }

    pub fn reset_activity(&self) -> Result<()> {
        let mut state = self.lock();
        state.daily_activity.clear();
        self.persist(&state)
    }

    pub fn daily_activity(&self) -> BTreeMap<String, u64> {
        self.lock().daily_activity.clone()
    }

    fn persist(&self, state: &HistoryState) -> Result<()> {
        let history = serde_json::to_string(&state.history)?;
        let activity = serde_json::to_string(&state.daily_activity)?;
        let mut conn = db::open_migrated(&self.paths)?;
        let tx = conn.transaction()?;
        db::kv_set(&tx, KEY_HISTORY, &history)?;
        db::kv_set(&tx, KEY_DAILY_ACTIVITY, &activity)?;
        tx.commit()?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub fn weekday_label(weekday: Weekday) -> &'static str {
    WEEKDAY_LABELS[weekday.number_days_from_monday() as usize]
}

/// Local weekday, or the UTC one when the local offset cannot be determined.
pub fn today_weekday() -> Weekday {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .weekday()
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

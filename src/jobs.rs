use crate::cmd::{command, kill_child_process_tree, EXTERNAL_CMD_POLL_INTERVAL_MS};
use crate::config::EngineConfig;
use crate::events::Subscribers;
use crate::history::{now_rfc3339, today_weekday, HistoryEntry, HistoryStatus, HistoryStore};
use crate::job_log::{log_line_best_effort, now_ms, prune_job_logs};
use crate::paths::{path_with_suffix, AppPaths};
use crate::progress::{parse_progress_line, ProgressEvent, UNKNOWN};
use crate::tools::{FetcherTool, TranscoderResolver, FETCHER_TOOL};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const COMPLETED_FALLBACK_NAME: &str = "download";
const GENERIC_FAILURE: &str = "Download failed";
const PARTIAL_SUFFIXES: [&str; 2] = [".part", ".ytdl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// A paused process can still be reaped with a final status, so `Paused`
    /// may end in `Completed` or `Failed` as well as `Cancelled`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EncodingSelector {
    /// A fetcher format token such as `137+140`.
    Format(String),
    BestAudio,
    BestVideoAudio,
}

/// Labels carried through to history; never interpreted by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayMetadata {
    pub title: String,
    pub thumbnail: String,
    pub format_label: String,
    pub quality_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub url: String,
    pub encoding: EncodingSelector,
    pub output_directory: PathBuf,
    #[serde(default)]
    pub output_filename: Option<String>,
    #[serde(default)]
    pub display: DisplayMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub source_url: String,
    pub title: String,
    pub thumbnail: String,
    pub encoding: EncodingSelector,
    pub output_directory: PathBuf,
    pub output_filename: Option<String>,
    pub state: JobState,
    pub progress_percent: f64,
    pub speed: String,
    pub eta: String,
    pub total_size: String,
    pub error_detail: Option<String>,
    pub created_at_ms: i64,
}

impl Job {
    pub fn new(id: String, request: JobRequest) -> Self {
        Self {
            id,
            source_url: request.url,
            title: request.display.title,
            thumbnail: request.display.thumbnail,
            encoding: request.encoding,
            output_directory: request.output_directory,
            output_filename: request.output_filename,
            state: JobState::Queued,
            progress_percent: 0.0,
            speed: UNKNOWN.to_string(),
            eta: UNKNOWN.to_string(),
            total_size: UNKNOWN.to_string(),
            error_detail: None,
            created_at_ms: now_ms(),
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Out-of-order percentages are kept as reported.
    pub fn apply_progress(&mut self, progress: &ProgressEvent) {
        self.progress_percent = progress.percent;
        self.speed = progress.speed.clone();
        self.eta = progress.eta.clone();
        self.total_size = progress.total_size.clone();
    }

    /// Path reported on completion; the fetcher picks the name when none was given.
    pub fn output_path(&self) -> PathBuf {
        self.output_directory.join(
            self.output_filename
                .as_deref()
                .unwrap_or(COMPLETED_FALLBACK_NAME),
        )
    }

    fn history_title(&self) -> String {
        self.output_filename
            .as_deref()
            .and_then(|name| Path::new(name).file_stem())
            .map(|stem| stem.to_string_lossy().to_string())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        id: String,
        #[serde(flatten)]
        progress: ProgressEvent,
    },
    Completed {
        id: String,
        output_path: PathBuf,
    },
    Failed {
        id: String,
        error_detail: String,
    },
    Cancelled {
        id: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::Cancelled { id } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Returned by [`JobSupervisor::submit`]. The channel carries this job's
/// events in emission order and disconnects after its terminal event.
#[derive(Debug)]
pub struct JobHandle {
    pub id: String,
    pub events: Receiver<JobEvent>,
}

/// Rejects anything that is not an absolute http(s) URL.
pub fn normalize_source_url(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidUrl("empty URL provided".to_string()));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|err| EngineError::InvalidUrl(format!("{trimmed}: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(trimmed.to_string()),
        other => Err(EngineError::InvalidUrl(format!(
            "unsupported URL scheme {other}; only http/https are allowed"
        ))),
    }
}

/// Argument vector for one download, excluding the program itself.
pub fn build_fetcher_args(
    request: &JobRequest,
    transcoder_dir: Option<&Path>,
    config: &EngineConfig,
) -> Vec<OsString> {
    let output = request.output_directory.join(
        request
            .output_filename
            .as_deref()
            .unwrap_or(DEFAULT_OUTPUT_TEMPLATE),
    );

    let mut args: Vec<OsString> = vec![
        "--newline".into(),
        "--no-playlist".into(),
        "--merge-output-format".into(),
        config.merge_output_format.clone().into(),
        "-o".into(),
        output.into_os_string(),
    ];
    if let Some(dir) = transcoder_dir {
        args.push("--ffmpeg-location".into());
        args.push(dir.as_os_str().to_os_string());
    }
    match &request.encoding {
        EncodingSelector::BestAudio => {
            args.push("-x".into());
            args.push("--audio-format".into());
            args.push(config.audio_format.clone().into());
        }
        EncodingSelector::Format(token) => {
            args.push("-f".into());
            args.push(token.into());
        }
        EncodingSelector::BestVideoAudio => {
            args.push("-f".into());
            args.push("bestvideo+bestaudio/best".into());
        }
    }
    args.push(request.url.clone().into());
    args
}

#[derive(Debug)]
struct JobEntry {
    seq: u64,
    job: Job,
    request: JobRequest,
    child: Option<Child>,
    events: Option<Sender<JobEvent>>,
}

#[derive(Debug, Default)]
struct Registry {
    jobs: HashMap<String, JobEntry>,
    queue: VecDeque<String>,
    used_ids: HashSet<String>,
    next_seq: u64,
}

impl Registry {
    /// Paused jobs keep their slot.
    fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|e| matches!(e.job.state, JobState::Running | JobState::Paused))
            .count()
    }
}

/// Work left after a terminal transition, done outside the registry lock.
struct Terminal {
    event: JobEvent,
    history: HistoryEntry,
    counts_activity: bool,
    sender: Option<Sender<JobEvent>>,
}

#[derive(Debug)]
struct Shared {
    paths: AppPaths,
    config: EngineConfig,
    fetcher: Arc<FetcherTool>,
    transcoder: Arc<TranscoderResolver>,
    history: Arc<HistoryStore>,
    registry: Mutex<Registry>,
    events: Subscribers<JobEvent>,
}

impl Shared {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Owns every live job and its fetcher process.
///
/// Each started job gets a monitor thread that reads the fetcher's stdout,
/// then polls the child for its exit status under short registry locks.
/// At most `max_concurrent_jobs` jobs are running or paused; the rest wait
/// in FIFO order.
#[derive(Debug, Clone)]
pub struct JobSupervisor {
    shared: Arc<Shared>,
}

impl JobSupervisor {
    pub fn new(
        paths: AppPaths,
        config: EngineConfig,
        fetcher: Arc<FetcherTool>,
        transcoder: Arc<TranscoderResolver>,
        history: Arc<HistoryStore>,
    ) -> Self {
        let prune_paths = paths.clone();
        thread::spawn(move || match prune_job_logs(&prune_paths) {
            Ok(removed) if removed > 0 => tracing::debug!(removed, "pruned job logs"),
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "job log pruning failed"),
        });

        Self {
            shared: Arc::new(Shared {
                paths,
                config,
                fetcher,
                transcoder,
                history,
                registry: Mutex::new(Registry::default()),
                events: Subscribers::new(),
            }),
        }
    }

    /// Queues a job and starts it when a slot is free. An empty `id` gets a
    /// generated one; ids are never reused within a supervisor's lifetime.
    pub fn submit(&self, id: &str, mut request: JobRequest) -> Result<JobHandle> {
        request.url = normalize_source_url(&request.url)?;
        let id = match id.trim() {
            "" => uuid::Uuid::new_v4().to_string(),
            given => given.to_string(),
        };

        let (tx, rx) = channel();
        {
            let mut reg = self.shared.lock_registry();
            if !reg.used_ids.insert(id.clone()) {
                return Err(EngineError::DuplicateJob(id));
            }
            let seq = reg.next_seq;
            reg.next_seq += 1;
            reg.jobs.insert(
                id.clone(),
                JobEntry {
                    seq,
                    job: Job::new(id.clone(), request.clone()),
                    request: request.clone(),
                    child: None,
                    events: Some(tx),
                },
            );
            reg.queue.push_back(id.clone());
        }

        log_line_best_effort(
            &self.shared.paths,
            &id,
            "info",
            "queued",
            serde_json::json!({ "url": request.url, "encoding": request.encoding }),
        );
        tracing::info!(job_id = %id, "job queued");

        launch_ready_jobs(&self.shared);
        Ok(JobHandle { id, events: rx })
    }

    /// Cancels a queued, running or paused job and forgets it.
    ///
    /// Returns false for unknown ids. A failed record is dropped as well, but
    /// also reports false since nothing was running.
    pub fn cancel(&self, id: &str) -> bool {
        let mut entry = {
            let mut reg = self.shared.lock_registry();
            let Some(entry) = reg.jobs.remove(id) else {
                return false;
            };
            reg.queue.retain(|queued| queued != id);
            entry
        };
        if entry.job.transition(JobState::Cancelled).is_err() {
            return false;
        }

        if let Some(mut child) = entry.child.take() {
            kill_child_process_tree(&mut child);
        }
        if let Some(name) = entry.job.output_filename.as_deref() {
            remove_partial_files(&entry.job.output_directory.join(name));
        }

        log_line_best_effort(&self.shared.paths, id, "info", "cancel", serde_json::json!({}));
        tracing::info!(job_id = %id, "job cancelled");

        let event = JobEvent::Cancelled { id: id.to_string() };
        self.shared.events.publish(event.clone());
        if let Some(tx) = entry.events.take() {
            let _ = tx.send(event);
        }

        launch_ready_jobs(&self.shared);
        true
    }

    /// Kills every live process. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let reg = self.shared.lock_registry();
            reg.jobs
                .values()
                .filter(|e| !e.job.state.is_terminal())
                .map(|e| e.job.id.clone())
                .collect()
        };
        // Drain the queue first so cancelling a running job does not start the next one.
        let mut queued = Vec::new();
        let mut running = Vec::new();
        for id in ids {
            let is_queued = self
                .get(&id)
                .map(|job| job.state == JobState::Queued)
                .unwrap_or(false);
            if is_queued {
                queued.push(id);
            } else {
                running.push(id);
            }
        }
        queued
            .iter()
            .chain(running.iter())
            .filter(|id| self.cancel(id))
            .count()
    }

    pub fn pause(&self, id: &str) -> Result<()> {
        self.signal(id, JobState::Paused)
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        self.signal(id, JobState::Running)
    }

    fn signal(&self, id: &str, next: JobState) -> Result<()> {
        {
            let mut reg = self.shared.lock_registry();
            let entry = reg
                .jobs
                .get_mut(id)
                .ok_or_else(|| EngineError::UnknownJob(id.to_string()))?;
            let from = entry.job.state;
            let invalid = || EngineError::InvalidTransition {
                id: id.to_string(),
                from: from.as_str(),
                to: next.as_str(),
            };
            if from == JobState::Queued || !from.can_transition_to(next) {
                return Err(invalid());
            }
            let child = entry.child.as_ref().ok_or_else(invalid)?;
            set_process_suspended(child, next == JobState::Paused)?;
            entry.job.transition(next)?;
        }
        log_line_best_effort(
            &self.shared.paths,
            id,
            "info",
            if next == JobState::Paused { "pause" } else { "resume" },
            serde_json::json!({}),
        );
        Ok(())
    }

    /// Drops a failed job and hands back its request so the caller can
    /// submit it again under a fresh id.
    pub fn retry(&self, id: &str) -> Result<JobRequest> {
        self.take_failed(id, JobState::Queued)
            .map(|entry| entry.request)
    }

    /// Drops a failed job from the live list.
    pub fn dismiss(&self, id: &str) -> Result<()> {
        self.take_failed(id, JobState::Cancelled).map(|_| ())
    }

    fn take_failed(&self, id: &str, to: JobState) -> Result<JobEntry> {
        let mut reg = self.shared.lock_registry();
        let state = reg
            .jobs
            .get(id)
            .map(|e| e.job.state)
            .ok_or_else(|| EngineError::UnknownJob(id.to_string()))?;
        if state != JobState::Failed {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from: state.as_str(),
                to: to.as_str(),
            });
        }
        reg.jobs
            .remove(id)
            .ok_or_else(|| EngineError::UnknownJob(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.shared
            .lock_registry()
            .jobs
            .get(id)
            .map(|e| e.job.clone())
    }

    /// Submission order.
    pub fn list_jobs(&self) -> Vec<Job> {
        let reg = self.shared.lock_registry();
        let mut entries: Vec<&JobEntry> = reg.jobs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Events for every job, across their lifetimes.
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.shared.events.subscribe()
    }
}

fn launch_ready_jobs(shared: &Arc<Shared>) {
    let cap = shared.config.effective_max_concurrent_jobs();
    loop {
        let program = shared.fetcher.locate();
        let transcoder_dir = shared.transcoder.location();

        let (id, outcome) = {
            let mut reg = shared.lock_registry();
            if reg.active_count() >= cap {
                return;
            }
            let Some(id) = reg.queue.pop_front() else {
                return;
            };
            let Some(entry) = reg.jobs.get_mut(&id) else {
                continue;
            };
            if entry.job.transition(JobState::Running).is_err() {
                continue;
            }

            let args = build_fetcher_args(&entry.request, transcoder_dir.as_deref(), &shared.config);
            let mut cmd = command(&program);
            cmd.args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let outcome = match cmd.spawn() {
                Ok(mut child) => match (child.stdout.take(), child.stderr.take()) {
                    (Some(stdout), Some(stderr)) => {
                        entry.child = Some(child);
                        Ok((args, stdout, stderr))
                    }
                    _ => {
                        kill_child_process_tree(&mut child);
                        Err(fail_entry(entry, "fetcher output pipes missing".to_string()))
                    }
                },
                Err(err) => {
                    let detail = if err.kind() == std::io::ErrorKind::NotFound {
                        EngineError::ExternalToolMissing {
                            tool: FETCHER_TOOL.to_string(),
                        }
                        .to_string()
                    } else {
                        format!("failed to start {FETCHER_TOOL}: {err}")
                    };
                    Err(fail_entry(entry, detail))
                }
            };
            (id, outcome)
        };

        match outcome {
            Ok((args, stdout, stderr)) => {
                let args: Vec<String> = args
                    .iter()
                    .map(|a| a.to_string_lossy().to_string())
                    .collect();
                log_line_best_effort(
                    &shared.paths,
                    &id,
                    "info",
                    "start",
                    serde_json::json!({ "program": program.to_string_lossy(), "args": args }),
                );
                tracing::info!(job_id = %id, tool = FETCHER_TOOL, "job started");

                let worker = Arc::clone(shared);
                thread::spawn(move || monitor_job(worker, id, stdout, stderr));
            }
            Err(terminal) => {
                tracing::warn!(job_id = %id, tool = FETCHER_TOOL, "job failed to start");
                if let Some(terminal) = terminal {
                    deliver_terminal(shared, terminal);
                }
            }
        }
    }
}

fn monitor_job(shared: Arc<Shared>, id: String, stdout: ChildStdout, stderr: ChildStderr) {
    let stderr_paths = shared.paths.clone();
    let stderr_id = id.clone();
    let stderr_handle = thread::spawn(move || collect_stderr(&stderr_paths, &stderr_id, stderr));

    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for line in text.split('\r') {
                    handle_stdout_line(&shared, &id, line.trim_end());
                }
            }
        }
    }

    let stderr_text = stderr_handle.join().unwrap_or_default();

    let terminal = loop {
        {
            let mut reg = shared.lock_registry();
            let Some(entry) = reg.jobs.get_mut(&id) else {
                return;
            };
            let Some(child) = entry.child.as_mut() else {
                return;
            };
            let polled = child.try_wait();
            let status = match polled {
                Ok(Some(status)) => Ok(status),
                Ok(None) => Err(None),
                Err(err) => {
                    kill_child_process_tree(child);
                    Err(Some(err))
                }
            };
            match status {
                Ok(status) => {
                    log_line_best_effort(
                        &shared.paths,
                        &id,
                        if status.success() { "info" } else { "error" },
                        "exit",
                        serde_json::json!({ "code": status.code() }),
                    );
                    if status.success() {
                        break complete_entry(&mut reg, &id);
                    }
                    let detail = failure_detail(&stderr_text);
                    break reg.jobs.get_mut(&id).and_then(|e| fail_entry(e, detail));
                }
                Err(Some(err)) => {
                    let detail = format!("failed to wait for {FETCHER_TOOL}: {err}");
                    break reg.jobs.get_mut(&id).and_then(|e| fail_entry(e, detail));
                }
                Err(None) => {}
            }
        }
        thread::sleep(Duration::from_millis(EXTERNAL_CMD_POLL_INTERVAL_MS));
    };

    if let Some(terminal) = terminal {
        deliver_terminal(&shared, terminal);
    }
    launch_ready_jobs(&shared);
}

fn handle_stdout_line(shared: &Shared, id: &str, line: &str) {
    match parse_progress_line(line) {
        Some(progress) => {
            let sender = {
                let mut reg = shared.lock_registry();
                let Some(entry) = reg.jobs.get_mut(id) else {
                    return;
                };
                entry.job.apply_progress(&progress);
                entry.events.clone()
            };
            let event = JobEvent::Progress {
                id: id.to_string(),
                progress,
            };
            shared.events.publish(event.clone());
            if let Some(tx) = sender {
                let _ = tx.send(event);
            }
        }
        None if !line.trim().is_empty() => {
            log_line_best_effort(&shared.paths, id, "info", "stdout", serde_json::json!({ "line": line }));
        }
        None => {}
    }
}

fn collect_stderr(paths: &AppPaths, job_id: &str, stderr: ChildStderr) -> String {
    let mut collected = String::new();
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                log_line_best_effort(
                    paths,
                    job_id,
                    "warn",
                    "stderr",
                    serde_json::json!({ "line": line.trim_end() }),
                );
                collected.push_str(&line);
            }
        }
    }
    collected
}

fn failure_detail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        GENERIC_FAILURE.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Completed jobs leave the registry.
fn complete_entry(reg: &mut Registry, id: &str) -> Option<Terminal> {
    reg.jobs.get_mut(id)?.job.transition(JobState::Completed).ok()?;
    let mut entry = reg.jobs.remove(id)?;
    entry.child = None;
    let output_path = entry.job.output_path();
    Some(Terminal {
        history: history_entry(&entry, HistoryStatus::Completed, None),
        event: JobEvent::Completed {
            id: id.to_string(),
            output_path,
        },
        counts_activity: true,
        sender: entry.events.take(),
    })
}

/// Failed jobs stay listed with their error until dismissed.
fn fail_entry(entry: &mut JobEntry, detail: String) -> Option<Terminal> {
    entry.job.transition(JobState::Failed).ok()?;
    entry.child = None;
    entry.job.error_detail = Some(detail.clone());
    Some(Terminal {
        history: history_entry(entry, HistoryStatus::Failed, Some(detail.clone())),
        event: JobEvent::Failed {
            id: entry.job.id.clone(),
            error_detail: detail,
        },
        counts_activity: false,
        sender: entry.events.take(),
    })
}

fn history_entry(entry: &JobEntry, status: HistoryStatus, error: Option<String>) -> HistoryEntry {
    let label = |value: &str| {
        if value.trim().is_empty() {
            UNKNOWN.to_string()
        } else {
            value.to_string()
        }
    };
    HistoryEntry {
        id: entry.job.id.clone(),
        title: entry.job.history_title(),
        url: entry.job.source_url.clone(),
        thumbnail: entry.job.thumbnail.clone(),
        format: label(&entry.request.display.format_label),
        quality: label(&entry.request.display.quality_label),
        size: entry.job.total_size.clone(),
        date: now_rfc3339(),
        status,
        path: entry.job.output_path().to_string_lossy().to_string(),
        error,
    }
}

/// Persists before notifying. Global subscribers hear of the event before the job's own channel.
fn deliver_terminal(shared: &Shared, terminal: Terminal) {
    let Terminal {
        event,
        history,
        counts_activity,
        sender,
    } = terminal;

    let persisted = if counts_activity {
        shared.history.record_completion(history, today_weekday())
    } else {
        shared.history.append(history)
    };
    if let Err(err) = persisted {
        tracing::warn!(job_id = %event.job_id(), error = %err, "failed to persist job history");
    }

    match &event {
        JobEvent::Completed { id, output_path } => {
            tracing::info!(job_id = %id, path = %output_path.display(), "job completed")
        }
        JobEvent::Failed { id, .. } => tracing::warn!(job_id = %id, "job failed"),
        _ => {}
    }

    shared.events.publish(event.clone());
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}

fn remove_partial_files(output: &Path) {
    for suffix in PARTIAL_SUFFIXES {
        let partial = path_with_suffix(output, suffix);
        match std::fs::remove_file(&partial) {
            Ok(()) => tracing::debug!(path = %partial.display(), "removed partial download"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %partial.display(), error = %err, "failed to remove partial download"),
        }
    }
}

#[cfg(unix)]
fn set_process_suspended(child: &Child, suspended: bool) -> Result<()> {
    let signal = if suspended { libc::SIGSTOP } else { libc::SIGCONT };
    // The fetcher leads its own process group, so `-pid` also reaches the
    // ffmpeg it spawns for merging.
    // SAFETY: kill(2) only reads its arguments; the pid belongs to a child we have not reaped.
    let rc = unsafe { libc::kill(-(child.id() as libc::pid_t), signal) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_process_suspended(_child: &Child, _suspended: bool) -> Result<()> {
    Err(EngineError::Unsupported(
        "pausing a running download is only supported on Unix".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(encoding: EncodingSelector, filename: Option<&str>) -> JobRequest {
        JobRequest {
            url: "https://www.youtube.com/watch?v=abc".to_string(),
            encoding,
            output_directory: PathBuf::from("/downloads"),
            output_filename: filename.map(str::to_string),
            display: DisplayMetadata::default(),
        }
    }

    fn as_strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn default_args_merge_best_video_and_audio() {
        let args = build_fetcher_args(
            &request(EncodingSelector::BestVideoAudio, None),
            None,
            &EngineConfig::default(),
        );
        let out = PathBuf::from("/downloads").join(DEFAULT_OUTPUT_TEMPLATE);
        assert_eq!(
            as_strings(&args),
            vec![
                "--newline".to_string(),
                "--no-playlist".to_string(),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
                "-o".to_string(),
                out.to_string_lossy().to_string(),
                "-f".to_string(),
                "bestvideo+bestaudio/best".to_string(),
                "https://www.youtube.com/watch?v=abc".to_string(),
            ]
        );
    }

    #[test]
    fn audio_extraction_and_transcoder_location() {
        let mut config = EngineConfig::default();
        config.audio_format = "opus".to_string();
        let args = as_strings(&build_fetcher_args(
            &request(EncodingSelector::BestAudio, Some("song.opus")),
            Some(Path::new("/opt/ffmpeg/bin")),
            &config,
        ));
        let location = args.iter().position(|a| a == "--ffmpeg-location").expect("location flag");
        assert_eq!(args[location + 1], "/opt/ffmpeg/bin");
        let extract = args.iter().position(|a| a == "-x").expect("extract flag");
        assert_eq!(args[extract + 1..extract + 3], ["--audio-format", "opus"]);
        assert!(!args.iter().any(|a| a == "-f"));
        assert!(args.contains(&PathBuf::from("/downloads").join("song.opus").to_string_lossy().to_string()));
    }

    #[test]
    fn explicit_format_token_is_passed_through() {
        let args = as_strings(&build_fetcher_args(
            &request(EncodingSelector::Format("137+140".to_string()), None),
            None,
            &EngineConfig::default(),
        ));
        let f = args.iter().position(|a| a == "-f").expect("format flag");
        assert_eq!(args[f + 1], "137+140");
        assert_eq!(args.last().map(String::as_str), Some("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn state_machine_edges() {
        use JobState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Paused));
        assert!(!Queued.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Running, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }

        let mut job = Job::new("j".to_string(), request(EncodingSelector::BestAudio, None));
        let err = job.transition(Completed).expect_err("queued cannot complete");
        assert!(matches!(
            err,
            EngineError::InvalidTransition { from: "queued", to: "completed", .. }
        ));
    }

    #[test]
    fn history_title_strips_extension() {
        let job = Job::new(
            "j".to_string(),
            request(EncodingSelector::BestVideoAudio, Some("My.Clip.mp4")),
        );
        assert_eq!(job.history_title(), "My.Clip");
        assert_eq!(job.output_path(), PathBuf::from("/downloads").join("My.Clip.mp4"));

        let unnamed = Job::new("k".to_string(), request(EncodingSelector::BestVideoAudio, None));
        assert_eq!(unnamed.history_title(), UNKNOWN);
        assert_eq!(unnamed.output_path(), PathBuf::from("/downloads").join("download"));
    }

    #[test]
    fn source_urls_must_be_http() {
        assert!(normalize_source_url(" https://example.com/v ").is_ok());
        for bad in ["", "not a url", "ftp://example.com/file", "file:///etc/passwd"] {
            assert!(
                matches!(normalize_source_url(bad), Err(EngineError::InvalidUrl(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::locator::BinaryLocator;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        const WAIT: Duration = Duration::from_secs(15);

        struct Fixture {
            _dir: tempfile::TempDir,
            out_dir: PathBuf,
            history: Arc<HistoryStore>,
            supervisor: JobSupervisor,
        }

        fn fixture(script_body: &str, max_concurrent_jobs: usize) -> Fixture {
            let dir = tempfile::tempdir().expect("tempdir");
            let bin_dir = dir.path().join("bin");
            std::fs::create_dir_all(&bin_dir).expect("bin dir");
            let script = bin_dir.join("mf-test-fetcher");
            std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).expect("write script");
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

            let paths = AppPaths::new(dir.path().join("app"));
            let fetcher = FetcherTool::new(BinaryLocator::new("mf-test-fetcher", "--version", vec![bin_dir]));
            let transcoder = TranscoderResolver::new(
                paths.clone(),
                BinaryLocator::new("mf-test-ffmpeg", "-version", vec![]),
                None,
            );
            let history = Arc::new(HistoryStore::open(&paths).expect("history"));
            let config = EngineConfig {
                max_concurrent_jobs,
                ..EngineConfig::default()
            };
            let out_dir = dir.path().join("out");
            std::fs::create_dir_all(&out_dir).expect("out dir");
            let supervisor = JobSupervisor::new(
                paths,
                config,
                Arc::new(fetcher),
                Arc::new(transcoder),
                Arc::clone(&history),
            );
            Fixture {
                _dir: dir,
                out_dir,
                history,
                supervisor,
            }
        }

        fn req(fx: &Fixture, filename: Option<&str>) -> JobRequest {
            JobRequest {
                url: "https://example.com/watch?v=abc".to_string(),
                encoding: EncodingSelector::BestVideoAudio,
                output_directory: fx.out_dir.clone(),
                output_filename: filename.map(str::to_string),
                display: DisplayMetadata {
                    format_label: "MP4".to_string(),
                    quality_label: "1080p".to_string(),
                    ..DisplayMetadata::default()
                },
            }
        }

        fn wait_terminal(handle: &JobHandle) -> (Vec<JobEvent>, JobEvent) {
            let mut progress = Vec::new();
            loop {
                let event = handle.events.recv_timeout(WAIT).expect("job event");
                if event.is_terminal() {
                    return (progress, event);
                }
                progress.push(event);
            }
        }

        fn wait_for_state(supervisor: &JobSupervisor, id: &str, state: JobState) {
            let started = Instant::now();
            while started.elapsed() < WAIT {
                if supervisor.get(id).map(|j| j.state) == Some(state) {
                    return;
                }
                thread::sleep(Duration::from_millis(20));
            }
            panic!("job {id} never reached {state:?}");
        }

        #[test]
        fn successful_job_streams_progress_then_records_history() {
            let fx = fixture(
                concat!(
                    "echo '[youtube] abc: Downloading webpage'\n",
                    "echo '[download]  10.0% of 5.00MiB at 1.00MiB/s ETA 00:04'\n",
                    "echo '[download]  55.5% of 5.00MiB at 2.00MiB/s ETA 00:02'\n",
                    "echo '[download] 100% of 5.00MiB in 00:03'\n",
                    "exit 0"
                ),
                4,
            );
            let global = fx.supervisor.subscribe();
            let handle = fx.supervisor.submit("job-1", req(&fx, Some("clip.mp4"))).expect("submit");

            let (progress, done) = wait_terminal(&handle);
            let percents: Vec<f64> = progress
                .iter()
                .map(|e| match e {
                    JobEvent::Progress { progress, .. } => progress.percent,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert_eq!(percents, vec![10.0, 55.5, 100.0]);
            assert_eq!(
                done,
                JobEvent::Completed {
                    id: "job-1".to_string(),
                    output_path: fx.out_dir.join("clip.mp4"),
                }
            );
            assert!(handle.events.recv_timeout(WAIT).is_err(), "channel torn down");

            assert!(fx.supervisor.list_jobs().is_empty());
            let history = fx.history.list();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].title, "clip");
            assert_eq!(history[0].status, HistoryStatus::Completed);
            assert_eq!(history[0].size, "5.00MiB");
            assert_eq!(history[0].format, "MP4");
            let total: u64 = fx.history.daily_activity().values().sum();
            assert_eq!(total, 1);

            let seen: Vec<JobEvent> = global.try_iter().collect();
            assert_eq!(seen.len(), 4);
        }

        #[test]
        fn failing_job_keeps_error_until_retried() {
            let fx = fixture("echo 'ERROR: HTTP Error 403: Forbidden' 1>&2\nexit 3", 4);
            let handle = fx.supervisor.submit("bad", req(&fx, None)).expect("submit");

            let (_, done) = wait_terminal(&handle);
            assert_eq!(
                done,
                JobEvent::Failed {
                    id: "bad".to_string(),
                    error_detail: "ERROR: HTTP Error 403: Forbidden".to_string(),
                }
            );

            let jobs = fx.supervisor.list_jobs();
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].state, JobState::Failed);
            assert_eq!(jobs[0].error_detail.as_deref(), Some("ERROR: HTTP Error 403: Forbidden"));

            let history = fx.history.list();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].status, HistoryStatus::Failed);
            assert!(fx.history.daily_activity().is_empty());

            let original = fx.supervisor.retry("bad").expect("retry");
            assert_eq!(original.url, "https://example.com/watch?v=abc");
            assert!(fx.supervisor.list_jobs().is_empty());
            assert!(matches!(
                fx.supervisor.submit("bad", original.clone()),
                Err(EngineError::DuplicateJob(_))
            ));
        }

        #[test]
        fn silent_failure_uses_generic_detail_and_can_be_dismissed() {
            let fx = fixture("exit 1", 4);
            let handle = fx.supervisor.submit("quiet", req(&fx, None)).expect("submit");
            let (_, done) = wait_terminal(&handle);
            assert!(matches!(done, JobEvent::Failed { ref error_detail, .. } if error_detail == GENERIC_FAILURE));

            fx.supervisor.dismiss("quiet").expect("dismiss");
            assert!(fx.supervisor.get("quiet").is_none());
            assert!(matches!(fx.supervisor.dismiss("quiet"), Err(EngineError::UnknownJob(_))));
        }

        #[test]
        fn cancel_kills_process_and_removes_partials_without_history() {
            let fx = fixture("exec sleep 30", 4);
            let partial = fx.out_dir.join("movie.mp4.part");
            std::fs::write(&partial, b"partial").expect("partial");

            let handle = fx.supervisor.submit("slow", req(&fx, Some("movie.mp4"))).expect("submit");
            wait_for_state(&fx.supervisor, "slow", JobState::Running);

            assert!(fx.supervisor.cancel("slow"));
            assert!(fx.supervisor.list_jobs().is_empty());
            assert!(!partial.exists());
            assert_eq!(
                handle.events.recv_timeout(WAIT).expect("cancel event"),
                JobEvent::Cancelled { id: "slow".to_string() }
            );
            assert!(fx.history.list().is_empty());
            assert!(!fx.supervisor.cancel("slow"));
        }

        #[test]
        fn queued_jobs_start_in_order_as_slots_free() {
            let fx = fixture("exec sleep 30", 1);
            fx.supervisor.submit("first", req(&fx, None)).expect("first");
            fx.supervisor.submit("second", req(&fx, None)).expect("second");
            fx.supervisor.submit("third", req(&fx, None)).expect("third");

            wait_for_state(&fx.supervisor, "first", JobState::Running);
            assert_eq!(fx.supervisor.get("second").map(|j| j.state), Some(JobState::Queued));

            assert!(fx.supervisor.cancel("first"));
            wait_for_state(&fx.supervisor, "second", JobState::Running);
            assert_eq!(fx.supervisor.get("third").map(|j| j.state), Some(JobState::Queued));

            let ids: Vec<String> = fx.supervisor.list_jobs().into_iter().map(|j| j.id).collect();
            assert_eq!(ids, vec!["second", "third"]);
            assert_eq!(fx.supervisor.cancel_all(), 2);
        }

        #[test]
        fn pause_and_resume_signal_the_process() {
            let fx = fixture("exec sleep 30", 1);
            fx.supervisor.submit("p", req(&fx, None)).expect("submit");
            fx.supervisor.submit("waiting", req(&fx, None)).expect("submit");
            wait_for_state(&fx.supervisor, "p", JobState::Running);

            fx.supervisor.pause("p").expect("pause");
            assert_eq!(fx.supervisor.get("p").map(|j| j.state), Some(JobState::Paused));
            assert_eq!(fx.supervisor.get("waiting").map(|j| j.state), Some(JobState::Queued));
            assert!(matches!(
                fx.supervisor.pause("p"),
                Err(EngineError::InvalidTransition { .. })
            ));
            assert!(matches!(
                fx.supervisor.resume("waiting"),
                Err(EngineError::InvalidTransition { .. })
            ));

            fx.supervisor.resume("p").expect("resume");
            assert_eq!(fx.supervisor.get("p").map(|j| j.state), Some(JobState::Running));
            fx.supervisor.cancel_all();
        }

        #[test]
        fn missing_fetcher_lands_in_failed() {
            let fx = fixture("exit 0", 4);
            let supervisor = JobSupervisor::new(
                AppPaths::new(fx.out_dir.join("other-app")),
                EngineConfig::default(),
                Arc::new(FetcherTool::new(BinaryLocator::new(
                    "definitely-not-a-real-fetcher-xyz",
                    "--version",
                    vec![],
                ))),
                Arc::new(TranscoderResolver::new(
                    AppPaths::new(fx.out_dir.join("other-app")),
                    BinaryLocator::new("mf-test-ffmpeg", "-version", vec![]),
                    None,
                )),
                Arc::clone(&fx.history),
            );
            let handle = supervisor.submit("", req(&fx, None)).expect("submit");
            assert!(uuid::Uuid::parse_str(&handle.id).is_ok());
            let (_, done) = wait_terminal(&handle);
            assert!(matches!(done, JobEvent::Failed { ref error_detail, .. } if error_detail.contains("missing")));
        }

        #[test]
        fn invalid_url_is_rejected_before_queueing() {
            let fx = fixture("exit 0", 4);
            let mut bad = req(&fx, None);
            bad.url = "javascript:alert(1)".to_string();
            assert!(matches!(
                fx.supervisor.submit("x", bad),
                Err(EngineError::InvalidUrl(_))
            ));
            assert!(fx.supervisor.list_jobs().is_empty());
            fx.supervisor.submit("x", req(&fx, None)).expect("id still free");
        }
    }
}

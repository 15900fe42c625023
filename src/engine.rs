use crate::config::{load_engine_config, EngineConfig};
use crate::history::{HistoryEntry, HistoryStore};
use crate::jobs::{Job, JobEvent, JobHandle, JobRequest, JobSupervisor};
use crate::metadata::{self, MediaMetadata, PlaylistMetadata};
use crate::paths::AppPaths;
use crate::stats::{compute_stats, EngineStats};
use crate::tools::{
    FetcherStatus, FetcherTool, InstallEvent, InstallProgress, TranscoderResolver, TranscoderStatus,
};
use crate::Result;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Entry point for a presentation layer: every boundary operation of the
/// download engine, over one shared set of tools, history and jobs.
#[derive(Debug)]
pub struct Engine {
    paths: AppPaths,
    config: EngineConfig,
    fetcher: Arc<FetcherTool>,
    transcoder: Arc<TranscoderResolver>,
    history: Arc<HistoryStore>,
    supervisor: JobSupervisor,
}

impl Engine {
    /// Opens the engine rooted at `paths`, reading `config/engine.json` and
    /// resolving tools from the usual resource directories.
    pub fn open(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let config = load_engine_config(&paths)?;
        let fetcher = FetcherTool::for_app(&paths);
        let transcoder = TranscoderResolver::for_app(&paths, config.transcoder_archive_url.clone());
        Self::with_tools(paths, config, fetcher, transcoder)
    }

    pub fn with_tools(
        paths: AppPaths,
        config: EngineConfig,
        fetcher: FetcherTool,
        transcoder: TranscoderResolver,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        let fetcher = Arc::new(fetcher);
        let transcoder = Arc::new(transcoder);
        let history = Arc::new(HistoryStore::open(&paths)?);
        let supervisor = JobSupervisor::new(
            paths.clone(),
            config.clone(),
            Arc::clone(&fetcher),
            Arc::clone(&transcoder),
            Arc::clone(&history),
        );
        tracing::info!(
            base_dir = %paths.base_dir.display(),
            max_concurrent_jobs = config.effective_max_concurrent_jobs(),
            "engine opened"
        );
        Ok(Self {
            paths,
            config,
            fetcher,
            transcoder,
            history,
            supervisor,
        })
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata> {
        metadata::fetch_metadata(&self.paths, &self.fetcher, url, self.config.metadata_timeout_secs)
    }

    pub fn fetch_playlist_metadata(&self, url: &str) -> Result<PlaylistMetadata> {
        metadata::fetch_playlist_metadata(
            &self.paths,
            &self.fetcher,
            url,
            self.config.metadata_timeout_secs,
        )
    }

    pub fn submit_job(&self, id: &str, request: JobRequest) -> Result<JobHandle> {
        self.supervisor.submit(id, request)
    }

    /// True when a queued, running or paused job was cancelled.
    pub fn cancel_job(&self, id: &str) -> bool {
        self.supervisor.cancel(id)
    }

    pub fn pause_job(&self, id: &str) -> Result<()> {
        self.supervisor.pause(id)
    }

    pub fn resume_job(&self, id: &str) -> Result<()> {
        self.supervisor.resume(id)
    }

    pub fn retry_job(&self, id: &str) -> Result<JobRequest> {
        self.supervisor.retry(id)
    }

    pub fn dismiss_job(&self, id: &str) -> Result<()> {
        self.supervisor.dismiss(id)
    }

    pub fn list_active_jobs(&self) -> Vec<Job> {
        self.supervisor.list_jobs()
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.supervisor.subscribe()
    }

    pub fn list_history(&self) -> Vec<HistoryEntry> {
        self.history.list()
    }

    pub fn clear_history(&self) -> Result<()> {
        self.history.clear()
    }

    pub fn reset_activity(&self) -> Result<()> {
        self.history.reset_activity()
    }

    pub fn check_transcoder_available(&self) -> TranscoderStatus {
        self.transcoder.status()
    }

    /// Blocks until the transcoder verifies or the install fails.
    pub fn install_transcoder(
        &self,
        on_progress: impl FnMut(InstallProgress),
    ) -> Result<TranscoderStatus> {
        self.transcoder.ensure_available(on_progress)
    }

    pub fn subscribe_install(&self) -> Receiver<InstallEvent> {
        self.transcoder.subscribe()
    }

    pub fn check_fetcher_available(&self) -> FetcherStatus {
        self.fetcher.status()
    }

    pub fn get_stats(&self) -> EngineStats {
        compute_stats(&self.supervisor.list_jobs(), &self.history.daily_activity())
    }

    /// Kills every live download. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.supervisor.cancel_all();
        tracing::info!(cancelled, "engine shut down");
        cancelled
    }
}

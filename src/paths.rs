use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("store.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    pub fn job_log_path(&self, job_id: &str) -> PathBuf {
        self.job_logs_dir().join(format!("{job_id}.jsonl"))
    }

    /// Directory the transcoder is installed into when it has to be fetched.
    pub fn resources_dir(&self) -> PathBuf {
        self.base_dir.join("resources")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    pub fn transcoder_marker_path(&self) -> PathBuf {
        self.resources_dir().join("transcoder.json")
    }

    /// Resources shipped next to the running executable.
    pub fn bundled_resources_dir() -> Option<PathBuf> {
        let exe_path = std::env::current_exe().ok()?;
        exe_path.parent().map(|parent| parent.join("resources"))
    }

    pub fn cwd_resources_dir() -> Option<PathBuf> {
        std::env::current_dir().ok().map(|cwd| cwd.join("resources"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        std::fs::create_dir_all(self.resources_dir())?;
        std::fs::create_dir_all(self.cache_dir())?;
        Ok(())
    }
}

/// Platform file name for a tool, e.g. `ffmpeg` -> `ffmpeg.exe` on Windows.
pub fn executable_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}

pub fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

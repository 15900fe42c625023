use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
pub const MAX_MAX_CONCURRENT_JOBS: usize = 16;
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_jobs: usize,
    pub metadata_timeout_secs: u64,
    /// Container the fetcher merges separate video/audio streams into.
    pub merge_output_format: String,
    /// Target format for audio extraction jobs.
    pub audio_format: String,
    /// Overrides the platform default transcoder archive.
    pub transcoder_archive_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            metadata_timeout_secs: DEFAULT_METADATA_TIMEOUT_SECS,
            merge_output_format: "mp4".to_string(),
            audio_format: "mp3".to_string(),
            transcoder_archive_url: None,
        }
    }
}

impl EngineConfig {
    pub fn effective_max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs.clamp(1, MAX_MAX_CONCURRENT_JOBS)
    }
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    let path = paths.engine_config_path();
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidConfig(format!(
            "failed to parse engine config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    let path = paths.engine_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let config = load_engine_config(&paths).expect("load");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.metadata_timeout_secs, 60);
    }

    #[test]
    fn config_roundtrips_and_fills_missing_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("config dir");
        std::fs::write(paths.engine_config_path(), r#"{"max_concurrent_jobs": 40}"#)
            .expect("write");

        let config = load_engine_config(&paths).expect("load");
        assert_eq!(config.max_concurrent_jobs, 40);
        assert_eq!(config.effective_max_concurrent_jobs(), MAX_MAX_CONCURRENT_JOBS);
        assert_eq!(config.audio_format, "mp3");

        let mut changed = config.clone();
        changed.transcoder_archive_url = Some("http://127.0.0.1/ffmpeg.zip".to_string());
        save_engine_config(&paths, &changed).expect("save");
        assert_eq!(load_engine_config(&paths).expect("reload"), changed);
    }

    #[test]
    fn malformed_config_is_reported_with_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("config dir");
        std::fs::write(paths.engine_config_path(), "{not json").expect("write");

        let err = load_engine_config(&paths).expect_err("should fail");
        assert!(err.to_string().contains("engine.json"));
    }
}

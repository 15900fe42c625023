use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Request timed out ({secs}s) - check your internet connection or try again")]
    Timeout { tool: String, secs: u64 },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("failed to parse metadata: {0}")]
    MetadataParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job id already used: {0}")]
    DuplicateJob(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

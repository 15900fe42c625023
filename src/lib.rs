pub mod cmd;
pub mod config;
pub mod db;
pub mod engine;
mod error;
pub mod events;
pub mod history;
pub mod job_log;
pub mod jobs;
pub mod locator;
pub mod logging;
pub mod metadata;
pub mod paths;
pub mod progress;
pub mod stats;
pub mod tools;

pub use engine::Engine;
pub use error::{EngineError, Result};

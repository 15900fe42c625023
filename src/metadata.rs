use crate::cmd::{command, run_command_output_with_timeout, CommandRunError};
use crate::job_log::log_line_best_effort;
use crate::jobs::normalize_source_url;
use crate::paths::AppPaths;
use crate::tools::{FetcherTool, FETCHER_TOOL};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Job-log id used for metadata probes, which have no job of their own.
pub const METADATA_LOG_ID: &str = "metadata";

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaFormat {
    pub format_id: String,
    pub quality: String,
    /// Upper-cased container, e.g. `MP4`.
    pub format: String,
    pub filesize: Option<u64>,
    pub ext: String,
    pub is_video: bool,
    pub is_audio: bool,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub abr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaMetadata {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub duration: f64,
    pub uploader: String,
    pub source_url: String,
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    pub duration: f64,
    pub thumbnail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistMetadata {
    pub id: String,
    pub title: String,
    pub uploader: String,
    pub entries: Vec<PlaylistEntry>,
}

#[derive(Debug, Deserialize)]
struct FetcherInfo {
    id: Option<String>,
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<FetcherThumbnail>,
    duration: Option<f64>,
    uploader: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    #[serde(default)]
    formats: Vec<FetcherFormat>,
}

#[derive(Debug, Deserialize)]
struct FetcherThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FetcherFormat {
    format_id: Option<String>,
    format_note: Option<String>,
    // Numeric preference score on most extractors, occasionally a string.
    quality: Option<serde_json::Value>,
    ext: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    resolution: Option<String>,
    fps: Option<f64>,
    abr: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FetcherPlaylistLine {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
}

/// Probes a single item without downloading it.
pub fn fetch_metadata(
    paths: &AppPaths,
    fetcher: &FetcherTool,
    url: &str,
    timeout_secs: u64,
) -> Result<MediaMetadata> {
    let url = normalize_source_url(url)?;
    let args = ["--dump-json", "--no-playlist", "--skip-download", url.as_str()];
    let stdout = run_probe(paths, &fetcher.locate(), &args, timeout_secs, "Failed to fetch video info")?;
    let info = parse_media_metadata(&stdout)?;
    tracing::info!(tool = FETCHER_TOOL, formats = info.formats.len(), "metadata probe finished");
    Ok(info)
}

/// Lists playlist entries using the fetcher's flat playlist mode.
pub fn fetch_playlist_metadata(
    paths: &AppPaths,
    fetcher: &FetcherTool,
    url: &str,
    timeout_secs: u64,
) -> Result<PlaylistMetadata> {
    let url = normalize_source_url(url)?;
    let args = ["--dump-json", "--flat-playlist", url.as_str()];
    let stdout = run_probe(paths, &fetcher.locate(), &args, timeout_secs, "Failed to fetch playlist info")?;
    parse_playlist_lines(&stdout)
}

fn run_probe(
    paths: &AppPaths,
    program: &Path,
    args: &[&str],
    timeout_secs: u64,
    failure_message: &str,
) -> Result<String> {
    log_line_best_effort(
        paths,
        METADATA_LOG_ID,
        "info",
        "probe_start",
        serde_json::json!({ "program": program.to_string_lossy(), "args": args }),
    );

    let mut cmd = command(program);
    cmd.args(args);
    let output = match run_command_output_with_timeout(&mut cmd, timeout_secs) {
        Ok(output) => output,
        Err(CommandRunError::TimedOut(secs)) => {
            log_line_best_effort(
                paths,
                METADATA_LOG_ID,
                "warn",
                "probe_timeout",
                serde_json::json!({ "secs": secs }),
            );
            tracing::warn!(tool = FETCHER_TOOL, secs, "metadata probe timed out");
            return Err(EngineError::Timeout {
                tool: FETCHER_TOOL.to_string(),
                secs,
            });
        }
        Err(CommandRunError::Spawn(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::ExternalToolMissing {
                tool: FETCHER_TOOL.to_string(),
            });
        }
        Err(CommandRunError::Spawn(err)) | Err(CommandRunError::Wait(err)) => {
            return Err(EngineError::Io(err));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    log_line_best_effort(
        paths,
        METADATA_LOG_ID,
        if output.status.success() { "info" } else { "error" },
        "probe_exit",
        serde_json::json!({ "code": output.status.code(), "stderr": stderr.trim() }),
    );

    if !output.status.success() || stdout.trim().is_empty() {
        let detail = stderr.trim();
        return Err(EngineError::ExternalToolFailed {
            tool: FETCHER_TOOL.to_string(),
            code: output.status.code(),
            stderr: if detail.is_empty() {
                failure_message.to_string()
            } else {
                detail.to_string()
            },
        });
    }
    Ok(stdout)
}

pub fn parse_media_metadata(json: &str) -> Result<MediaMetadata> {
    let info: FetcherInfo = serde_json::from_str(json.trim())
        .map_err(|e| EngineError::MetadataParse(format!("video info: {e}")))?;

    let thumbnail = info
        .thumbnail
        .filter(|t| !t.is_empty())
        .or_else(|| info.thumbnails.into_iter().next().and_then(|t| t.url))
        .unwrap_or_default();

    Ok(MediaMetadata {
        id: info.id.unwrap_or_default(),
        title: non_empty_or(info.title, UNKNOWN),
        thumbnail,
        duration: info.duration.unwrap_or(0.0),
        uploader: non_empty_or(info.uploader, UNKNOWN),
        source_url: info.webpage_url.or(info.url).unwrap_or_default(),
        formats: info.formats.into_iter().map(media_format).collect(),
    })
}

fn media_format(f: FetcherFormat) -> MediaFormat {
    let quality = f
        .format_note
        .filter(|s| !s.is_empty())
        .or_else(|| match f.quality {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
            Some(serde_json::Value::Number(n)) if n.as_f64() != Some(0.0) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "unknown".to_string());

    let filesize = f
        .filesize
        .filter(|v| *v > 0.0)
        .or(f.filesize_approx.filter(|v| *v > 0.0))
        .map(|v| v as u64);

    MediaFormat {
        format_id: f.format_id.unwrap_or_default(),
        quality,
        format: f
            .ext
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        filesize,
        ext: f.ext.clone().unwrap_or_else(|| "mp4".to_string()),
        is_video: f.vcodec.as_deref() != Some("none"),
        is_audio: f.acodec.as_deref() != Some("none"),
        resolution: f.resolution,
        fps: f.fps,
        vcodec: f.vcodec,
        acodec: f.acodec,
        abr: f.abr,
    }
}

/// Parses flat-playlist output: one JSON object per non-empty line.
pub fn parse_playlist_lines(text: &str) -> Result<PlaylistMetadata> {
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: FetcherPlaylistLine = serde_json::from_str(line)
            .map_err(|e| EngineError::MetadataParse(format!("playlist line {}: {e}", idx + 1)))?;

        let thumbnail = match raw.thumbnail.filter(|t| !t.is_empty()) {
            Some(t) => t,
            None => fallback_thumbnail(raw.id.as_deref(), raw.url.as_deref()).unwrap_or_default(),
        };
        entries.push(PlaylistEntry {
            id: raw.id.clone().or_else(|| raw.url.clone()).unwrap_or_default(),
            title: non_empty_or(raw.title, UNKNOWN),
            url: raw.url.or(raw.webpage_url).unwrap_or_default(),
            duration: raw.duration.unwrap_or(0.0),
            thumbnail,
        });
    }

    Ok(PlaylistMetadata {
        id: entries
            .first()
            .map(|e| e.id.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        title: "Playlist".to_string(),
        uploader: UNKNOWN.to_string(),
        entries,
    })
}

/// YouTube-style still for entries the flat listing left without a thumbnail.
fn fallback_thumbnail(id: Option<&str>, url: Option<&str>) -> Option<String> {
    let video_id = id.filter(|s| !s.is_empty()).map(str::to_string).or_else(|| {
        let parsed = url::Url::parse(url?).ok()?;
        parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.to_string())
    })?;
    Some(format!("https://i.ytimg.com/vi/{video_id}/mqdefault.jpg"))
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    value
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

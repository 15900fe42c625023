use crate::events::Subscribers;
use crate::job_log::now_ms;
use crate::locator::BinaryLocator;
use crate::paths::{executable_name, path_with_suffix, AppPaths};
use crate::{EngineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Mutex, OnceLock};

pub const FETCHER_TOOL: &str = "yt-dlp";
pub const TRANSCODER_TOOL: &str = "ffmpeg";
pub const PROBE_TOOL: &str = "ffprobe";

const TRANSCODER_READY_DETAIL: &str = "FFmpeg is available and ready.";
const TRANSCODER_MISSING_DETAIL: &str =
    "FFmpeg not found. Audio extraction and video conversion require FFmpeg.";
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct FetcherStatus {
    pub available: bool,
    pub path: String,
    pub version: Option<String>,
}

/// The external media fetcher (yt-dlp).
#[derive(Debug)]
pub struct FetcherTool {
    locator: BinaryLocator,
}

impl FetcherTool {
    pub fn new(locator: BinaryLocator) -> Self {
        Self { locator }
    }

    pub fn for_app(paths: &AppPaths) -> Self {
        Self::new(BinaryLocator::for_app(paths, FETCHER_TOOL, "--version"))
    }

    pub fn locate(&self) -> PathBuf {
        self.locator.locate()
    }

    pub fn verify(&self) -> bool {
        self.locator.verify()
    }

    pub fn version(&self) -> Option<String> {
        let text = self.locator.version_output()?;
        let first = text.lines().next()?.trim();
        if first.is_empty() {
            return None;
        }
        Some(first.to_string())
    }

    pub fn invalidate(&self) {
        self.locator.invalidate();
    }

    pub fn status(&self) -> FetcherStatus {
        let version = self.version();
        FetcherStatus {
            available: version.is_some(),
            path: self.locate().to_string_lossy().to_string(),
            version,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscoderStatus {
    pub available: bool,
    pub detail: String,
    pub path: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InstallProgress {
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallEvent {
    Progress(InstallProgress),
    Installed,
    InstallFailed { detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderInstallRecord {
    pub source_url: String,
    pub archive_sha256: String,
    pub installed_at_ms: i64,
}

/// Locates the transcoder and installs it from a release archive when missing.
#[derive(Debug)]
pub struct TranscoderResolver {
    paths: AppPaths,
    locator: BinaryLocator,
    archive_url: Option<String>,
    install_guard: Mutex<()>,
    events: Subscribers<InstallEvent>,
}

impl TranscoderResolver {
    pub fn new(paths: AppPaths, locator: BinaryLocator, archive_url: Option<String>) -> Self {
        Self {
            paths,
            locator,
            archive_url,
            install_guard: Mutex::new(()),
            events: Subscribers::new(),
        }
    }

    pub fn for_app(paths: &AppPaths, archive_url: Option<String>) -> Self {
        let locator = BinaryLocator::for_app(paths, TRANSCODER_TOOL, "-version");
        Self::new(paths.clone(), locator, archive_url)
    }

    pub fn locate(&self) -> PathBuf {
        self.locator.locate()
    }

    /// Directory holding the transcoder, for the fetcher's `--ffmpeg-location`.
    /// `None` when it is only reachable through the OS search path.
    pub fn location(&self) -> Option<PathBuf> {
        self.locator
            .located_file()
            .and_then(|file| file.parent().map(Path::to_path_buf))
    }

    pub fn verify(&self) -> bool {
        self.locator.verify()
    }

    pub fn version(&self) -> Option<String> {
        let text = self.locator.version_output()?;
        Some(parse_transcoder_version(&text).unwrap_or_else(|| {
            text.lines().next().unwrap_or_default().trim().to_string()
        }))
    }

    pub fn invalidate(&self) {
        self.locator.invalidate();
    }

    pub fn status(&self) -> TranscoderStatus {
        let version = self.version();
        let available = version.is_some();
        TranscoderStatus {
            available,
            detail: if available {
                TRANSCODER_READY_DETAIL
            } else {
                TRANSCODER_MISSING_DETAIL
            }
            .to_string(),
            path: self.locate().to_string_lossy().to_string(),
            version,
        }
    }

    pub fn subscribe(&self) -> Receiver<InstallEvent> {
        self.events.subscribe()
    }

    pub fn install_record(&self) -> Option<TranscoderInstallRecord> {
        let bytes = std::fs::read(self.paths.transcoder_marker_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Installs the transcoder unless it already verifies.
    ///
    /// Only one install runs at a time; callers arriving while one is in
    /// flight block on the guard and then see its result through `verify`.
    pub fn ensure_available(
        &self,
        mut on_progress: impl FnMut(InstallProgress),
    ) -> Result<TranscoderStatus> {
        if self.verify() {
            return Ok(self.status());
        }

        let _guard = match self.install_guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.verify() {
            return Ok(self.status());
        }

        let outcome = self.install(&mut |progress| {
            on_progress(progress);
            self.events.publish(InstallEvent::Progress(progress));
        });
        match outcome {
            Ok(()) => {
                tracing::info!(tool = TRANSCODER_TOOL, "transcoder installed");
                self.events.publish(InstallEvent::Installed);
                Ok(self.status())
            }
            Err(err) => {
                tracing::warn!(tool = TRANSCODER_TOOL, error = %err, "transcoder install failed");
                self.events.publish(InstallEvent::InstallFailed {
                    detail: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn install(&self, on_progress: &mut dyn FnMut(InstallProgress)) -> Result<()> {
        let url = match self.archive_url.clone() {
            Some(url) => url,
            None => default_archive_url()
                .ok_or_else(|| {
                    EngineError::InstallFailed(
                        "automatic FFmpeg install is only supported on Windows x64 for now; set transcoder_archive_url"
                            .to_string(),
                    )
                })?
                .to_string(),
        };

        self.paths.ensure_dirs()?;
        let archive_path = self
            .paths
            .cache_dir()
            .join(format!("transcoder-{}.zip.download", uuid::Uuid::new_v4()));

        tracing::info!(tool = TRANSCODER_TOOL, %url, "downloading transcoder archive");
        let downloaded = download_to_file(&url, &archive_path, on_progress);
        let extracted = downloaded.and_then(|sha256| {
            extract_binaries(
                &archive_path,
                &self.paths.resources_dir(),
                &[
                    self.locator.file_name().to_string(),
                    executable_name(PROBE_TOOL),
                ],
            )
            .map(|()| sha256)
        });
        let _ = std::fs::remove_file(&archive_path);
        let archive_sha256 = extracted?;

        let record = TranscoderInstallRecord {
            source_url: url,
            archive_sha256,
            installed_at_ms: now_ms(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(self.paths.transcoder_marker_path(), format!("{json}\n"))?;

        // Binaries are in place before the cache is replaced, and the cache
        // points at them directly so an earlier search dir cannot shadow them.
        let installed = self.paths.resources_dir().join(self.locator.file_name());
        if !self.locator.pin(installed.clone()) {
            return Err(EngineError::InstallFailed(format!(
                "installed binary missing at {}",
                installed.to_string_lossy()
            )));
        }
        Ok(())
    }
}

fn default_archive_url() -> Option<&'static str> {
    if cfg!(all(windows, target_arch = "x86_64")) {
        Some("https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-win64-gpl.zip")
    } else {
        None
    }
}

fn parse_transcoder_version(text: &str) -> Option<String> {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    let re = VERSION_RE.get_or_init(|| Regex::new(r"ffmpeg version (\S+)").unwrap());
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Streams `url` into `dest` and returns the hex SHA-256 of the bytes written.
fn download_to_file(
    url: &str,
    dest: &Path,
    on_progress: &mut dyn FnMut(InstallProgress),
) -> Result<String> {
    use sha2::Digest;

    let resp = ureq::get(url).call().map_err(|e| match e {
        ureq::Error::StatusCode(code) => {
            EngineError::DownloadFailed(format!("failed to download FFmpeg: HTTP {code}"))
        }
        other => EngineError::DownloadFailed(format!("failed to download FFmpeg: {other}")),
    })?;
    let status = resp.status().as_u16();
    if status != 200 {
        return Err(EngineError::DownloadFailed(format!(
            "failed to download FFmpeg: HTTP {status}"
        )));
    }

    let total_bytes = resp
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|total| *total > 0);

    let result = (|| -> Result<String> {
        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(dest)?;
        let mut hasher = sha2::Sha256::new();
        let mut buf = vec![0_u8; DOWNLOAD_CHUNK_BYTES];
        let mut downloaded_bytes = 0_u64;
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| EngineError::DownloadFailed(format!("download interrupted: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            downloaded_bytes += n as u64;
            if let Some(total_bytes) = total_bytes {
                on_progress(InstallProgress {
                    percent: (downloaded_bytes as f64 / total_bytes as f64) * 100.0,
                    downloaded_bytes,
                    total_bytes,
                });
            }
        }
        file.flush()?;
        Ok(hex::encode(hasher.finalize()))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

/// Extracts the `bin/<name>` entries into `out_dir`.
///
/// Every entry is located before anything is written, and files are staged
/// under a `.partial` suffix and renamed only once all of them extracted.
fn extract_binaries(zip_path: &Path, out_dir: &Path, names: &[String]) -> Result<()> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        EngineError::InstallFailed(format!(
            "failed to read zip archive {}: {e}",
            zip_path.to_string_lossy()
        ))
    })?;

    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        let suffix = format!("bin/{name}");
        let mut found = None;
        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| EngineError::InstallFailed(format!("zip read failed: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            if entry.name().replace('\\', "/").ends_with(&suffix) {
                found = Some(i);
                break;
            }
        }
        let index = found.ok_or_else(|| {
            EngineError::InstallFailed(format!(
                "could not find {name} in the downloaded archive"
            ))
        })?;
        indices.push(index);
    }

    std::fs::create_dir_all(out_dir)?;
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(names.len());
    let staging = (|| -> Result<()> {
        for (name, index) in names.iter().zip(indices) {
            let target = out_dir.join(name);
            let partial = path_with_suffix(&target, ".partial");
            let mut entry = archive
                .by_index(index)
                .map_err(|e| EngineError::InstallFailed(format!("zip read failed: {e}")))?;
            let mut out_file = std::fs::File::create(&partial)?;
            staged.push((partial.clone(), target));
            std::io::copy(&mut entry, &mut out_file)
                .map_err(|e| EngineError::InstallFailed(format!("extraction failed: {e}")))?;
            out_file.flush()?;
            mark_executable(&partial)?;
        }
        Ok(())
    })();

    if let Err(err) = staging {
        for (partial, _) in &staged {
            let _ = std::fs::remove_file(partial);
        }
        return Err(err);
    }

    commit_staged(&staged)
}

/// Renames every staged file onto its target, or leaves all targets as they were.
///
/// Existing targets are moved aside to `.bak` first and restored if any
/// rename fails; leftover `.partial` files are removed on failure.
fn commit_staged(staged: &[(PathBuf, PathBuf)]) -> Result<()> {
    let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut committed: Vec<PathBuf> = Vec::new();
    let outcome = (|| -> std::io::Result<()> {
        for (_, target) in staged {
            if target.exists() {
                let backup = path_with_suffix(target, ".bak");
                std::fs::rename(target, &backup)?;
                backups.push((backup, target.clone()));
            }
        }
        for (partial, target) in staged {
            std::fs::rename(partial, target)?;
            committed.push(target.clone());
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            for (backup, _) in &backups {
                let _ = std::fs::remove_file(backup);
            }
            Ok(())
        }
        Err(err) => {
            for target in &committed {
                let _ = std::fs::remove_file(target);
            }
            for (backup, target) in &backups {
                if let Err(restore_err) = std::fs::rename(backup, target) {
                    tracing::warn!(
                        path = %target.display(),
                        error = %restore_err,
                        "failed to restore previous binary"
                    );
                }
            }
            for (partial, _) in staged {
                let _ = std::fs::remove_file(partial);
            }
            Err(EngineError::InstallFailed(format!(
                "failed to move installed binaries into place: {err}"
            )))
        }
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

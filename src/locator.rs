use crate::cmd;
use crate::paths::{executable_name, AppPaths};
use std::path::PathBuf;
use std::sync::Mutex;

const VERSION_QUERY_TIMEOUT_SECS: u64 = 30;

/// Finds an external executable and remembers where it was found.
///
/// Candidates are searched in order: resources bundled next to the running
/// executable, the app's own resources directory, `./resources`. When none
/// exists the bare program name is returned so the OS search path applies.
/// Only on-disk hits are cached; [`BinaryLocator::invalidate`] forgets them.
#[derive(Debug)]
pub struct BinaryLocator {
    tool: String,
    file_name: String,
    version_arg: String,
    search_dirs: Vec<PathBuf>,
    cached: Mutex<Option<PathBuf>>,
}

impl BinaryLocator {
    pub fn new(
        tool: impl Into<String>,
        version_arg: impl Into<String>,
        search_dirs: Vec<PathBuf>,
    ) -> Self {
        let tool = tool.into();
        Self {
            file_name: executable_name(&tool),
            tool,
            version_arg: version_arg.into(),
            search_dirs,
            cached: Mutex::new(None),
        }
    }

    pub fn for_app(paths: &AppPaths, tool: &str, version_arg: &str) -> Self {
        let mut dirs = Vec::new();
        if let Some(bundled) = AppPaths::bundled_resources_dir() {
            dirs.push(bundled);
        }
        dirs.push(paths.resources_dir());
        if let Some(cwd) = AppPaths::cwd_resources_dir() {
            dirs.push(cwd);
        }
        Self::new(tool, version_arg, dirs)
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn locate(&self) -> PathBuf {
        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(path) = cached.as_ref() {
            return path.clone();
        }

        for dir in &self.search_dirs {
            let candidate = dir.join(&self.file_name);
            if candidate.is_file() {
                tracing::debug!(tool = %self.tool, path = %candidate.display(), "resolved executable");
                *cached = Some(candidate.clone());
                return candidate;
            }
        }

        PathBuf::from(&self.file_name)
    }

    /// The resolved file, or `None` when relying on the OS search path.
    pub fn located_file(&self) -> Option<PathBuf> {
        let path = self.locate();
        if path.is_absolute() && path.is_file() {
            Some(path)
        } else {
            None
        }
    }

    pub fn invalidate(&self) {
        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cached = None;
    }

    /// Caches `path` as the resolved executable, replacing any earlier hit.
    /// Returns false, leaving the cache untouched, when `path` is not a file.
    pub fn pin(&self, path: PathBuf) -> bool {
        if !path.is_file() {
            return false;
        }
        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::debug!(tool = %self.tool, path = %path.display(), "pinned executable");
        *cached = Some(path);
        true
    }

    /// Runs the version query; true only for a zero exit status.
    pub fn verify(&self) -> bool {
        let mut command = cmd::command(self.locate());
        command.arg(&self.version_arg);
        match cmd::run_command_output_with_timeout(&mut command, VERSION_QUERY_TIMEOUT_SECS) {
            Ok(output) => output.status.success(),
            Err(err) => {
                tracing::debug!(tool = %self.tool, error = ?err, "verification failed");
                false
            }
        }
    }

    /// Stdout of the version query, when it exits successfully.
    pub fn version_output(&self) -> Option<String> {
        let mut command = cmd::command(self.locate());
        command.arg(&self.version_arg);
        let output =
            cmd::run_command_output_with_timeout(&mut command, VERSION_QUERY_TIMEOUT_SECS).ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_bare_name_without_caching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locator = BinaryLocator::new("yt-dlp", "--version", vec![dir.path().to_path_buf()]);
        assert_eq!(locator.locate(), PathBuf::from(executable_name("yt-dlp")));
        assert!(locator.located_file().is_none());

        // Appears later; picked up because the fallback was never cached.
        let installed = dir.path().join(executable_name("yt-dlp"));
        std::fs::write(&installed, b"").expect("write");
        assert_eq!(locator.locate(), installed);
    }

    #[test]
    fn search_order_prefers_earlier_dirs_and_cache_sticks_until_invalidated() {
        let first = tempfile::tempdir().expect("first");
        let second = tempfile::tempdir().expect("second");
        let name = executable_name("ffmpeg");
        std::fs::write(second.path().join(&name), b"").expect("write second");

        let locator = BinaryLocator::new(
            "ffmpeg",
            "-version",
            vec![first.path().to_path_buf(), second.path().to_path_buf()],
        );
        assert_eq!(locator.locate(), second.path().join(&name));

        std::fs::write(first.path().join(&name), b"").expect("write first");
        assert_eq!(locator.locate(), second.path().join(&name));

        locator.invalidate();
        assert_eq!(locator.locate(), first.path().join(&name));
    }

    #[test]
    fn pin_overrides_search_order_for_existing_files_only() {
        let first = tempfile::tempdir().expect("first");
        let second = tempfile::tempdir().expect("second");
        let name = executable_name("ffmpeg");
        std::fs::write(first.path().join(&name), b"").expect("write first");
        std::fs::write(second.path().join(&name), b"").expect("write second");

        let locator = BinaryLocator::new(
            "ffmpeg",
            "-version",
            vec![first.path().to_path_buf(), second.path().to_path_buf()],
        );
        assert_eq!(locator.locate(), first.path().join(&name));

        assert!(locator.pin(second.path().join(&name)));
        assert_eq!(locator.locate(), second.path().join(&name));

        assert!(!locator.pin(second.path().join("missing")));
        assert_eq!(locator.locate(), second.path().join(&name));
    }

    #[test]
    fn verify_is_false_for_missing_tool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locator = BinaryLocator::new(
            "definitely-not-a-real-tool-xyz",
            "--version",
            vec![dir.path().to_path_buf()],
        );
        assert!(!locator.verify());
        assert!(locator.version_output().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn verify_and_version_follow_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fetcher");
        std::fs::write(&script, "#!/bin/sh\necho 2025.01.15\n").expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let ok = BinaryLocator::new("fetcher", "--version", vec![dir.path().to_path_buf()]);
        assert!(ok.verify());
        assert_eq!(ok.version_output().as_deref().map(str::trim), Some("2025.01.15"));

        let failing = dir.path().join("broken");
        std::fs::write(&failing, "#!/bin/sh\necho nope\nexit 3\n").expect("write");
        std::fs::set_permissions(&failing, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let bad = BinaryLocator::new("broken", "--version", vec![dir.path().to_path_buf()]);
        assert!(!bad.verify());
        assert!(bad.version_output().is_none());
    }
}

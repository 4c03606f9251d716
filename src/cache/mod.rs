//! Cache layout and write discipline.
//!
//! All cached state lives under the working directory:
//!
//! - `cache/repo/<distro>:<repo>:<arch>.db` — repository indices
//! - `cache/pkg/<distro>:<repo>:<arch>:<pkgfile>` — downloaded packages
//! - `cache/pkg/<distro>:<repo>:<arch>:<stem>/…` — extracted files
//! - `cache/keyring/<id>.tar` — keyring backups
//! - `cache/build.<build-id>/{bin,etc,root}` — per-build scratch
//!
//! Cache entries are never written in place: writes go to `<path>.temp`
//! and are renamed over the final path only on success. An entry whose
//! mtime is at or after [`start_time`] counts as already fetched for the
//! current run.

pub mod download;
pub mod repo;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: OnceLock<SystemTime> = OnceLock::new();

/// Capture the process start time. First call wins; later calls are no-ops.
pub fn capture_start_time() {
    let _ = START_TIME.set(SystemTime::now());
}

/// Adopt the parent's start time in the re-invoked child so both halves
/// of the run agree on which cache entries are fresh.
pub fn set_start_time_unix(secs: u64) {
    let _ = START_TIME.set(UNIX_EPOCH + std::time::Duration::from_secs(secs));
}

/// The wall-clock instant captured at process start.
pub fn start_time() -> SystemTime {
    *START_TIME.get_or_init(SystemTime::now)
}

/// Seconds since the epoch at process start.
pub fn start_time_unix() -> u64 {
    start_time()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Whether a cache entry was written during this run (`mtime >= StartTime`).
pub fn is_fresh(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    match meta.modified() {
        Ok(mtime) => mtime >= start_time(),
        Err(_) => false,
    }
}

/// Fixed directory skeleton relative to the working directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Layout rooted at the given working directory.
    pub fn new(workdir: &Path) -> Self {
        Self {
            root: workdir.to_path_buf(),
        }
    }

    /// Layout rooted at the current working directory.
    pub fn current() -> Result<Self> {
        Ok(Self::new(&std::env::current_dir().context("failed to read current dir")?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join("cache/repo")
    }

    pub fn pkg_dir(&self) -> PathBuf {
        self.root.join("cache/pkg")
    }

    pub fn keyring_dir(&self) -> PathBuf {
        self.root.join("cache/keyring")
    }

    /// `cache/repo/<distro>:<repo>:<arch>.db`
    pub fn db_path(&self, distro: &str, repo: &str, arch: &str) -> PathBuf {
        self.repo_dir().join(format!("{}:{}:{}.db", distro, repo, arch))
    }

    /// `cache/pkg/<distro>:<repo>:<arch>:<pkgfile>`
    pub fn pkg_path(&self, distro: &str, repo: &str, arch: &str, filename: &str) -> PathBuf {
        self.pkg_dir()
            .join(format!("{}:{}:{}:{}", distro, repo, arch, filename))
    }

    /// `cache/keyring/<id>.tar`
    pub fn keyring_backup(&self, keyring_id: &str) -> PathBuf {
        self.keyring_dir().join(format!("{}.tar", keyring_id))
    }

    /// `cache/build.<build-id>`
    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        self.root.join(format!("cache/build.{}", build_id))
    }

    /// Create the cache skeleton.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.repo_dir(), self.pkg_dir(), self.keyring_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Create the per-build scratch tree (`bin`, `etc`, `root`).
    pub fn ensure_build_dir(&self, build_id: &str) -> Result<PathBuf> {
        let build = self.build_dir(build_id);
        for sub in ["bin", "etc", "root"] {
            let dir = build.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(build)
    }

    /// Remove every `cache/build.*` scratch directory.
    pub fn clean_builds(&self) -> Result<usize> {
        let cache = self.root.join("cache");
        if !cache.is_dir() {
            return Ok(0);
        }
        let mut removed = 0usize;
        for entry in fs::read_dir(&cache)
            .with_context(|| format!("failed to read {}", cache.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("build.") && entry.path().is_dir() {
                fs::remove_dir_all(entry.path())
                    .with_context(|| format!("failed to remove {}", entry.path().display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// The `.temp` sibling a write lands in before the atomic rename.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".temp");
    path.with_file_name(name)
}

/// Rename `src` over `dst`, falling back to copy+unlink across filesystems.
pub fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // EXDEV fallback.
            fs::copy(src, dst)
                .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("failed to remove temp {}", src.display()))?;
            Ok(())
        }
    }
}

/// Write bytes to `<path>.temp` and rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = temp_path(path);
    if let Some(parent) = temp.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&temp, bytes)
        .with_context(|| format!("failed to write {}", temp.display()))?;
    atomic_rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = CacheLayout::new(Path::new("/work"));
        assert_eq!(
            layout.db_path("archlinux", "core", "x86_64"),
            Path::new("/work/cache/repo/archlinux:core:x86_64.db")
        );
        assert_eq!(
            layout.pkg_path("archlinux", "core", "x86_64", "pacman-7.0.0-1-x86_64.pkg.tar.zst"),
            Path::new("/work/cache/pkg/archlinux:core:x86_64:pacman-7.0.0-1-x86_64.pkg.tar.zst")
        );
        assert_eq!(
            layout.keyring_backup("md5-d41d8cd98f00b204e9800998ecf8427e"),
            Path::new("/work/cache/keyring/md5-d41d8cd98f00b204e9800998ecf8427e.tar")
        );
        assert_eq!(layout.build_dir("b1"), Path::new("/work/cache/build.b1"));
    }

    #[test]
    fn test_ensure_build_dir() {
        let temp = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp.path());
        let build = layout.ensure_build_dir("test").unwrap();
        assert!(build.join("bin").is_dir());
        assert!(build.join("etc").is_dir());
        assert!(build.join("root").is_dir());
    }

    #[test]
    fn test_clean_builds() {
        let temp = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp.path());
        layout.ensure_build_dir("a").unwrap();
        layout.ensure_build_dir("b").unwrap();
        assert_eq!(layout.clean_builds().unwrap(), 2);
        assert!(!layout.build_dir("a").exists());
    }

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entry");
        write_atomic(&path, b"content").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"content");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_freshness_predicate() {
        capture_start_time();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entry");
        fs::write(&path, b"x").unwrap();
        assert!(is_fresh(&path));
        assert!(!is_fresh(&temp.path().join("missing")));
    }
}

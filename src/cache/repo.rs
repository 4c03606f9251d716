//! Repository client.
//!
//! Formats mirror URLs from templates, fetches and parses repository
//! `.db` indices, resolves the newest version of a named package and
//! pulls individual files out of cached package archives.
//!
//! A `.db` index is a (possibly gzip- or zstd-compressed) tar where each
//! package contributes a `<name>-<version>/desc` entry carrying
//! `%FILENAME%`, `%NAME%` and `%VERSION%` sections.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{self, download, CacheLayout};
use crate::process::Cmd;

/// Third-party repo carrying statically linked pacman builds.
const PACMAN_STATIC_REPO: &str = "archlinuxcn";
const PACMAN_STATIC_MIRROR: &str = "https://repo.archlinuxcn.org/$arch";

/// Errors produced by the repo client.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("network fetch failed: {0:#}")]
    NetworkFetch(#[source] anyhow::Error),
    #[error("repository database parse failed: {0}")]
    DbParse(String),
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("package extraction failed: {0}")]
    ExtractFailure(String),
}

type Result<T> = std::result::Result<T, RepoError>;

/// Expand the literal `$repo` and `$arch` placeholders of a mirror template.
pub fn expand_mirror(template: &str, repo: &str, arch: &str) -> String {
    template.replace("$repo", repo).replace("$arch", arch)
}

/// A resolved package reference inside one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgRef {
    pub filename: String,
    pub version: String,
}

/// One `(distro, repo, arch)` repository bound to the cache.
pub struct RepoSource<'a> {
    layout: &'a CacheLayout,
    distro: &'a str,
    repo: &'a str,
    arch: &'a str,
    mirror: String,
}

impl<'a> RepoSource<'a> {
    pub fn new(
        layout: &'a CacheLayout,
        distro: &'a str,
        repo: &'a str,
        arch: &'a str,
        url_template: &str,
    ) -> Self {
        Self {
            layout,
            distro,
            repo,
            arch,
            mirror: expand_mirror(url_template, repo, arch),
        }
    }

    /// Fetch the repository index unless it is already fresh for this run.
    pub fn sync_db(&self) -> Result<PathBuf> {
        let path = self.layout.db_path(self.distro, self.repo, self.arch);
        if cache::is_fresh(&path) {
            debug!("db {} is fresh, not re-fetching", path.display());
            return Ok(path);
        }
        let url = format!("{}/{}.db", self.mirror, self.repo);
        download::download(&url, &path).map_err(RepoError::NetworkFetch)?;
        Ok(path)
    }

    /// Resolve a package name to its filename and version.
    pub fn resolve(&self, pkg: &str) -> Result<PkgRef> {
        let db = self.sync_db()?;
        let descs = parse_descs(&db, pkg)?;
        descs
            .into_iter()
            .find(|(name, _)| name == pkg)
            .map(|(_, r)| r)
            .ok_or_else(|| {
                RepoError::PackageNotFound(format!("{} in {}:{}", pkg, self.repo, self.arch))
            })
    }

    /// Return the local path of a package, downloading it only when absent.
    pub fn pull(&self, pkg: &str) -> Result<(PkgRef, PathBuf)> {
        let pkgref = self.resolve(pkg)?;
        let path = self
            .layout
            .pkg_path(self.distro, self.repo, self.arch, &pkgref.filename);
        if path.exists() {
            debug!("package {} already cached", pkgref.filename);
            return Ok((pkgref, path));
        }
        let url = format!("{}/{}", self.mirror, pkgref.filename);
        download::download(&url, &path).map_err(RepoError::NetworkFetch)?;
        Ok((pkgref, path))
    }

    /// Extract a single path out of a cached package.
    ///
    /// The file lands under the package-stem sibling directory of the
    /// cached archive; extraction always re-runs so a re-resolved package
    /// never serves stale content.
    pub fn extract_file(&self, pkg: &str, path_in_pkg: &str) -> Result<PathBuf> {
        let (pkgref, archive) = self.pull(pkg)?;
        let dir = self.layout.pkg_path(
            self.distro,
            self.repo,
            self.arch,
            pkg_stem(&pkgref.filename),
        );
        fs::create_dir_all(&dir).map_err(|e| {
            RepoError::ExtractFailure(format!("failed to create {}: {}", dir.display(), e))
        })?;

        info!("extracting {} from {}", path_in_pkg, pkgref.filename);
        Cmd::new("bsdtar")
            .args(["-x", "-f"])
            .arg_path(&archive)
            .args(["-C"])
            .arg_path(&dir)
            .arg(path_in_pkg)
            .run()
            .map_err(|e| {
                RepoError::ExtractFailure(format!(
                    "{} from {}: {:#}",
                    path_in_pkg, pkgref.filename, e
                ))
            })?;

        let extracted = dir.join(path_in_pkg);
        if !extracted.exists() {
            return Err(RepoError::ExtractFailure(format!(
                "{} missing from {}",
                path_in_pkg, pkgref.filename
            )));
        }
        Ok(extracted)
    }
}

/// The cached-extraction directory name for a package file.
///
/// `pacman-7.0.0-1-x86_64.pkg.tar.zst` maps to `pacman-7.0.0-1-x86_64`.
pub fn pkg_stem(filename: &str) -> &str {
    match filename.find(".pkg.tar") {
        Some(pos) => &filename[..pos],
        None => Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename),
    }
}

/// Stream the db tar and collect `(name, PkgRef)` for entries matching
/// `<pkg>-*/desc`.
fn parse_descs(db: &Path, pkg: &str) -> Result<Vec<(String, PkgRef)>> {
    let reader = open_compressed(db)
        .map_err(|e| RepoError::DbParse(format!("{}: {}", db.display(), e)))?;
    let mut archive = tar::Archive::new(reader);

    let mut filenames = Vec::new();
    let mut names = Vec::new();
    let mut versions = Vec::new();

    let prefix = format!("{}-", pkg);
    let entries = archive
        .entries()
        .map_err(|e| RepoError::DbParse(format!("{}: {}", db.display(), e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| RepoError::DbParse(format!("{}: {}", db.display(), e)))?;
        let path = entry
            .path()
            .map_err(|e| RepoError::DbParse(format!("{}: {}", db.display(), e)))?
            .into_owned();
        if !desc_matches(&path, &prefix) {
            continue;
        }

        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| RepoError::DbParse(format!("{}: {}", path.display(), e)))?;
        if let Some(v) = desc_field(&content, "%FILENAME%") {
            filenames.push(v);
        }
        if let Some(v) = desc_field(&content, "%NAME%") {
            names.push(v);
        }
        if let Some(v) = desc_field(&content, "%VERSION%") {
            versions.push(v);
        }
    }

    if filenames.len() != names.len() || names.len() != versions.len() {
        return Err(RepoError::DbParse(format!(
            "mismatched desc sections in {}: {} filenames, {} names, {} versions",
            db.display(),
            filenames.len(),
            names.len(),
            versions.len()
        )));
    }

    Ok(names
        .into_iter()
        .zip(filenames)
        .zip(versions)
        .map(|((name, filename), version)| (name, PkgRef { filename, version }))
        .collect())
}

/// A db entry matches when it is exactly `<pkg>-<something>/desc`.
fn desc_matches(path: &Path, prefix: &str) -> bool {
    let mut components = path.components();
    let Some(first) = components.next().and_then(|c| c.as_os_str().to_str()) else {
        return false;
    };
    let Some(second) = components.next().and_then(|c| c.as_os_str().to_str()) else {
        return false;
    };
    components.next().is_none() && second == "desc" && first.starts_with(prefix)
}

/// The line immediately following a `%SECTION%` header.
fn desc_field(content: &str, header: &str) -> Option<String> {
    let mut lines = content.lines();
    while let Some(line) = lines.next() {
        if line.trim() == header {
            return lines.next().map(|l| l.trim().to_string());
        }
    }
    None
}

/// Open a db file, sniffing gzip/zstd magic; plain tar passes through.
fn open_compressed(path: &Path) -> io::Result<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    let n = file.read(&mut magic)?;
    let head = io::Cursor::new(magic[..n].to_vec());
    let rest = head.chain(file);

    if n >= 2 && magic[..2] == [0x1f, 0x8b] {
        Ok(Box::new(flate2::read::GzDecoder::new(rest)))
    } else if n >= 4 && magic == [0x28, 0xb5, 0x2f, 0xfd] {
        Ok(Box::new(zstd::stream::read::Decoder::new(rest)?))
    } else {
        Ok(Box::new(rest))
    }
}

/// Fetch and extract `usr/bin/pacman-static` for hosts without a usable
/// package manager for the target's format.
///
/// The binary only exists for x86_64 and aarch64 hosts. When `freeze` is
/// set and a previously extracted copy exists, it is reused as-is.
pub fn ensure_pacman_static(
    layout: &CacheLayout,
    host_arch: &str,
    freeze: bool,
) -> Result<PathBuf> {
    if !matches!(host_arch, "x86_64" | "aarch64") {
        return Err(RepoError::PackageNotFound(format!(
            "pacman-static is only published for x86_64 and aarch64, not {}",
            host_arch
        )));
    }

    if freeze {
        if let Some(existing) = frozen_pacman_static(layout, host_arch) {
            debug!("pacman-static frozen at {}", existing.display());
            return Ok(existing);
        }
    }

    RepoSource::new(
        layout,
        PACMAN_STATIC_REPO,
        PACMAN_STATIC_REPO,
        host_arch,
        PACMAN_STATIC_MIRROR,
    )
    .extract_file("pacman-static", "usr/bin/pacman-static")
}

/// A previously extracted static pacman, without touching the network.
fn frozen_pacman_static(layout: &CacheLayout, host_arch: &str) -> Option<PathBuf> {
    let prefix = format!("{0}:{0}:{1}:", PACMAN_STATIC_REPO, host_arch);
    let entries = fs::read_dir(layout.pkg_dir()).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || !entry.path().is_dir() {
            continue;
        }
        let candidate = entry.path().join("usr/bin/pacman-static");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_db(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    const PACMAN_DESC: &str = "%FILENAME%\npacman-7.0.0-1-x86_64.pkg.tar.zst\n\n\
                               %NAME%\npacman\n\n%VERSION%\n7.0.0-1\n";
    const CONTRIB_DESC: &str = "%FILENAME%\npacman-contrib-1.10.6-1-x86_64.pkg.tar.zst\n\n\
                                %NAME%\npacman-contrib\n\n%VERSION%\n1.10.6-1\n";

    #[test]
    fn test_expand_mirror() {
        assert_eq!(
            expand_mirror("https://mirror/$repo/os/$arch", "core", "x86_64"),
            "https://mirror/core/os/x86_64"
        );
        // Only the two known placeholders substitute.
        assert_eq!(expand_mirror("https://m/$other", "core", "x86_64"), "https://m/$other");
    }

    #[test]
    fn test_pkg_stem() {
        assert_eq!(pkg_stem("pacman-7.0.0-1-x86_64.pkg.tar.zst"), "pacman-7.0.0-1-x86_64");
        assert_eq!(pkg_stem("pacman-7.0.0-1-x86_64.pkg.tar.xz"), "pacman-7.0.0-1-x86_64");
        assert_eq!(pkg_stem("plain.tar"), "plain");
    }

    #[test]
    fn test_desc_field() {
        assert_eq!(desc_field(PACMAN_DESC, "%NAME%"), Some("pacman".to_string()));
        assert_eq!(desc_field(PACMAN_DESC, "%VERSION%"), Some("7.0.0-1".to_string()));
        assert_eq!(desc_field(PACMAN_DESC, "%MISSING%"), None);
    }

    #[test]
    fn test_parse_descs_picks_exact_name() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("core.db");
        // Both entries match the `pacman-*/desc` glob; only the exact
        // name match may win.
        write_db(
            &db,
            &[
                ("pacman-contrib-1.10.6-1/desc", CONTRIB_DESC),
                ("pacman-7.0.0-1/desc", PACMAN_DESC),
            ],
        );

        let descs = parse_descs(&db, "pacman").unwrap();
        let (_, found) = descs.iter().find(|(n, _)| n == "pacman").unwrap();
        assert_eq!(found.filename, "pacman-7.0.0-1-x86_64.pkg.tar.zst");
        assert_eq!(found.version, "7.0.0-1");
    }

    #[test]
    fn test_parse_descs_mismatched_sections() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("core.db");
        write_db(&db, &[("pacman-7.0.0-1/desc", "%NAME%\npacman\n")]);

        let err = parse_descs(&db, "pacman").unwrap_err();
        assert!(matches!(err, RepoError::DbParse(_)));
    }

    #[test]
    fn test_resolve_missing_package() {
        cache::capture_start_time();
        let temp = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp.path());
        layout.ensure().unwrap();
        // The db lands with a fresh mtime, so resolution never fetches.
        let db = layout.db_path("archlinux", "core", "x86_64");
        write_db(&db, &[("pacman-7.0.0-1/desc", PACMAN_DESC)]);
        let source = RepoSource::new(&layout, "archlinux", "core", "x86_64", "https://unused/$repo/$arch");

        let err = source.resolve("nonexistent").unwrap_err();
        assert!(matches!(err, RepoError::PackageNotFound(_)));
    }

    #[test]
    fn test_resolve_from_fresh_db_without_network() {
        cache::capture_start_time();
        let temp = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp.path());
        layout.ensure().unwrap();
        let db = layout.db_path("archlinux", "core", "x86_64");
        write_db(&db, &[("pacman-7.0.0-1/desc", PACMAN_DESC)]);

        let source = RepoSource::new(&layout, "archlinux", "core", "x86_64", "https://unused/$repo/$arch");
        let pkgref = source.resolve("pacman").unwrap();
        assert_eq!(pkgref.version, "7.0.0-1");
    }

    #[test]
    fn test_zstd_db_roundtrip() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("core.db");
        let file = File::create(&db).unwrap();
        let enc = zstd::stream::write::Encoder::new(file, 0).unwrap();
        let mut builder = tar::Builder::new(enc);
        let mut header = tar::Header::new_gnu();
        header.set_size(PACMAN_DESC.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "pacman-7.0.0-1/desc", PACMAN_DESC.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();

        let descs = parse_descs(&db, "pacman").unwrap();
        assert_eq!(descs.len(), 1);
    }
}

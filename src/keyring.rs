//! Bootstrap and keyring management.
//!
//! Fresh chroots are populated with the loose (unverified) config first,
//! because no target keyring exists yet. The installed keyring package
//! set is then hashed into a deterministic id; a cached backup under that
//! id short-circuits the expensive `pacman-key` initialization, which
//! otherwise runs either through a bind-mounted native-architecture
//! helper tree (cross builds) or the emulated target chroot. Afterwards
//! the whole bootstrap set is re-downloaded through the strict config so
//! every package is signature-verified against the new keyring.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cache::{atomic_rename, temp_path, CacheLayout};
use crate::context::BuildContext;
use crate::nspawn::child::{bind_mount, detach};
use crate::pacman::Pacman;
use crate::process::Cmd;

/// Keyring sources installed by the distribution under the target root.
const KEYRINGS_DIR: &str = "usr/share/pacman/keyrings";
/// The initialized GnuPG home of the target's pacman.
const GNUPG_DIR: &str = "etc/pacman.d/gnupg";

/// Chroot subset that makes up a keyring helper archive: the binaries,
/// loaders and pacman state needed to run `pacman-key` natively.
pub(crate) const HELPER_PATTERNS: &[&str] = &[
    "bin",
    "etc/pacman*",
    "lib*",
    "usr/bin",
    "usr/lib/getconf",
    "usr/lib/*.so*",
    "usr/share/makepkg",
];

/// Bring up the target root and its keyring.
pub fn bootstrap(
    ctx: &BuildContext,
    layout: &CacheLayout,
    chroot: &Path,
    loose: &Pacman,
    strict: &Pacman,
) -> Result<()> {
    if let Some(archive) = &ctx.reuse_root_tar {
        info!("reusing root archive {}", archive.display());
        Cmd::new("bsdtar")
            .args(["-x", "-p", "--acls", "--xattrs", "-f"])
            .arg_path(archive)
            .arg("-C")
            .arg_path(chroot)
            .error_msg("failed to extract the reused root archive")
            .run()?;
        if ctx.cross {
            // Verifies the binfmt handler actually reaches target binaries.
            Cmd::new("chroot")
                .arg_path(chroot)
                .arg("true")
                .error_msg("cross-architecture smoke test failed; check binfmt_misc")
                .run()?;
        }
        return Ok(());
    }

    let mut set = vec!["base".to_string()];
    set.extend(ctx.keyring_packages());
    info!("bootstrapping [{}] with the loose config", set.join(", "));
    loose.sync_install(&set)?;

    let keyring_id = compute_keyring_id(&chroot.join(KEYRINGS_DIR))?;
    let backup = layout.keyring_backup(&keyring_id);
    let gnupg = chroot.join(GNUPG_DIR);

    if backup.exists() {
        info!("restoring keyring backup {}", backup.display());
        fs::create_dir_all(&gnupg)
            .with_context(|| format!("failed to create {}", gnupg.display()))?;
        Cmd::new("bsdtar")
            .args(["-x", "-p", "-f"])
            .arg_path(&backup)
            .arg("-C")
            .arg_path(&gnupg)
            .error_msg("failed to restore the keyring backup")
            .run()?;
    } else {
        initialize_keyring(ctx, chroot)?;
        save_backup(&gnupg, &backup)?;
        info!("keyring backed up as {}", keyring_id);
    }

    info!("re-verifying the bootstrap set with the strict config");
    strict.download_only(&set)?;
    Ok(())
}

/// Deterministic id over the installed keyring sources.
///
/// The id is `md5-` plus the md5 of a tar of `usr/share/pacman/keyrings`
/// rendered with stable metadata (owner and group root, mtime 0, sorted
/// entries), so identical package sets hash identically across runs.
pub fn compute_keyring_id(keyrings_dir: &Path) -> Result<String> {
    struct HashWriter(Md5);
    impl Write for HashWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.update(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let mut builder = tar::Builder::new(HashWriter(Md5::new()));
    let walk = walkdir::WalkDir::new(keyrings_dir)
        .min_depth(1)
        .sort_by_file_name();
    for entry in walk {
        let entry = entry
            .with_context(|| format!("failed to walk {}", keyrings_dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(keyrings_dir)
            .expect("walk stays under its root");
        let meta = entry.metadata()?;

        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(meta.len());
            header.set_cksum();
            let file = fs::File::open(entry.path())
                .with_context(|| format!("failed to open {}", entry.path().display()))?;
            builder.append_data(&mut header, rel, file)?;
        }
    }
    let writer = builder.into_inner().context("failed to finish keyring tar")?;
    Ok(format!("md5-{:x}", writer.0.finalize()))
}

/// Initialize and populate the keyring, natively when a helper tree is
/// available, emulated otherwise.
fn initialize_keyring(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    match &ctx.keyring_helper {
        Some(helper) => init_with_helper(chroot, helper),
        None => {
            if ctx.cross {
                info!("initializing keyring through emulation; this is slow");
            }
            for args in [&["--init"][..], &["--populate"][..]] {
                Cmd::new("chroot")
                    .arg_path(chroot)
                    .arg("pacman-key")
                    .args(args.iter().copied())
                    .error_msg("pacman-key failed in the target chroot")
                    .run()?;
            }
            Ok(())
        }
    }
}

/// Borrow native-architecture keyring tooling: extract the helper subset
/// into `<chroot>/mnt`, bind the target's dev, proc, gnupg and keyring
/// sources over the helper's, and run `pacman-key` chrooted into `/mnt`.
fn init_with_helper(chroot: &Path, helper: &Path) -> Result<()> {
    info!("initializing keyring with native helper {}", helper.display());
    let mnt = chroot.join("mnt");
    fs::create_dir_all(&mnt).with_context(|| format!("failed to create {}", mnt.display()))?;

    // The helper archive is already reduced to the borrow subset.
    Cmd::new("bsdtar")
        .args(["-x", "-p", "-f"])
        .arg_path(helper)
        .arg("-C")
        .arg_path(&mnt)
        .error_msg("failed to extract the keyring helper archive")
        .run()?;

    let binds: [(&str, PathBuf); 4] = [
        ("dev", mnt.join("dev")),
        ("proc", mnt.join("proc")),
        (GNUPG_DIR, mnt.join(GNUPG_DIR)),
        (KEYRINGS_DIR, mnt.join(KEYRINGS_DIR)),
    ];
    for (src, dst) in &binds {
        let src = chroot.join(src);
        fs::create_dir_all(&src)
            .with_context(|| format!("failed to create {}", src.display()))?;
        fs::create_dir_all(dst)
            .with_context(|| format!("failed to create {}", dst.display()))?;
        bind_mount(&src, dst)?;
    }

    let result = (|| -> Result<()> {
        for args in [&["--init"][..], &["--populate"][..]] {
            Cmd::new("chroot")
                .arg_path(&mnt)
                .arg("pacman-key")
                .args(args.iter().copied())
                .error_msg("pacman-key failed in the helper tree")
                .run()?;
        }
        Ok(())
    })();

    for (_, dst) in binds.iter().rev() {
        let _ = detach(dst);
    }
    result
}

/// Archive the initialized gnupg dir, excluding its transient sockets.
fn save_backup(gnupg: &Path, backup: &Path) -> Result<()> {
    let temp = temp_path(backup);
    if let Some(parent) = temp.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Cmd::new("bsdtar")
        .args(["-c", "-p", "-f"])
        .arg_path(&temp)
        .arg("-C")
        .arg_path(gnupg)
        .args(["--exclude", "S.*", "--exclude", "*/S.*"])
        .arg(".")
        .error_msg("failed to archive the keyring")
        .run()?;
    atomic_rename(&temp, backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("archlinux")).unwrap();
        fs::write(dir.join("archlinux/archlinux.gpg"), b"key material").unwrap();
        fs::write(dir.join("archlinux/archlinux-trusted"), b"trust db").unwrap();
    }

    #[test]
    fn test_keyring_id_is_deterministic() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        populate(a.path());
        populate(b.path());

        let id_a = compute_keyring_id(a.path()).unwrap();
        let id_b = compute_keyring_id(b.path()).unwrap();
        assert_eq!(id_a, id_b);
        assert!(id_a.starts_with("md5-"));
        assert_eq!(id_a.len(), "md5-".len() + 32);
    }

    #[test]
    fn test_keyring_id_tracks_content() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        populate(a.path());
        populate(b.path());
        fs::write(b.path().join("archlinux/archlinux.gpg"), b"other material").unwrap();

        assert_ne!(
            compute_keyring_id(a.path()).unwrap(),
            compute_keyring_id(b.path()).unwrap()
        );
    }

    #[test]
    fn test_keyring_id_ignores_ownership_and_times() {
        // The id must not depend on wall-clock state: re-hashing after a
        // delay (fresh mtimes on copy) yields the same id.
        let a = TempDir::new().unwrap();
        populate(a.path());
        let first = compute_keyring_id(a.path()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(a.path().join("archlinux/archlinux.gpg"), b"key material").unwrap();
        assert_eq!(first, compute_keyring_id(a.path()).unwrap());
    }
}

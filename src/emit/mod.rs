//! Artifact emission.
//!
//! Emitters run inside the child after setup. A per-run registry keyed by
//! artifact name makes every emitter idempotent: `disk.img` can pull in
//! the partition images without duplicating work the caller also asked
//! for directly. Every artifact writes to `<out>.temp` and renames only
//! on success.

pub mod disk;
pub mod fat;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cache::{atomic_rename, temp_path};
use crate::context::{ArtifactKind, BuildContext};
use crate::keyring::HELPER_PATTERNS;
use crate::nspawn::child::{detach, mount_tmpfs};
use crate::process::Cmd;
use crate::setup::BootArtifacts;
use crate::table::PartRole;

const MIB: u64 = 1024 * 1024;

pub struct Emitter<'a> {
    ctx: &'a BuildContext,
    chroot: &'a Path,
    boot: BootArtifacts,
    registry: BTreeMap<ArtifactKind, PathBuf>,
}

impl<'a> Emitter<'a> {
    pub fn new(ctx: &'a BuildContext, chroot: &'a Path, boot: BootArtifacts) -> Self {
        Self {
            ctx,
            chroot,
            boot,
            registry: BTreeMap::new(),
        }
    }

    /// Emit every requested artifact in caller order.
    pub fn emit_all(&mut self) -> Result<()> {
        for kind in self.ctx.creates.clone() {
            self.emit(kind)?;
        }
        Ok(())
    }

    /// Emit one artifact, reusing a previous emission from this run.
    pub fn emit(&mut self, kind: ArtifactKind) -> Result<PathBuf> {
        if let Some(done) = self.registry.get(&kind) {
            return Ok(done.clone());
        }

        let out = self.out_path(kind);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let temp = temp_path(&out);

        match kind {
            ArtifactKind::RootTar => self.emit_root_tar(&temp)?,
            ArtifactKind::PartBoot => self.emit_part_boot(&temp)?,
            ArtifactKind::PartRoot => self.emit_part_root(&temp)?,
            ArtifactKind::PartHome => self.emit_part_home(&temp)?,
            ArtifactKind::DiskImg => self.emit_disk(&temp)?,
            ArtifactKind::KeyringHelper => self.emit_keyring_helper(&temp)?,
        }

        atomic_rename(&temp, &out)?;
        info!("emitted {}", out.display());
        self.registry.insert(kind, out.clone());
        Ok(out)
    }

    fn out_path(&self, kind: ArtifactKind) -> PathBuf {
        self.ctx
            .workdir
            .join(format!("{}{}", self.ctx.out_prefix, kind))
    }

    fn part(&self, role: PartRole) -> Result<&crate::table::Partition> {
        self.ctx
            .table
            .as_ref()
            .and_then(|t| t.part(role))
            .with_context(|| format!("no {} partition declared in the table", role))
    }

    fn mkfs_args(&self, role: PartRole) -> &[String] {
        self.ctx
            .mkfs_args
            .get(role.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Tar of the whole root, excluding pseudo-filesystems and the
    /// transient gpg sockets.
    fn emit_root_tar(&self, temp: &Path) -> Result<()> {
        Cmd::new("bsdtar")
            .args(["-c", "-p", "--acls", "--xattrs", "-f"])
            .arg_path(temp)
            .arg("-C")
            .arg_path(self.chroot)
            .args([
                "--exclude", "./dev",
                "--exclude", "./mnt",
                "--exclude", "./proc",
                "--exclude", "./sys",
                "--exclude", "./etc/pacman.d/gnupg/S.*",
            ])
            .arg(".")
            .error_msg("failed to archive the root filesystem")
            .run()?;
        Ok(())
    }

    /// FAT boot image, seeded by the bootloader stage when one ran.
    fn emit_part_boot(&self, temp: &Path) -> Result<()> {
        let boot = self.part(PartRole::Boot)?;
        match &self.boot.boot_seed {
            Some(seed) => {
                fs::copy(seed, temp).with_context(|| {
                    format!("failed to seed {} from {}", temp.display(), seed.display())
                })?;
            }
            None => {
                fat::create_image(
                    temp,
                    boot.size_mib,
                    &boot.fat_volume_id(),
                    self.mkfs_args(PartRole::Boot),
                )?;
            }
        }

        let boot_dir = self.chroot.join("boot");
        let sources: Vec<PathBuf> = fs::read_dir(&boot_dir)
            .with_context(|| format!("failed to read {}", boot_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        fat::mcopy(temp, &sources, "/")?;
        Ok(())
    }

    /// ext4 root image filled straight from the chroot, with directories
    /// that belong to other partitions (or to no partition at all)
    /// shadowed by empty tmpfs mounts.
    fn emit_part_root(&self, temp: &Path) -> Result<()> {
        let root = self.part(PartRole::Root)?;
        let table = self.ctx.table.as_ref().expect("checked by part()");

        let mut shadows = vec!["dev", "mnt", "proc", "sys"];
        if table.part(PartRole::Boot).is_some() {
            shadows.push("boot");
        }
        if table.part(PartRole::Home).is_some() {
            shadows.push("home");
        }

        let mut mounted = Vec::new();
        let result = (|| -> Result<()> {
            for shadow in &shadows {
                let dir = self.chroot.join(shadow);
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                mount_tmpfs(&dir, None)?;
                mounted.push(dir);
            }
            self.mkfs_ext4(temp, root.size_mib, &root.uuid, self.chroot, PartRole::Root)
        })();
        for dir in mounted.iter().rev() {
            let _ = detach(dir);
        }
        result
    }

    fn emit_part_home(&self, temp: &Path) -> Result<()> {
        let home = self.part(PartRole::Home)?;
        let home_dir = self.chroot.join("home");
        fs::create_dir_all(&home_dir)
            .with_context(|| format!("failed to create {}", home_dir.display()))?;
        self.mkfs_ext4(temp, home.size_mib, &home.uuid, &home_dir, PartRole::Home)
    }

    fn mkfs_ext4(
        &self,
        temp: &Path,
        size_mib: u64,
        uuid: &str,
        source: &Path,
        role: PartRole,
    ) -> Result<()> {
        if temp.exists() {
            fs::remove_file(temp)
                .with_context(|| format!("failed to remove stale {}", temp.display()))?;
        }
        let file = File::create(temp)
            .with_context(|| format!("failed to create {}", temp.display()))?;
        file.set_len(size_mib * MIB)
            .with_context(|| format!("failed to size {}", temp.display()))?;
        drop(file);

        Cmd::new("mkfs.ext4")
            .args(["-q", "-U", uuid, "-d"])
            .arg_path(source)
            .args(self.mkfs_args(role).iter().map(String::as_str))
            .arg_path(temp)
            .error_msg("mkfs.ext4 -d failed; e2fsprogs 1.43+ is required")
            .run()?;
        Ok(())
    }

    /// The assembled disk: sfdisk-populated container with every role
    /// partition's image spliced in at its offset.
    fn emit_disk(&mut self, temp: &Path) -> Result<()> {
        let table = self
            .ctx
            .table
            .clone()
            .context("disk.img needs a partition table")?;

        let mut partitions = Vec::new();
        for part in &table.partitions {
            let kind = match part.role {
                PartRole::Boot => ArtifactKind::PartBoot,
                PartRole::Root => ArtifactKind::PartRoot,
                PartRole::Home => ArtifactKind::PartHome,
                // Swap space carries no image.
                PartRole::Swap => continue,
            };
            let image = self.emit(kind)?;
            partitions.push((part.offset_mib, image));
        }

        disk::assemble(temp, &table, self.boot.disk_head.as_deref(), &partitions)
    }

    /// Tarball reduced to the keyring-management subset of the root, for
    /// later cross builds to borrow as a native helper tree.
    fn emit_keyring_helper(&mut self, temp: &Path) -> Result<()> {
        let mut includes = Vec::new();
        for pattern in HELPER_PATTERNS {
            includes.push(format!("./{}", pattern));
            includes.push(format!("./{}/*", pattern));
        }

        // A root tar emitted earlier in this run already walked the
        // chroot; filter it instead of walking again.
        let source = self.registry.get(&ArtifactKind::RootTar).cloned();
        let mut cmd = Cmd::new("bsdtar").args(["-c", "-p", "-f"]).arg_path(temp);
        for include in &includes {
            cmd = cmd.arg("--include").arg(include.as_str());
        }
        match &source {
            Some(root_tar) => {
                cmd = cmd.arg(format!("@{}", root_tar.display()));
            }
            None => {
                cmd = cmd.arg("-C").arg_path(self.chroot).arg(".");
            }
        }
        cmd.error_msg("failed to archive the keyring helper subset")
            .run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildContextBuilder;
    use tempfile::TempDir;

    fn ctx_with(workdir: &Path, creates: Vec<ArtifactKind>) -> BuildContext {
        let mut b = BuildContextBuilder {
            workdir: Some(workdir.to_path_buf()),
            ..Default::default()
        };
        b.arch_host = Some("x86_64".to_string());
        b.creates = creates;
        if b
            .creates
            .iter()
            .any(|c| !matches!(c, ArtifactKind::RootTar | ArtifactKind::KeyringHelper))
        {
            b.table = Some(
                "label: gpt\naimager@boot: size=1G,type=uefi\naimager@root: size=4G\n".to_string(),
            );
        }
        b.freeze().unwrap()
    }

    #[test]
    fn test_out_path_uses_prefix() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx_with(temp.path(), vec![ArtifactKind::RootTar]);
        let emitter = Emitter::new(&ctx, temp.path(), BootArtifacts::default());
        let out = emitter.out_path(ArtifactKind::RootTar);
        assert!(out.starts_with(temp.path()));
        assert!(out
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("-root.tar"));
    }

    #[test]
    fn test_registry_makes_emission_idempotent() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx_with(temp.path(), vec![ArtifactKind::RootTar]);
        let mut emitter = Emitter::new(&ctx, temp.path(), BootArtifacts::default());
        // Pretend the artifact was already produced this run.
        let out = emitter.out_path(ArtifactKind::RootTar);
        emitter.registry.insert(ArtifactKind::RootTar, out.clone());
        assert_eq!(emitter.emit(ArtifactKind::RootTar).unwrap(), out);
    }

    #[test]
    fn test_missing_role_is_an_error() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx_with(temp.path(), vec![ArtifactKind::PartBoot]);
        let emitter = Emitter::new(&ctx, temp.path(), BootArtifacts::default());
        assert!(emitter.part(PartRole::Home).is_err());
        assert!(emitter.part(PartRole::Boot).is_ok());
    }
}

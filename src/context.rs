//! Build context and preset tables.
//!
//! The whole build is described by a [`BuildContext`] that is immutable
//! after configuration. A [`BuildContextBuilder`] collects CLI input,
//! distro and board presets transform it (plain functions over the
//! builder, one closed tag table per group), and `freeze()` produces the
//! final context. The parent serializes the frozen context to the build
//! scratch so the re-invoked child works from identical configuration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::cache::CacheLayout;
use crate::table::PartitionTable;

/// Architecture tags understood by the builder.
pub const ARCHES: &[&str] = &["x86_64", "i686", "aarch64", "armv7h", "loong64", "riscv64"];

/// Map the running process architecture to a target tag.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "i686",
        "arm" => "armv7h",
        "loongarch64" => "loong64",
        "aarch64" => "aarch64",
        "riscv64" => "riscv64",
        _ => "x86_64",
    }
}

/// EFI removable-media file suffix for an architecture (`BOOT<suffix>.EFI`).
pub fn efi_suffix(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("X64"),
        "aarch64" => Some("AA64"),
        "armv7h" => Some("ARM"),
        "riscv64" => Some("RISCV64"),
        "loong64" => Some("LOONGARCH64"),
        a if a.starts_with('i') && a.ends_with("86") => Some("IA32"),
        _ => None,
    }
}

/// The qemu-user binfmt handler name for an architecture.
pub fn qemu_arch(arch: &str) -> &str {
    match arch {
        "i686" => "i386",
        "armv7h" => "arm",
        "loong64" => "loongarch64",
        other => other,
    }
}

/// Initrd generator selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitrdMaker {
    Booster,
    Mkinitcpio,
    Dracut,
}

impl InitrdMaker {
    pub fn package(&self) -> &'static str {
        match self {
            InitrdMaker::Booster => "booster",
            InitrdMaker::Mkinitcpio => "mkinitcpio",
            InitrdMaker::Dracut => "dracut",
        }
    }
}

impl FromStr for InitrdMaker {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "booster" => Ok(InitrdMaker::Booster),
            "mkinitcpio" => Ok(InitrdMaker::Mkinitcpio),
            "dracut" => Ok(InitrdMaker::Dracut),
            other => bail!("unknown initrd maker '{}'", other),
        }
    }
}

/// Bootloader selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    SystemdBoot,
    Syslinux,
    UBoot,
}

impl FromStr for Bootloader {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "systemd-boot" => Ok(Bootloader::SystemdBoot),
            "syslinux" => Ok(Bootloader::Syslinux),
            "u-boot" => Ok(Bootloader::UBoot),
            other => bail!("unknown bootloader '{}'", other),
        }
    }
}

/// Artifacts the emitter can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArtifactKind {
    RootTar,
    PartBoot,
    PartRoot,
    PartHome,
    DiskImg,
    KeyringHelper,
}

impl ArtifactKind {
    pub const ALL: &'static [ArtifactKind] = &[
        ArtifactKind::RootTar,
        ArtifactKind::PartBoot,
        ArtifactKind::PartRoot,
        ArtifactKind::PartHome,
        ArtifactKind::DiskImg,
        ArtifactKind::KeyringHelper,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::RootTar => "root.tar",
            ArtifactKind::PartBoot => "part-boot.img",
            ArtifactKind::PartRoot => "part-root.img",
            ArtifactKind::PartHome => "part-home.img",
            ArtifactKind::DiskImg => "disk.img",
            ArtifactKind::KeyringHelper => "keyring-helper.tar",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ArtifactKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .with_context(|| format!("unknown create target '{}'", s))
    }
}

/// Target distribution identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distro {
    /// Preset tag, e.g. `archlinux`.
    pub tag: String,
    /// Stylised name, e.g. `Arch Linux ARM`.
    pub name: String,
    /// Filesystem/hostname-safe name.
    pub safe: String,
}

struct DistroPreset {
    tag: &'static str,
    name: &'static str,
    safe: &'static str,
    arches: &'static [&'static str],
    url_template: &'static str,
    keyring_packages: &'static [&'static str],
}

/// Closed table of supported distributions.
const DISTRO_PRESETS: &[DistroPreset] = &[
    DistroPreset {
        tag: "archlinux",
        name: "Arch Linux",
        safe: "archlinux",
        arches: &["x86_64"],
        url_template: "https://geo.mirror.pkgbuild.com/$repo/os/$arch",
        keyring_packages: &["archlinux-keyring"],
    },
    DistroPreset {
        tag: "archlinux32",
        name: "Arch Linux 32",
        safe: "archlinux32",
        arches: &["i686"],
        url_template: "https://de.mirror.archlinux32.org/$arch/$repo",
        keyring_packages: &["archlinux32-keyring", "archlinux-keyring"],
    },
    DistroPreset {
        tag: "archlinuxarm",
        name: "Arch Linux ARM",
        safe: "archlinuxarm",
        arches: &["aarch64", "armv7h"],
        url_template: "http://mirror.archlinuxarm.org/$arch/$repo",
        keyring_packages: &["archlinuxarm-keyring"],
    },
    DistroPreset {
        tag: "loongarchlinux",
        name: "Loong Arch Linux",
        safe: "loongarchlinux",
        arches: &["loong64"],
        url_template: "https://mirrors.loongarchlinux.org/archlinux/$repo/os/$arch",
        keyring_packages: &["loongarchlinux-keyring"],
    },
    DistroPreset {
        tag: "archriscv",
        name: "Arch Linux RISC-V",
        safe: "archriscv",
        arches: &["riscv64"],
        url_template: "https://riscv.mirror.pkgbuild.com/repo/$repo",
        keyring_packages: &["archlinux-keyring"],
    },
];

pub fn distro_tags() -> Vec<&'static str> {
    DISTRO_PRESETS.iter().map(|d| d.tag).collect()
}

pub fn describe_distro(tag: &str) -> Option<String> {
    DISTRO_PRESETS.iter().find(|d| d.tag == tag).map(|d| {
        format!(
            "{}: {} (arches: {}, mirror: {})",
            d.tag,
            d.name,
            d.arches.join(", "),
            d.url_template
        )
    })
}

struct BoardPreset {
    tag: &'static str,
    description: &'static str,
    apply: fn(&mut BuildContextBuilder),
}

/// Closed table of board presets; each is a plain transform over the builder.
const BOARD_PRESETS: &[BoardPreset] = &[
    BoardPreset {
        tag: "none",
        description: "no board-specific configuration",
        apply: |_| {},
    },
    BoardPreset {
        tag: "x86_64_uefi",
        description: "generic x86_64 UEFI machine, systemd-boot on a GPT ESP",
        apply: |b| {
            b.distro.get_or_insert_with(|| "archlinux".to_string());
            b.arch_target.get_or_insert_with(|| "x86_64".to_string());
            if b.table.is_none() {
                b.table = Some(table_preset("gpt_esp_root").expect("preset exists").to_string());
            }
            if b.bootloaders.is_empty() {
                b.bootloaders.push(Bootloader::SystemdBoot);
            }
            if b.kernels.is_empty() {
                b.kernels.push("linux".to_string());
            }
            b.microcodes.insert("amd-ucode".to_string());
            b.microcodes.insert("intel-ucode".to_string());
        },
    },
    BoardPreset {
        tag: "aarch64_uefi",
        description: "generic aarch64 UEFI machine, systemd-boot on a GPT ESP",
        apply: |b| {
            b.distro.get_or_insert_with(|| "archlinuxarm".to_string());
            b.arch_target.get_or_insert_with(|| "aarch64".to_string());
            if b.table.is_none() {
                b.table = Some(table_preset("gpt_esp_root").expect("preset exists").to_string());
            }
            if b.bootloaders.is_empty() {
                b.bootloaders.push(Bootloader::SystemdBoot);
            }
            if b.kernels.is_empty() {
                b.kernels.push("linux-aarch64".to_string());
            }
        },
    },
    BoardPreset {
        tag: "armv7h_extlinux",
        description: "generic armv7h board, u-boot extlinux on a DOS table",
        apply: |b| {
            b.distro.get_or_insert_with(|| "archlinuxarm".to_string());
            b.arch_target.get_or_insert_with(|| "armv7h".to_string());
            if b.table.is_none() {
                b.table = Some(table_preset("dos_boot_root").expect("preset exists").to_string());
            }
            if b.bootloaders.is_empty() {
                b.bootloaders.push(Bootloader::UBoot);
            }
            if b.kernels.is_empty() {
                b.kernels.push("linux-armv7".to_string());
            }
        },
    },
];

pub fn board_tags() -> Vec<&'static str> {
    BOARD_PRESETS.iter().map(|b| b.tag).collect()
}

pub fn describe_board(tag: &str) -> Option<String> {
    BOARD_PRESETS
        .iter()
        .find(|b| b.tag == tag)
        .map(|b| format!("{}: {}", b.tag, b.description))
}

/// Named partition table declarations for `--table =<preset>`.
const TABLE_PRESETS: &[(&str, &str)] = &[
    (
        "gpt_esp_root",
        "label: gpt\n\
         aimager@boot: size=1G,type=uefi\n\
         aimager@root: size=16G,type=linux\n",
    ),
    (
        "dos_boot_root",
        "label: dos\n\
         aimager@boot: size=256M,type=c\n\
         aimager@root: size=16G,type=83\n",
    ),
];

pub fn table_preset(tag: &str) -> Option<&'static str> {
    TABLE_PRESETS.iter().find(|(t, _)| *t == tag).map(|(_, d)| *d)
}

pub fn table_tags() -> Vec<&'static str> {
    TABLE_PRESETS.iter().map(|(t, _)| *t).collect()
}

/// Immutable-after-configuration description of one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContext {
    pub arch_host: String,
    pub arch_target: String,
    pub cross: bool,
    pub distro: Distro,
    pub board: String,
    pub build_id: String,
    pub repo_core: String,
    /// Caller-supplied base repo order; empty means "derive from the
    /// target's pacman.conf".
    pub repos_base: Vec<String>,
    /// Ordered extra third-party repo tags.
    pub extra_repos: Vec<String>,
    /// Mirror url template per repo tag (base repos share the distro
    /// default unless overridden).
    pub repo_urls: BTreeMap<String, String>,
    /// Keyring packages per repo tag, collected during configuration.
    pub repo_keyrings: BTreeMap<String, Vec<String>>,
    pub initrd_maker: Option<InitrdMaker>,
    pub bootloaders: Vec<Bootloader>,
    pub kernels: Vec<String>,
    pub microcodes: BTreeSet<String>,
    pub packages: BTreeSet<String>,
    /// Kernel cmdline appends keyed by kernel name, `all` or `default`.
    pub appends: BTreeMap<String, String>,
    pub locales: Vec<String>,
    pub hostname: Option<String>,
    pub reuse_root_tar: Option<PathBuf>,
    pub keyring_helper: Option<PathBuf>,
    pub tmpfs_root_options: Option<String>,
    pub out_prefix: String,
    pub overlays: Vec<PathBuf>,
    /// Extra mkfs arguments per partition role.
    pub mkfs_args: BTreeMap<String, Vec<String>>,
    pub table: Option<PartitionTable>,
    pub creates: Vec<ArtifactKind>,
    pub freeze_pacman_config: bool,
    pub freeze_pacman_static: bool,
    pub use_pacman_static: bool,
    pub async_child: bool,
    pub only_backup_keyring: bool,
    pub only_prepare_child: bool,
    pub start_time_unix: u64,
    pub workdir: PathBuf,
}

impl BuildContext {
    pub fn layout(&self) -> CacheLayout {
        CacheLayout::new(&self.workdir)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.layout().build_dir(&self.build_id)
    }

    /// The target chroot inside the build scratch.
    pub fn chroot(&self) -> PathBuf {
        self.build_dir().join("root")
    }

    /// Mirror template for one repo tag.
    pub fn mirror_for(&self, repo: &str) -> Result<&str> {
        self.repo_urls
            .get(repo)
            .map(String::as_str)
            .with_context(|| format!("no mirror url configured for repo '{}'", repo))
    }

    /// Kernel cmdline append for one kernel: the kernel's own entry wins,
    /// then `all`, then `default`.
    pub fn append_for(&self, kernel: &str) -> Option<&str> {
        self.appends
            .get(kernel)
            .or_else(|| self.appends.get("all"))
            .or_else(|| self.appends.get("default"))
            .map(String::as_str)
    }

    /// All keyring packages of the configured repos, de-duplicated.
    pub fn keyring_packages(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for packages in self.repo_keyrings.values() {
            for package in packages {
                if seen.insert(package.clone()) {
                    out.push(package.clone());
                }
            }
        }
        out
    }
}

/// Mutable collection state for a context, transformed by presets.
#[derive(Debug, Default)]
pub struct BuildContextBuilder {
    pub arch_host: Option<String>,
    pub arch_target: Option<String>,
    pub distro: Option<String>,
    pub board: Option<String>,
    pub build_id: Option<String>,
    pub repo_core: Option<String>,
    pub repos_base: Vec<String>,
    pub extra_repos: Vec<String>,
    pub repo_urls: BTreeMap<String, String>,
    pub repo_url_parent: Option<String>,
    pub initrd_maker: Option<InitrdMaker>,
    pub bootloaders: Vec<Bootloader>,
    pub kernels: Vec<String>,
    pub microcodes: BTreeSet<String>,
    pub packages: BTreeSet<String>,
    pub appends: BTreeMap<String, String>,
    pub locales: Vec<String>,
    pub hostname: Option<String>,
    pub reuse_root_tar: Option<PathBuf>,
    pub keyring_helper: Option<PathBuf>,
    pub tmpfs_root_options: Option<String>,
    pub out_prefix: Option<String>,
    pub overlays: Vec<PathBuf>,
    pub mkfs_args: BTreeMap<String, Vec<String>>,
    /// Raw table declaration (inline, from `@file` or a `=preset`).
    pub table: Option<String>,
    pub creates: Vec<ArtifactKind>,
    pub freeze_pacman_config: bool,
    pub freeze_pacman_static: bool,
    pub use_pacman_static: bool,
    pub async_child: bool,
    pub only_backup_keyring: bool,
    pub only_prepare_child: bool,
    pub workdir: Option<PathBuf>,
}

impl BuildContextBuilder {
    /// Apply a board preset from the closed tag table.
    pub fn apply_board(&mut self, tag: &str) -> Result<()> {
        let preset = BOARD_PRESETS
            .iter()
            .find(|b| b.tag == tag)
            .with_context(|| {
                format!("unknown board '{}'; known: {}", tag, board_tags().join(", "))
            })?;
        self.board = Some(tag.to_string());
        (preset.apply)(self);
        Ok(())
    }

    /// Freeze the builder into an immutable context.
    pub fn freeze(mut self) -> Result<BuildContext> {
        let arch_host = self
            .arch_host
            .unwrap_or_else(|| host_arch().to_string());
        let distro_tag = self.distro.clone().unwrap_or_else(|| "archlinux".to_string());
        let preset = DISTRO_PRESETS
            .iter()
            .find(|d| d.tag == distro_tag)
            .with_context(|| {
                format!(
                    "unknown distro '{}'; known: {}",
                    distro_tag,
                    distro_tags().join(", ")
                )
            })?;

        let arch_target = self
            .arch_target
            .unwrap_or_else(|| preset.arches[0].to_string());
        if !ARCHES.contains(&arch_target.as_str()) {
            bail!(
                "unknown target architecture '{}'; known: {}",
                arch_target,
                ARCHES.join(", ")
            );
        }
        if !preset.arches.contains(&arch_target.as_str()) {
            bail!(
                "distro '{}' does not support architecture '{}' (supported: {})",
                preset.tag,
                arch_target,
                preset.arches.join(", ")
            );
        }

        let repo_core = self.repo_core.unwrap_or_else(|| "core".to_string());
        if !self.repos_base.is_empty() {
            if !self.repos_base.iter().any(|r| r == &repo_core) {
                bail!(
                    "base repo list [{}] does not contain the core repo '{}'",
                    self.repos_base.join(", "),
                    repo_core
                );
            }
            if self.repos_base.iter().any(|r| r == "options") {
                bail!("base repo list must not contain the reserved name 'options'");
            }
        }

        // Base repos and the core repo default to the distro mirror; a
        // `--repo-url-parent` override rebuilds that default; explicit
        // per-repo urls always win.
        let default_template = match &self.repo_url_parent {
            Some(parent) => format!("{}/$repo/os/$arch", parent.trim_end_matches('/')),
            None => preset.url_template.to_string(),
        };
        let mut repo_urls = BTreeMap::new();
        repo_urls.insert(repo_core.clone(), default_template.clone());
        for repo in &self.repos_base {
            repo_urls.insert(repo.clone(), default_template.clone());
        }
        for repo in &self.extra_repos {
            if !self.repo_urls.contains_key(repo) {
                bail!("extra repo '{0}' has no mirror; pass --repo-url {0}=<template>", repo);
            }
        }
        repo_urls.extend(self.repo_urls.clone());

        let mut repo_keyrings = BTreeMap::new();
        repo_keyrings.insert(
            repo_core.clone(),
            preset
                .keyring_packages
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        for repo in &self.extra_repos {
            // Third-party repos conventionally ship `<repo>-keyring`.
            repo_keyrings
                .entry(repo.clone())
                .or_insert_with(|| vec![format!("{}-keyring", repo)]);
        }

        let board = self.board.unwrap_or_else(|| "none".to_string());
        let timestamp = build_timestamp();
        let build_id = self.build_id.unwrap_or_else(|| {
            format!("{}-{}-{}-{}", preset.safe, arch_target, board, timestamp)
        });
        let out_prefix = self.out_prefix.unwrap_or_else(|| {
            format!("out/{}-{}-{}-{}-", preset.safe, arch_target, board, timestamp)
        });

        let table = match self.table.take() {
            Some(decl) => Some(PartitionTable::parse(&decl)?),
            None => None,
        };

        let needs_table = self.creates.iter().any(|c| {
            matches!(
                c,
                ArtifactKind::PartBoot
                    | ArtifactKind::PartRoot
                    | ArtifactKind::PartHome
                    | ArtifactKind::DiskImg
            )
        });
        if needs_table && table.is_none() {
            bail!("partition image targets require --table");
        }

        let workdir = match self.workdir {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to read current dir")?,
        };

        Ok(BuildContext {
            cross: arch_host != arch_target,
            arch_host,
            arch_target,
            distro: Distro {
                tag: preset.tag.to_string(),
                name: preset.name.to_string(),
                safe: preset.safe.to_string(),
            },
            board,
            build_id,
            repo_core,
            repos_base: self.repos_base,
            extra_repos: self.extra_repos,
            repo_urls,
            repo_keyrings,
            initrd_maker: self.initrd_maker,
            bootloaders: self.bootloaders,
            kernels: self.kernels,
            microcodes: self.microcodes,
            packages: self.packages,
            appends: self.appends,
            locales: self.locales,
            hostname: self.hostname,
            reuse_root_tar: self.reuse_root_tar,
            keyring_helper: self.keyring_helper,
            tmpfs_root_options: self.tmpfs_root_options,
            out_prefix,
            overlays: self.overlays,
            mkfs_args: self.mkfs_args,
            table,
            creates: self.creates,
            freeze_pacman_config: self.freeze_pacman_config,
            freeze_pacman_static: self.freeze_pacman_static,
            use_pacman_static: self.use_pacman_static,
            async_child: self.async_child,
            only_backup_keyring: self.only_backup_keyring,
            only_prepare_child: self.only_prepare_child,
            start_time_unix: crate::cache::start_time_unix(),
            workdir,
        })
    }
}

fn build_timestamp() -> String {
    let format = time::format_description::parse("[year][month][day][hour][minute][second]")
        .expect("static format");
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "00000000000000".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> BuildContextBuilder {
        BuildContextBuilder {
            workdir: Some(PathBuf::from("/work")),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_context_is_native_archlinux() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        let ctx = b.freeze().unwrap();
        assert_eq!(ctx.distro.tag, "archlinux");
        assert_eq!(ctx.arch_target, "x86_64");
        assert!(!ctx.cross);
        assert_eq!(ctx.repo_core, "core");
        assert!(ctx.out_prefix.starts_with("out/archlinux-x86_64-none-"));
    }

    #[test]
    fn test_board_preset_cross() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.apply_board("aarch64_uefi").unwrap();
        let ctx = b.freeze().unwrap();
        assert_eq!(ctx.distro.tag, "archlinuxarm");
        assert_eq!(ctx.arch_target, "aarch64");
        assert!(ctx.cross);
        assert_eq!(ctx.bootloaders, vec![Bootloader::SystemdBoot]);
        assert!(ctx.table.is_some());
        assert_eq!(ctx.kernels, vec!["linux-aarch64".to_string()]);
    }

    #[test]
    fn test_unknown_board() {
        let mut b = builder();
        assert!(b.apply_board("toaster").is_err());
    }

    #[test]
    fn test_arch_not_supported_by_distro() {
        let mut b = builder();
        b.distro = Some("archlinux".to_string());
        b.arch_target = Some("aarch64".to_string());
        assert!(b.freeze().is_err());
    }

    #[test]
    fn test_base_repos_must_contain_core() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.repos_base = vec!["extra".to_string()];
        let err = b.freeze().unwrap_err();
        assert!(err.to_string().contains("core"));
    }

    #[test]
    fn test_base_repos_reject_options() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.repos_base = vec!["core".to_string(), "options".to_string()];
        assert!(b.freeze().is_err());
    }

    #[test]
    fn test_extra_repo_requires_url() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.extra_repos = vec!["archlinuxcn".to_string()];
        assert!(b.freeze().is_err());

        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.extra_repos = vec!["archlinuxcn".to_string()];
        b.repo_urls.insert(
            "archlinuxcn".to_string(),
            "https://repo.archlinuxcn.org/$arch".to_string(),
        );
        let ctx = b.freeze().unwrap();
        assert_eq!(
            ctx.mirror_for("archlinuxcn").unwrap(),
            "https://repo.archlinuxcn.org/$arch"
        );
        assert_eq!(
            ctx.repo_keyrings.get("archlinuxcn").unwrap(),
            &vec!["archlinuxcn-keyring".to_string()]
        );
    }

    #[test]
    fn test_partition_targets_require_table() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.creates = vec![ArtifactKind::DiskImg];
        assert!(b.freeze().unwrap_err().to_string().contains("--table"));
    }

    #[test]
    fn test_append_resolution() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.appends.insert("all".to_string(), " quiet".to_string());
        b.appends.insert("linux-lts".to_string(), " debug".to_string());
        let ctx = b.freeze().unwrap();
        assert_eq!(ctx.append_for("linux"), Some(" quiet"));
        assert_eq!(ctx.append_for("linux-lts"), Some(" debug"));
    }

    #[test]
    fn test_efi_suffix_mapping() {
        assert_eq!(efi_suffix("x86_64"), Some("X64"));
        assert_eq!(efi_suffix("aarch64"), Some("AA64"));
        assert_eq!(efi_suffix("i686"), Some("IA32"));
        assert_eq!(efi_suffix("armv7h"), Some("ARM"));
        assert_eq!(efi_suffix("riscv64"), Some("RISCV64"));
    }

    #[test]
    fn test_context_roundtrips_through_json() {
        let mut b = builder();
        b.arch_host = Some("x86_64".to_string());
        b.apply_board("x86_64_uefi").unwrap();
        let ctx = b.freeze().unwrap();
        let json = serde_json::to_string(&ctx).unwrap();
        let back: BuildContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.distro.tag, ctx.distro.tag);
        assert_eq!(back.table.unwrap().partitions.len(), 2);
    }
}

//! Command-line surface and run-target dispatch.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::cache::CacheLayout;
use crate::context::{
    board_tags, describe_board, describe_distro, distro_tags, table_preset, table_tags,
    ArtifactKind, BuildContext, BuildContextBuilder,
};
use crate::nspawn;
use crate::preflight;

#[derive(Parser)]
#[command(
    name = "aimager",
    about = "Rootless cross-architecture builder for Arch Linux and its ports",
    version
)]
pub struct Cli {
    /// Host architecture (defaults to the running machine)
    #[arg(long)]
    arch_host: Option<String>,

    /// Target architecture
    #[arg(long, visible_alias = "arch")]
    arch_target: Option<String>,

    /// Board preset ('help' or 'help=<tag>' to list)
    #[arg(long)]
    board: Option<String>,

    /// Target distribution ('help' or 'help=<tag>' to list)
    #[arg(long)]
    distro: Option<String>,

    /// Stable identifier for this build
    #[arg(long)]
    build_id: Option<String>,

    /// Prefix for emitted artifact paths
    #[arg(long)]
    out_prefix: Option<String>,

    /// Add an extra third-party repo (repeatable)
    #[arg(long = "add-repo")]
    add_repo: Vec<String>,

    /// Add extra third-party repos, comma separated
    #[arg(long = "add-repos", value_delimiter = ',')]
    add_repos: Vec<String>,

    /// Name of the distribution's core repo
    #[arg(long)]
    repo_core: Option<String>,

    /// Parent url the default mirror template is derived from
    #[arg(long)]
    repo_url_parent: Option<String>,

    /// Mirror url template for one repo, as <tag>=<template> (repeatable)
    #[arg(long = "repo-url", value_name = "TAG=URL")]
    repo_url: Vec<String>,

    /// Base repos in order, comma separated (default: from the target's
    /// own pacman.conf)
    #[arg(long = "repos-base", value_delimiter = ',')]
    repos_base: Vec<String>,

    /// Seed the chroot from a previously emitted root tarball
    #[arg(long)]
    reuse_root_tar: Option<PathBuf>,

    /// Initrd generator: booster, mkinitcpio or dracut
    #[arg(long)]
    initrd_maker: Option<String>,

    /// Install an additional package (repeatable)
    #[arg(long = "install-pkg")]
    install_pkg: Vec<String>,

    /// Install additional packages, comma separated
    #[arg(long = "install-pkgs", value_delimiter = ',')]
    install_pkgs: Vec<String>,

    /// Kernel cmdline append, as <kernel>=<args>, all=<args> or bare args
    /// applied as the default (repeatable)
    #[arg(long = "append", value_name = "[KERNEL=]ARGS")]
    append: Vec<String>,

    /// Enable a locale (repeatable)
    #[arg(long = "locale")]
    locale: Vec<String>,

    /// Enable locales, comma separated
    #[arg(long = "locales", value_delimiter = ',')]
    locales: Vec<String>,

    /// Target hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Extract an overlay tarball over the finished root (repeatable)
    #[arg(long = "overlay")]
    overlay: Vec<PathBuf>,

    /// Partition table: inline sfdisk dump text, '@<file>', '=<preset>',
    /// 'help' or 'help=<preset>'
    #[arg(long)]
    table: Option<String>,

    /// Extra mkfs argument for one partition, as <role>=<arg> (repeatable)
    #[arg(long = "mkfs-arg", value_name = "ROLE=ARG")]
    mkfs_arg: Vec<String>,

    /// Map ids with newuidmap/newgidmap instead of the unshare helper
    #[arg(long)]
    async_child: bool,

    /// Keep existing generated pacman configs
    #[arg(long)]
    freeze_pacman_config: bool,

    /// Keep an existing extracted pacman-static
    #[arg(long)]
    freeze_pacman_static: bool,

    /// Native-architecture helper tarball for keyring initialization
    #[arg(long)]
    keyring_helper: Option<PathBuf>,

    /// Build the chroot on a tmpfs, with optional mount options
    #[arg(long, value_name = "OPTS", num_args = 0..=1, default_missing_value = "")]
    tmpfs_root: Option<String>,

    /// Use the static pacman even when the host has one
    #[arg(long)]
    use_pacman_static: bool,

    /// Only verify binfmt wiring for the target architecture, then exit
    #[arg(long)]
    binfmt_check: bool,

    /// Remove all build scratch directories, then exit
    #[arg(long)]
    clean_builds: bool,

    /// Artifact to emit ('help' to list; repeatable)
    #[arg(long = "create")]
    create: Vec<String>,

    /// Prepare configs and the child context, but do not spawn the child
    #[arg(long)]
    only_prepare_child: bool,

    /// Stop after the keyring is initialized and backed up
    #[arg(long)]
    only_backup_keyring: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Internal: the namespaced child half of a build.
    #[command(hide = true)]
    Child {
        #[arg(long)]
        context: PathBuf,
    },
}

/// `help` / `help=<tag>` values accepted by several options.
fn help_request(value: &str) -> Option<Option<&str>> {
    if value == "help" {
        return Some(None);
    }
    value.strip_prefix("help=").map(Some)
}

impl Cli {
    pub fn run(self) -> Result<()> {
        if let Some(Command::Child { context }) = &self.command {
            return nspawn::child::run(context);
        }

        if self.print_help_listings()? {
            return Ok(());
        }

        if self.clean_builds {
            let layout = CacheLayout::current()?;
            let removed = layout.clean_builds()?;
            println!("removed {} build scratch directories", removed);
            return Ok(());
        }

        let binfmt_check = self.binfmt_check;
        let ctx = self.into_context()?;

        if binfmt_check {
            preflight::check_binfmt(&ctx.arch_host, &ctx.arch_target)?;
            println!(
                "binfmt handler for {} is usable on {}",
                ctx.arch_target, ctx.arch_host
            );
            return Ok(());
        }

        nspawn::run_parent(&ctx)
    }

    /// Handle the `help`/`help=<tag>` values; true when one was printed.
    fn print_help_listings(&self) -> Result<bool> {
        if let Some(request) = self.board.as_deref().and_then(help_request) {
            match request {
                None => {
                    for tag in board_tags() {
                        println!("{}", describe_board(tag).expect("listed tag"));
                    }
                }
                Some(tag) => match describe_board(tag) {
                    Some(text) => println!("{}", text),
                    None => bail!("unknown board '{}'", tag),
                },
            }
            return Ok(true);
        }

        if let Some(request) = self.distro.as_deref().and_then(help_request) {
            match request {
                None => {
                    for tag in distro_tags() {
                        println!("{}", describe_distro(tag).expect("listed tag"));
                    }
                }
                Some(tag) => match describe_distro(tag) {
                    Some(text) => println!("{}", text),
                    None => bail!("unknown distro '{}'", tag),
                },
            }
            return Ok(true);
        }

        if let Some(request) = self.table.as_deref().and_then(help_request) {
            match request {
                None => {
                    for tag in table_tags() {
                        println!("{}", tag);
                    }
                }
                Some(tag) => match table_preset(tag) {
                    Some(decl) => print!("{}", decl),
                    None => bail!("unknown table preset '{}'", tag),
                },
            }
            return Ok(true);
        }

        if self.create.iter().any(|c| c == "help") {
            for kind in ArtifactKind::ALL {
                println!("{}", kind);
            }
            return Ok(true);
        }

        Ok(false)
    }

    fn into_context(self) -> Result<BuildContext> {
        let mut builder = BuildContextBuilder {
            arch_host: self.arch_host,
            arch_target: self.arch_target,
            distro: self.distro,
            build_id: self.build_id,
            repo_core: self.repo_core,
            repo_url_parent: self.repo_url_parent,
            repos_base: self.repos_base,
            reuse_root_tar: self.reuse_root_tar,
            keyring_helper: self.keyring_helper,
            tmpfs_root_options: self.tmpfs_root,
            out_prefix: self.out_prefix,
            hostname: self.hostname,
            overlays: self.overlay,
            async_child: self.async_child,
            freeze_pacman_config: self.freeze_pacman_config,
            freeze_pacman_static: self.freeze_pacman_static,
            use_pacman_static: self.use_pacman_static,
            only_backup_keyring: self.only_backup_keyring,
            only_prepare_child: self.only_prepare_child,
            ..Default::default()
        };

        builder.extra_repos = self
            .add_repo
            .into_iter()
            .chain(self.add_repos)
            .collect();
        builder.repo_urls = parse_pairs(&self.repo_url, "--repo-url")?
            .into_iter()
            .collect();
        builder.packages = self
            .install_pkg
            .into_iter()
            .chain(self.install_pkgs)
            .collect();
        builder.locales = self.locale.into_iter().chain(self.locales).collect();

        for entry in self.append {
            match entry.split_once('=') {
                Some((kernel, args)) if !kernel.contains(' ') => {
                    builder.appends.insert(kernel.to_string(), args.to_string());
                }
                _ => {
                    builder.appends.insert("default".to_string(), entry);
                }
            }
        }

        let mut mkfs_args: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (role, arg) in parse_pairs(&self.mkfs_arg, "--mkfs-arg")? {
            mkfs_args.entry(role).or_default().push(arg);
        }
        builder.mkfs_args = mkfs_args;

        builder.initrd_maker = self
            .initrd_maker
            .as_deref()
            .map(str::parse)
            .transpose()?;

        builder.table = match self.table {
            Some(value) => Some(resolve_table(&value)?),
            None => None,
        };

        for target in &self.create {
            builder.creates.push(target.parse()?);
        }

        if let Some(board) = &self.board {
            builder.apply_board(board)?;
        }

        builder.freeze()
    }
}

/// Split repeatable `KEY=VALUE` option values.
fn parse_pairs(values: &[String], option: &str) -> Result<Vec<(String, String)>> {
    values
        .iter()
        .map(|value| {
            value
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("{} expects KEY=VALUE, got '{}'", option, value))
        })
        .collect()
}

/// A table value is a preset reference, a file reference or inline text.
fn resolve_table(value: &str) -> Result<String> {
    if let Some(tag) = value.strip_prefix('=') {
        return table_preset(tag)
            .map(str::to_string)
            .with_context(|| {
                format!(
                    "unknown table preset '{}'; known: {}",
                    tag,
                    table_tags().join(", ")
                )
            });
    }
    if let Some(path) = value.strip_prefix('@') {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read table file '{}'", path));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_help_request_values() {
        assert_eq!(help_request("help"), Some(None));
        assert_eq!(help_request("help=foo"), Some(Some("foo")));
        assert_eq!(help_request("x86_64_uefi"), None);
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(
            &["boot=-F32".to_string(), "root=-O^has_journal".to_string()],
            "--mkfs-arg",
        )
        .unwrap();
        assert_eq!(pairs[0], ("boot".to_string(), "-F32".to_string()));
        assert!(parse_pairs(&["novalue".to_string()], "--mkfs-arg").is_err());
    }

    #[test]
    fn test_resolve_table_preset() {
        let decl = resolve_table("=gpt_esp_root").unwrap();
        assert!(decl.starts_with("label: gpt"));
        assert!(resolve_table("=missing").is_err());
    }

    #[test]
    fn test_resolve_table_inline() {
        let decl = resolve_table("label: dos\naimager@root: size=1G\n").unwrap();
        assert!(decl.starts_with("label: dos"));
    }

    #[test]
    fn test_cli_parses_build_invocation() {
        let cli = Cli::try_parse_from([
            "aimager",
            "--distro",
            "archlinux",
            "--arch-target",
            "x86_64",
            "--create",
            "root.tar",
            "--install-pkg",
            "vim",
            "--locale",
            "en_US.UTF-8",
        ])
        .unwrap();
        assert_eq!(cli.distro.as_deref(), Some("archlinux"));
        assert_eq!(cli.create, vec!["root.tar".to_string()]);
    }

    #[test]
    fn test_cli_child_subcommand_hidden() {
        let cli =
            Cli::try_parse_from(["aimager", "child", "--context", "/tmp/context.json"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Child { .. })));
    }
}

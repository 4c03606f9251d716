//! Package manager configuration and invocation.
//!
//! Two configurations are generated per build with identical `[options]`
//! and repo sections: a *loose* one that never verifies signatures (used
//! before the target keyring exists) and a *strict* one that requires
//! signed databases (used for everything after keyring initialization).

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::{self, write_atomic, CacheLayout};
use crate::cache::repo::RepoSource;
use crate::context::BuildContext;
use crate::process::Cmd;

/// Parse ordered `[section]` headers out of a pacman.conf, discarding
/// `[options]`.
pub fn repos_from_conf(conf: &str) -> Vec<String> {
    let mut repos = Vec::new();
    for line in conf.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if name != "options" {
                repos.push(name.to_string());
            }
        }
    }
    repos
}

/// The generated loose/strict config pair for one build.
#[derive(Debug, Clone)]
pub struct PacmanConfigs {
    pub loose: PathBuf,
    pub strict: PathBuf,
    /// Base repos in final order.
    pub repos: Vec<String>,
}

impl PacmanConfigs {
    fn paths(build_dir: &Path) -> (PathBuf, PathBuf) {
        (
            build_dir.join("etc/pacman-loose.conf"),
            build_dir.join("etc/pacman-strict.conf"),
        )
    }

    /// Locate previously generated configs (child side; the parent has
    /// already written them into the build scratch).
    pub fn locate(build_dir: &Path) -> Result<Self> {
        let (loose, strict) = Self::paths(build_dir);
        if !loose.exists() || !strict.exists() {
            bail!(
                "pacman configs missing under {}; the parent did not prepare this build",
                build_dir.display()
            );
        }
        Ok(Self {
            loose,
            strict,
            repos: Vec::new(),
        })
    }

    /// Generate both configs, honouring the freeze policies.
    pub fn generate(ctx: &BuildContext, layout: &CacheLayout) -> Result<Self> {
        let build_dir = ctx.build_dir();
        let (loose, strict) = Self::paths(&build_dir);

        if ctx.freeze_pacman_config && loose.exists() && strict.exists() {
            debug!("pacman configs frozen, not regenerating");
            let repos = Self::derive_repos(ctx, layout)?;
            return Ok(Self { loose, strict, repos });
        }
        if cache::is_fresh(&loose) && cache::is_fresh(&strict) {
            debug!("pacman configs already generated this run");
            let repos = Self::derive_repos(ctx, layout)?;
            return Ok(Self { loose, strict, repos });
        }

        let repos = Self::derive_repos(ctx, layout)?;
        info!(
            "generating pacman configs for repos [{}]",
            repos.join(", ")
        );

        let chroot = ctx.chroot();
        let body = render_body(ctx, layout, &chroot, &repos)?;
        write_atomic(&loose, format!("{}SigLevel = Never\n", body).as_bytes())?;
        write_atomic(
            &strict,
            format!("{}SigLevel = Required DatabaseRequired\n", body).as_bytes(),
        )?;
        Ok(Self { loose, strict, repos })
    }

    /// Base repo order: the caller's list when supplied (already
    /// validated at freeze), otherwise the section order of the target's
    /// own pacman.conf.
    fn derive_repos(ctx: &BuildContext, layout: &CacheLayout) -> Result<Vec<String>> {
        if !ctx.repos_base.is_empty() {
            return Ok(ctx.repos_base.clone());
        }

        let source = RepoSource::new(
            layout,
            &ctx.distro.safe,
            &ctx.repo_core,
            &ctx.arch_target,
            ctx.mirror_for(&ctx.repo_core)?,
        );
        let conf_path = source.extract_file("pacman", "etc/pacman.conf")?;
        let conf = std::fs::read_to_string(&conf_path)
            .with_context(|| format!("failed to read {}", conf_path.display()))?;
        let repos = repos_from_conf(&conf);
        if !repos.iter().any(|r| r == &ctx.repo_core) {
            bail!(
                "target pacman.conf declares no '{}' repo (found: [{}])",
                ctx.repo_core,
                repos.join(", ")
            );
        }
        Ok(repos)
    }
}

/// Shared config body: `[options]` bound into the chroot plus one section
/// per base and extra repo. The caller appends the SigLevel line.
fn render_body(
    ctx: &BuildContext,
    layout: &CacheLayout,
    chroot: &Path,
    repos: &[String],
) -> Result<String> {
    let mut body = String::from("[options]\n");
    body.push_str(&format!("RootDir = {}\n", chroot.display()));
    body.push_str(&format!("DBPath = {}\n", chroot.join("var/lib/pacman").display()));
    body.push_str(&format!("CacheDir = {}\n", layout.pkg_dir().display()));
    body.push_str(&format!("LogFile = {}\n", chroot.join("var/log/pacman.log").display()));
    body.push_str(&format!("GPGDir = {}\n", chroot.join("etc/pacman.d/gnupg").display()));
    body.push_str(&format!("HookDir = {}\n", chroot.join("etc/pacman.d/hooks").display()));
    body.push_str(&format!("Architecture = {}\n", ctx.arch_target));

    for repo in repos {
        body.push_str(&format!("\n[{}]\nServer = {}\n", repo, ctx.mirror_for(repo)?));
    }
    for repo in &ctx.extra_repos {
        body.push_str(&format!("\n[{}]\nServer = {}\n", repo, ctx.mirror_for(repo)?));
    }

    body.push('\n');
    Ok(body)
}

/// Repo sections for the extra third-party repos, as appended to the
/// target's own `/etc/pacman.conf` during setup.
pub fn render_extra_repo_sections(ctx: &BuildContext) -> Result<String> {
    let mut out = String::new();
    for repo in &ctx.extra_repos {
        out.push_str(&format!("\n[{}]\nServer = {}\n", repo, ctx.mirror_for(repo)?));
    }
    Ok(out)
}

/// A bound package-manager invocation: one binary, one config.
#[derive(Debug, Clone)]
pub struct Pacman {
    program: PathBuf,
    config: PathBuf,
}

impl Pacman {
    pub fn new(program: PathBuf, config: PathBuf) -> Self {
        Self { program, config }
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.program.to_string_lossy())
            .arg("--config")
            .arg_path(&self.config)
            .arg("--noconfirm")
    }

    /// `-Sy <packages>`: refresh databases and install.
    pub fn sync_install(&self, packages: &[String]) -> Result<()> {
        self.cmd()
            .arg("-Sy")
            .args(packages.iter().map(String::as_str))
            .error_msg("package installation failed")
            .run()?;
        Ok(())
    }

    /// `-S --needed <packages>`: install what is missing.
    pub fn install_needed(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.cmd()
            .args(["-S", "--needed"])
            .args(packages.iter().map(String::as_str))
            .error_msg("package installation failed")
            .run()?;
        Ok(())
    }

    /// `-T <dep>`: whether the installed set already satisfies a
    /// dependency (virtual packages included).
    pub fn deps_satisfied(&self, dep: &str) -> Result<bool> {
        let status = self.cmd().arg("-T").arg(dep).allow_fail().quiet().run()?;
        Ok(status.success())
    }

    /// `-Syw <packages>`: refresh and download without installing, so a
    /// strict config re-verifies every package against the new keyring.
    pub fn download_only(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.cmd()
            .arg("-Syw")
            .args(packages.iter().map(String::as_str))
            .error_msg("signature-checked package download failed")
            .run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildContextBuilder;
    use tempfile::TempDir;

    const SAMPLE_CONF: &str = "\
# a comment
[options]
HoldPkg = pacman glibc

[core]
Include = /etc/pacman.d/mirrorlist

[extra]
Include = /etc/pacman.d/mirrorlist

[community]
Include = /etc/pacman.d/mirrorlist
";

    #[test]
    fn test_repos_from_conf_preserves_order() {
        assert_eq!(
            repos_from_conf(SAMPLE_CONF),
            vec!["core".to_string(), "extra".to_string(), "community".to_string()]
        );
    }

    #[test]
    fn test_repos_from_conf_drops_options() {
        assert!(!repos_from_conf(SAMPLE_CONF).contains(&"options".to_string()));
    }

    #[test]
    fn test_render_body_binds_chroot_paths() {
        let temp = TempDir::new().unwrap();
        let mut b = BuildContextBuilder {
            workdir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        b.arch_host = Some("x86_64".to_string());
        let ctx = b.freeze().unwrap();
        let layout = ctx.layout();
        let chroot = ctx.chroot();

        let body = render_body(&ctx, &layout, &chroot, &["core".to_string()]).unwrap();
        assert!(body.contains(&format!("RootDir = {}", chroot.display())));
        assert!(body.contains("Architecture = x86_64"));
        assert!(body.contains("[core]"));
        assert!(body.contains("Server = https://geo.mirror.pkgbuild.com/$repo/os/$arch"));
        // The SigLevel line is the caller's to append.
        assert!(!body.contains("SigLevel"));
    }

    #[test]
    fn test_configs_differ_only_in_siglevel() {
        let temp = TempDir::new().unwrap();
        let mut b = BuildContextBuilder {
            workdir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        b.arch_host = Some("x86_64".to_string());
        b.repos_base = vec!["core".to_string(), "extra".to_string()];
        let ctx = b.freeze().unwrap();
        let layout = ctx.layout();
        layout.ensure_build_dir(&ctx.build_id).unwrap();

        let configs = PacmanConfigs::generate(&ctx, &layout).unwrap();
        let loose = std::fs::read_to_string(&configs.loose).unwrap();
        let strict = std::fs::read_to_string(&configs.strict).unwrap();

        assert!(loose.contains("SigLevel = Never"));
        assert!(strict.contains("SigLevel = Required DatabaseRequired"));
        assert_eq!(
            loose.replace("SigLevel = Never", ""),
            strict.replace("SigLevel = Required DatabaseRequired", "")
        );
    }

    #[test]
    fn test_generate_is_idempotent_within_run() {
        cache::capture_start_time();
        let temp = TempDir::new().unwrap();
        let mut b = BuildContextBuilder {
            workdir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        b.arch_host = Some("x86_64".to_string());
        b.repos_base = vec!["core".to_string()];
        let ctx = b.freeze().unwrap();
        let layout = ctx.layout();
        layout.ensure_build_dir(&ctx.build_id).unwrap();

        let first = PacmanConfigs::generate(&ctx, &layout).unwrap();
        let mtime = std::fs::metadata(&first.loose).unwrap().modified().unwrap();
        let second = PacmanConfigs::generate(&ctx, &layout).unwrap();
        assert_eq!(
            std::fs::metadata(&second.loose).unwrap().modified().unwrap(),
            mtime
        );
    }
}

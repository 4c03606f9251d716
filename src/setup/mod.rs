//! Target setup stage.
//!
//! Runs inside the child after bootstrap: pins the initrd maker to a
//! single universal image, installs kernels, microcode, bootloader and
//! user packages through the strict config, then writes out fstab,
//! bootloader, hostname, locale and overlay state.

pub mod bootloader;

pub use bootloader::BootArtifacts;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::context::{Bootloader, BuildContext, InitrdMaker};
use crate::pacman::{render_extra_repo_sections, Pacman};
use crate::process::Cmd;

/// Shared mkinitcpio preset template, instantiated per kernel.
const MKINITCPIO_HOOK_PRESET: &str = "usr/share/mkinitcpio/hook.preset";
const BOOSTER_CONFIG: &str = "etc/booster.yaml";

/// Run the whole setup stage; returns the bootloader staging artifacts.
pub fn run(
    ctx: &BuildContext,
    chroot: &Path,
    build_dir: &Path,
    strict: &Pacman,
) -> Result<BootArtifacts> {
    let saved_hook = pin_initrd_maker(ctx, chroot, strict)?;

    install_packages(ctx, strict)?;

    if let Some(template) = saved_hook {
        restore_mkinitcpio_presets(ctx, chroot, &template)?;
    }

    append_extra_repos(ctx, chroot)?;

    if let Some(table) = &ctx.table {
        let fstab = chroot.join("etc/fstab");
        fs::write(&fstab, table.render_fstab())
            .with_context(|| format!("failed to write {}", fstab.display()))?;
        debug!("fstab written for {} partitions", table.partitions.len());
    }

    let boot = bootloader::install(ctx, chroot, build_dir)?;

    write_hostname(ctx, chroot)?;
    configure_locales(ctx, chroot)?;
    apply_overlays(ctx, chroot)?;

    Ok(boot)
}

/// Install the initrd maker ahead of other packages when nothing provides
/// the virtual `initramfs` yet, and force a single universal image.
///
/// Returns the saved mkinitcpio hook template when one was patched, so
/// the per-kernel presets can be re-rendered after package installation.
fn pin_initrd_maker(
    ctx: &BuildContext,
    chroot: &Path,
    strict: &Pacman,
) -> Result<Option<String>> {
    let Some(maker) = ctx.initrd_maker else {
        return Ok(None);
    };

    if !strict.deps_satisfied("initramfs")? {
        info!("installing initrd maker {}", maker.package());
        strict.install_needed(&[maker.package().to_string()])?;
    }

    match maker {
        InitrdMaker::Booster => {
            let config = chroot.join(BOOSTER_CONFIG);
            if config.exists() {
                let original = fs::read(&config)
                    .with_context(|| format!("failed to read {}", config.display()))?;
                fs::write(config.with_extension("yaml.pacsave"), original)?;
            }
            fs::write(&config, "universal: true\n")
                .with_context(|| format!("failed to write {}", config.display()))?;
            Ok(None)
        }
        InitrdMaker::Mkinitcpio => {
            let hook = chroot.join(MKINITCPIO_HOOK_PRESET);
            let template = fs::read_to_string(&hook)
                .with_context(|| format!("failed to read {}", hook.display()))?;
            let pinned = set_presets_line(&template);
            fs::write(&hook, pinned)
                .with_context(|| format!("failed to write {}", hook.display()))?;
            Ok(Some(template))
        }
        InitrdMaker::Dracut => bail!("dracut support is not implemented yet"),
    }
}

/// Rewrite the `PRESETS=` assignment to build only the fallback image.
fn set_presets_line(template: &str) -> String {
    template
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("PRESETS=") {
                "PRESETS=('fallback')"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

fn install_packages(ctx: &BuildContext, strict: &Pacman) -> Result<()> {
    let mut packages: Vec<String> = ctx.kernels.clone();
    packages.extend(ctx.microcodes.iter().cloned());
    for bootloader in &ctx.bootloaders {
        if let Bootloader::Syslinux = bootloader {
            packages.push("syslinux".to_string());
        }
    }
    packages.extend(ctx.packages.iter().cloned());
    if packages.is_empty() {
        return Ok(());
    }
    info!("installing [{}]", packages.join(", "));
    strict.install_needed(&packages)
}

/// Restore the patched hook template and re-render each kernel's preset
/// from it.
fn restore_mkinitcpio_presets(
    ctx: &BuildContext,
    chroot: &Path,
    template: &str,
) -> Result<()> {
    let hook = chroot.join(MKINITCPIO_HOOK_PRESET);
    fs::write(&hook, template)
        .with_context(|| format!("failed to restore {}", hook.display()))?;

    let preset_dir = chroot.join("etc/mkinitcpio.d");
    fs::create_dir_all(&preset_dir)
        .with_context(|| format!("failed to create {}", preset_dir.display()))?;
    for kernel in &ctx.kernels {
        let rendered = template.replace("%PKGBASE%", kernel);
        let path = preset_dir.join(format!("{}.preset", kernel));
        fs::write(&path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn append_extra_repos(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    if ctx.extra_repos.is_empty() {
        return Ok(());
    }
    let sections = render_extra_repo_sections(ctx)?;
    let conf = chroot.join("etc/pacman.conf");
    let mut content = fs::read_to_string(&conf)
        .with_context(|| format!("failed to read {}", conf.display()))?;
    content.push_str(&sections);
    fs::write(&conf, content)
        .with_context(|| format!("failed to write {}", conf.display()))?;
    Ok(())
}

/// First non-empty sanitized candidate of hostname, board, distro.
fn write_hostname(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    let board = match ctx.board.as_str() {
        "none" => None,
        other => Some(other),
    };
    let hostname = [
        ctx.hostname.as_deref(),
        board,
        Some(ctx.distro.safe.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(sanitize_hostname)
    .find(|h| !h.is_empty())
    .unwrap_or_else(|| "aimager".to_string());

    let path = chroot.join("etc/hostname");
    fs::write(&path, format!("{}\n", hostname))
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("hostname set to {}", hostname);
    Ok(())
}

fn sanitize_hostname(candidate: &str) -> String {
    candidate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_lowercase()
}

/// Uncomment each enabled locale, generate them and set the default LANG.
fn configure_locales(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    if ctx.locales.is_empty() {
        return Ok(());
    }

    let locale_gen = chroot.join("etc/locale.gen");
    let content = fs::read_to_string(&locale_gen)
        .with_context(|| format!("failed to read {}", locale_gen.display()))?;
    let uncommented = uncomment_locales(&content, &ctx.locales);
    fs::write(&locale_gen, uncommented)
        .with_context(|| format!("failed to write {}", locale_gen.display()))?;

    Cmd::new("chroot")
        .arg_path(chroot)
        .arg("locale-gen")
        .error_msg("locale-gen failed in the target chroot")
        .run()?;

    let lang = ctx.locales[0]
        .split_whitespace()
        .next()
        .unwrap_or(&ctx.locales[0]);
    fs::write(chroot.join("etc/locale.conf"), format!("LANG={}\n", lang))?;
    Ok(())
}

fn uncomment_locales(content: &str, locales: &[String]) -> String {
    content
        .lines()
        .map(|line| {
            if let Some(commented) = line.strip_prefix('#') {
                let enabled = locales
                    .iter()
                    .any(|locale| commented.trim_start().starts_with(locale.as_str()));
                if enabled {
                    return commented.to_string();
                }
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// Extract caller-supplied overlay archives over the root, in order.
fn apply_overlays(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    for overlay in &ctx.overlays {
        info!("applying overlay {}", overlay.display());
        Cmd::new("bsdtar")
            .args(["-x", "-p", "-f"])
            .arg_path(overlay)
            .arg("-C")
            .arg_path(chroot)
            .error_msg("failed to extract an overlay archive")
            .run()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("My Box_01!"), "mybox01");
        assert_eq!(sanitize_hostname("aarch64_uefi"), "aarch64uefi");
        assert_eq!(sanitize_hostname("___"), "");
    }

    #[test]
    fn test_set_presets_line() {
        let template = "# preset file\nALL_kver=\"/boot/vmlinuz-%PKGBASE%\"\n\
                        PRESETS=('default' 'fallback')\n";
        let pinned = set_presets_line(template);
        assert!(pinned.contains("PRESETS=('fallback')\n"));
        assert!(!pinned.contains("'default'"));
        assert!(pinned.contains("ALL_kver"));
    }

    #[test]
    fn test_uncomment_locales() {
        let gen = "#en_US.UTF-8 UTF-8\n#de_DE.UTF-8 UTF-8\n#ja_JP.UTF-8 UTF-8\n";
        let out = uncomment_locales(gen, &["en_US.UTF-8".to_string(), "ja_JP.UTF-8".to_string()]);
        assert!(out.contains("\nja_JP.UTF-8 UTF-8"));
        assert!(out.starts_with("en_US.UTF-8 UTF-8\n"));
        assert!(out.contains("#de_DE.UTF-8 UTF-8"));
    }
}

//! Bootloader configuration.
//!
//! systemd-boot lays its files directly into the chroot's `/boot` (the
//! boot-partition emitter packs them up later). syslinux instead produces
//! two staging artifacts in the build scratch: a 440-byte MBR bootstrap
//! and a pre-installed FAT seed image, both keyed by bootloader so a
//! stale file from another stage can never leak into the disk assembly.
//! u-boot boards get only an extlinux configuration.

use anyhow::{bail, Context, Result};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::context::{efi_suffix, Bootloader, BuildContext, InitrdMaker};
use crate::emit::fat;
use crate::process::Cmd;
use crate::table::{PartRole, Partition, TableLabel};

/// Size of the boot code area ahead of a DOS partition table.
const MBR_BOOTSTRAP_LEN: usize = 440;

/// Staging files the bootloader stage hands to the emitter.
#[derive(Debug, Default)]
pub struct BootArtifacts {
    /// FAT image already carrying an installed bootloader, reused as the
    /// seed for `part-boot.img`.
    pub boot_seed: Option<PathBuf>,
    /// Initial bytes stamped at offset 0 of `disk.img`.
    pub disk_head: Option<PathBuf>,
}

/// Configure every selected bootloader.
pub fn install(ctx: &BuildContext, chroot: &Path, build_dir: &Path) -> Result<BootArtifacts> {
    let mut artifacts = BootArtifacts::default();
    for bootloader in &ctx.bootloaders {
        match bootloader {
            Bootloader::SystemdBoot => systemd_boot(ctx, chroot)?,
            Bootloader::Syslinux => syslinux(ctx, chroot, build_dir, &mut artifacts)?,
            Bootloader::UBoot => u_boot(ctx, chroot)?,
        }
    }
    Ok(artifacts)
}

fn root_partition<'t>(ctx: &'t BuildContext) -> Result<&'t Partition> {
    ctx.table
        .as_ref()
        .and_then(|t| t.part(PartRole::Root))
        .context("bootloader configuration needs a table with a root partition")
}

/// The kernel-specific initrd image name the pinned initrd maker emits.
fn initrd_image(ctx: &BuildContext, kernel: &str) -> String {
    match ctx.initrd_maker {
        Some(InitrdMaker::Booster) => format!("booster-{}.img", kernel),
        Some(InitrdMaker::Mkinitcpio) => format!("initramfs-{}-fallback.img", kernel),
        _ => format!("initramfs-{}.img", kernel),
    }
}

fn wants_fdt(arch: &str) -> bool {
    matches!(arch, "aarch64" | "armv7h" | "riscv64")
}

fn kernel_options(ctx: &BuildContext, kernel: &str, root_uuid: &str) -> String {
    let append = ctx
        .append_for(kernel)
        .map(|a| format!(" {}", a.trim()))
        .unwrap_or_default();
    format!("root=UUID={} rw{}", root_uuid, append)
}

/// systemd-boot: removable-media EFI stub, loader configuration and one
/// type-1 entry per kernel.
fn systemd_boot(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    let root = root_partition(ctx)?;
    let suffix = efi_suffix(&ctx.arch_target).with_context(|| {
        format!("systemd-boot has no EFI stub for {}", ctx.arch_target)
    })?;

    let stub = chroot.join(format!(
        "usr/lib/systemd/boot/efi/systemd-boot{}.efi",
        suffix.to_lowercase()
    ));
    let boot = chroot.join("boot");
    let efi_dir = boot.join("EFI/BOOT");
    fs::create_dir_all(&efi_dir)
        .with_context(|| format!("failed to create {}", efi_dir.display()))?;
    let target = efi_dir.join(format!("BOOT{}.EFI", suffix));
    fs::copy(&stub, &target).with_context(|| {
        format!("failed to copy {} to {}", stub.display(), target.display())
    })?;

    let loader = boot.join("loader");
    fs::create_dir_all(loader.join("entries"))
        .with_context(|| format!("failed to create {}", loader.display()))?;
    fs::write(loader.join("entries.srel"), "type1")?;

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    fs::write(loader.join("random-seed"), seed)?;

    let default = ctx
        .kernels
        .first()
        .context("systemd-boot needs at least one kernel")?;
    fs::write(
        loader.join("loader.conf"),
        format!("default {}.conf\ntimeout 3\n", default),
    )?;

    for kernel in &ctx.kernels {
        let mut entry = format!("title {} ({})\n", ctx.distro.name, kernel);
        entry.push_str(&format!("linux /vmlinuz-{}\n", kernel));
        for microcode in &ctx.microcodes {
            entry.push_str(&format!("initrd /{}.img\n", microcode));
        }
        entry.push_str(&format!("initrd /{}\n", initrd_image(ctx, kernel)));
        if wants_fdt(&ctx.arch_target) {
            entry.push_str(&format!("fdtdir /dtbs/{}\n", kernel));
        }
        entry.push_str(&format!(
            "options {}\n",
            kernel_options(ctx, kernel, &root.uuid)
        ));
        fs::write(loader.join(format!("entries/{}.conf", kernel)), entry)?;
    }

    info!("systemd-boot configured under {}", boot.display());
    Ok(())
}

/// syslinux: MBR bootstrap for the disk head plus a FAT seed image with
/// the installer already run into it.
fn syslinux(
    ctx: &BuildContext,
    chroot: &Path,
    build_dir: &Path,
    artifacts: &mut BootArtifacts,
) -> Result<()> {
    let table = ctx
        .table
        .as_ref()
        .context("syslinux needs a partition table")?;
    if table.label != TableLabel::Dos {
        bail!("syslinux requires a dos partition table");
    }
    let boot = table
        .part(PartRole::Boot)
        .context("syslinux requires a dedicated boot partition")?;
    let root = root_partition(ctx)?;

    // Disk head: the first 440 bytes of the BIOS mbr.bin.
    let mbr = chroot.join("usr/lib/syslinux/bios/mbr.bin");
    let bytes = fs::read(&mbr).with_context(|| format!("failed to read {}", mbr.display()))?;
    if bytes.len() < MBR_BOOTSTRAP_LEN {
        bail!("{} is shorter than {} bytes", mbr.display(), MBR_BOOTSTRAP_LEN);
    }
    let head = build_dir.join("head.syslinux.img");
    fs::write(&head, &bytes[..MBR_BOOTSTRAP_LEN])
        .with_context(|| format!("failed to write {}", head.display()))?;

    // Empty FAT image pre-populated with the com32 modules.
    let seed = build_dir.join("boot.syslinux.img");
    fat::create_image(
        &seed,
        boot.size_mib,
        &boot.fat_volume_id(),
        ctx.mkfs_args.get("boot").map(Vec::as_slice).unwrap_or(&[]),
    )?;
    fat::mmd(&seed, "syslinux")?;
    let modules_dir = chroot.join("usr/lib/syslinux/bios");
    let modules: Vec<PathBuf> = fs::read_dir(&modules_dir)
        .with_context(|| format!("failed to read {}", modules_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("c32"))
        .collect();
    fat::mcopy(&seed, &modules, "syslinux/")?;

    // The installer only reaches the image through the chroot.
    let staged = chroot.join("tmp/syslinux-boot.img");
    fs::rename(&seed, &staged)
        .with_context(|| format!("failed to stage {}", staged.display()))?;
    Cmd::new("chroot")
        .arg_path(chroot)
        .args(["syslinux", "--install", "/tmp/syslinux-boot.img", "--directory", "syslinux"])
        .error_msg("the syslinux installer failed in the target chroot")
        .run()?;
    fs::rename(&staged, &seed)
        .with_context(|| format!("failed to unstage {}", seed.display()))?;

    fat::mcopy_text(&seed, "syslinux/syslinux.cfg", &extlinux_config(ctx, &root.uuid))?;

    artifacts.disk_head = Some(head);
    artifacts.boot_seed = Some(seed);
    info!("syslinux staged for disk assembly");
    Ok(())
}

/// u-boot boards boot through an extlinux configuration alone; deploying
/// the loader binary itself is the board vendor's business.
fn u_boot(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    let root = root_partition(ctx)?;
    let dir = chroot.join("boot/extlinux");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    fs::write(dir.join("extlinux.conf"), extlinux_config(ctx, &root.uuid))?;
    info!("extlinux configuration written");
    Ok(())
}

/// Shared extlinux/syslinux configuration, one label per kernel.
fn extlinux_config(ctx: &BuildContext, root_uuid: &str) -> String {
    let default = ctx.kernels.first().map(String::as_str).unwrap_or("linux");
    let mut conf = format!("DEFAULT {}\nPROMPT 1\nTIMEOUT 30\n", default);
    for kernel in &ctx.kernels {
        conf.push_str(&format!("\nLABEL {}\n", kernel));
        conf.push_str(&format!("\tLINUX /vmlinuz-{}\n", kernel));
        let mut initrds: Vec<String> = ctx
            .microcodes
            .iter()
            .map(|m| format!("/{}.img", m))
            .collect();
        initrds.push(format!("/{}", initrd_image(ctx, kernel)));
        conf.push_str(&format!("\tINITRD {}\n", initrds.join(",")));
        conf.push_str(&format!(
            "\tAPPEND {}\n",
            kernel_options(ctx, kernel, root_uuid)
        ));
        if wants_fdt(&ctx.arch_target) {
            conf.push_str(&format!("\tFDTDIR /dtbs/{}\n", kernel));
        }
    }
    conf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildContextBuilder;
    use std::collections::BTreeSet;

    fn uefi_ctx() -> BuildContext {
        let mut b = BuildContextBuilder {
            workdir: Some(PathBuf::from("/work")),
            ..Default::default()
        };
        b.arch_host = Some("x86_64".to_string());
        b.apply_board("x86_64_uefi").unwrap();
        b.freeze().unwrap()
    }

    #[test]
    fn test_extlinux_config_layout() {
        let mut ctx = uefi_ctx();
        ctx.microcodes = BTreeSet::from(["intel-ucode".to_string()]);
        ctx.initrd_maker = Some(InitrdMaker::Booster);
        let conf = extlinux_config(&ctx, "1234-uuid");

        assert!(conf.starts_with("DEFAULT linux\n"));
        assert!(conf.contains("\tLINUX /vmlinuz-linux\n"));
        assert!(conf.contains("\tINITRD /intel-ucode.img,/booster-linux.img\n"));
        assert!(conf.contains("\tAPPEND root=UUID=1234-uuid rw\n"));
        // x86_64 has no device tree.
        assert!(!conf.contains("FDTDIR"));
    }

    #[test]
    fn test_kernel_options_with_append() {
        let mut ctx = uefi_ctx();
        ctx.appends.insert("all".to_string(), "console=ttyS0".to_string());
        assert_eq!(
            kernel_options(&ctx, "linux", "abcd"),
            "root=UUID=abcd rw console=ttyS0"
        );
    }

    #[test]
    fn test_initrd_image_names() {
        let mut ctx = uefi_ctx();
        ctx.initrd_maker = Some(InitrdMaker::Booster);
        assert_eq!(initrd_image(&ctx, "linux"), "booster-linux.img");
        ctx.initrd_maker = Some(InitrdMaker::Mkinitcpio);
        assert_eq!(initrd_image(&ctx, "linux"), "initramfs-linux-fallback.img");
        ctx.initrd_maker = None;
        assert_eq!(initrd_image(&ctx, "linux"), "initramfs-linux.img");
    }

    #[test]
    fn test_systemd_boot_refuses_without_table() {
        let mut ctx = uefi_ctx();
        ctx.table = None;
        assert!(root_partition(&ctx).is_err());
    }
}

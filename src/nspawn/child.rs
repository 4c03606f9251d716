//! Child-side runner.
//!
//! Runs inside the new user/pid/mount namespaces. Waits for the id
//! mapping, builds the chroot mount tree, then drives bootstrap, setup
//! and artifact emission. Every mount made here is private to the child's
//! mount namespace and vanishes with the process, so signal handling is
//! exit-only.

use anyhow::{bail, Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Uid;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::cache;
use crate::context::BuildContext;
use crate::emit::Emitter;
use crate::keyring;
use crate::pacman::{Pacman, PacmanConfigs};
use crate::setup;

/// Seconds the child waits for its uid/gid mapping.
const MAP_WAIT_SECS: u32 = 10;

/// Device nodes bound from the host into the chroot's tmpfs `/dev`.
const DEVICE_NODES: &[&str] = &["full", "null", "random", "tty", "urandom", "zero"];

/// Entry point for the hidden `child` subcommand.
pub fn run(context_file: &Path) -> Result<()> {
    let json = fs::read_to_string(context_file)
        .with_context(|| format!("failed to read {}", context_file.display()))?;
    let ctx: BuildContext =
        serde_json::from_str(&json).context("failed to parse the build context")?;
    cache::set_start_time_unix(ctx.start_time_unix);

    wait_for_mapping()?;
    install_child_handlers();

    let chroot = ctx.chroot();
    let build_dir = ctx.build_dir();
    build_root(&ctx, &chroot)?;

    let layout = ctx.layout();
    let configs = PacmanConfigs::locate(&build_dir)?;
    let program = super::pacman_program(&build_dir);
    let loose = Pacman::new(program.clone(), configs.loose.clone());
    let strict = Pacman::new(program, configs.strict.clone());

    keyring::bootstrap(&ctx, &layout, &chroot, &loose, &strict)?;
    if ctx.only_backup_keyring {
        info!("keyring backed up, stopping as requested");
        teardown(&ctx, &chroot)?;
        return Ok(());
    }

    let boot = setup::run(&ctx, &chroot, &build_dir, &strict)?;
    Emitter::new(&ctx, &chroot, boot).emit_all()?;

    teardown(&ctx, &chroot)?;
    Ok(())
}

/// Wait until the parent's id mapping lands, then verify rootlessness.
///
/// Once mapped, the child's uid reads as 0 but writing under the host's
/// `/sys` must still fail; a successful write means the process is real
/// root and the build must abort.
fn wait_for_mapping() -> Result<()> {
    let canary = Path::new("/sys/sys_write_test");
    for _ in 0..MAP_WAIT_SECS {
        if Uid::effective().is_root() {
            return match fs::write(canary, b"") {
                Ok(()) => {
                    let _ = fs::remove_file(canary);
                    bail!("{} is writable: running as real root, refusing", canary.display());
                }
                Err(_) => Ok(()),
            };
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    bail!(
        "timed out after {}s waiting for the uid/gid mapping",
        MAP_WAIT_SECS
    )
}

extern "C" fn exit_handler(_signal: i32) {
    // Mounts are private to this namespace; nothing to roll back.
    std::process::exit(1);
}

fn install_child_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(exit_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }
}

/// Bind-mount `src` onto `dst`.
pub(crate) fn bind_mount(src: &Path, dst: &Path) -> Result<()> {
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("failed to bind {} onto {}", src.display(), dst.display()))
}

pub(crate) fn mount_tmpfs(target: &Path, options: Option<&str>) -> Result<()> {
    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        options,
    )
    .with_context(|| format!("failed to mount tmpfs at {}", target.display()))
}

pub(crate) fn detach(target: &Path) -> Result<()> {
    umount2(target, MntFlags::MNT_DETACH)
        .with_context(|| format!("failed to detach {}", target.display()))
}

fn chmod(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod {:o} {}", mode, path.display()))
}

/// Construct the chroot mount tree.
fn build_root(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    fs::create_dir_all(chroot)
        .with_context(|| format!("failed to create {}", chroot.display()))?;

    match ctx.tmpfs_root_options.as_deref() {
        Some("") => mount_tmpfs(chroot, None)?,
        Some(options) => mount_tmpfs(chroot, Some(options))?,
        // Bind the chroot onto itself so subtree mounts are visible.
        None => bind_mount(chroot, chroot)?,
    }

    let dirs = [
        "boot",
        "dev",
        "etc/pacman.d",
        "proc",
        "run",
        "sys",
        "tmp",
        "var/cache/pacman/pkg",
        "var/lib/pacman",
        "var/log",
    ];
    for dir in dirs {
        let path = chroot.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }
    chmod(&chroot.join("tmp"), 0o1777)?;
    chmod(&chroot.join("proc"), 0o555)?;

    let dev = chroot.join("dev");
    mount_tmpfs(&dev, Some("mode=0755"))?;
    for sub in ["shm", "pts"] {
        fs::create_dir_all(dev.join(sub))?;
    }
    chmod(&dev.join("shm"), 0o1777)?;

    for node in DEVICE_NODES {
        let target = dev.join(node);
        fs::write(&target, b"")
            .with_context(|| format!("failed to create {}", target.display()))?;
        bind_mount(&Path::new("/dev").join(node), &target)?;
    }

    symlink("/proc/self/fd/2", dev.join("stderr"))?;
    symlink("/proc/self/fd/1", dev.join("stdout"))?;
    symlink("/proc/self/fd/0", dev.join("stdin"))?;
    symlink("/proc/kcore", dev.join("core"))?;
    symlink("/proc/self/fd", dev.join("fd"))?;
    symlink("pts/ptmx", dev.join("ptmx"))?;
    symlink(console_path(), dev.join("console"))?;

    mount(
        Some("proc"),
        &chroot.join("proc"),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("failed to mount proc")?;

    mount(
        Some("devpts"),
        &dev.join("pts"),
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("mode=0620,ptmxmode=0666"),
    )
    .context("failed to mount devpts")?;

    let sys = chroot.join("sys");
    mount_tmpfs(&sys, Some("mode=0755"))?;
    fs::create_dir_all(sys.join("module"))?;
    chmod(&sys, 0o555)?;

    debug!("chroot mount tree ready at {}", chroot.display());
    Ok(())
}

/// The controlling terminal, for the `/dev/console` symlink.
fn console_path() -> PathBuf {
    for fd in ["/proc/self/fd/0", "/proc/self/fd/1", "/proc/self/fd/2"] {
        if let Ok(target) = fs::read_link(fd) {
            if target.starts_with("/dev") {
                return target;
            }
        }
    }
    PathBuf::from("/dev/console")
}

/// Detach the chroot mount tree and empty the scratch root.
///
/// With a tmpfs root the contents vanish on detach; otherwise the files
/// (owned by mapped ids only this namespace can delete) are removed here
/// so the parent can drop the remaining caller-owned scratch.
fn teardown(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    detach(chroot)?;
    if ctx.tmpfs_root_options.is_none() && chroot.exists() {
        fs::remove_dir_all(chroot)
            .with_context(|| format!("failed to clear {}", chroot.display()))?;
    }
    Ok(())
}

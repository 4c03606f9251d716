//! Namespace orchestration.
//!
//! The parent prepares everything that needs the network or the host
//! package manager, then re-invokes its own binary as the *child* inside
//! new user, pid and mount namespaces. Two id mappings are applied in
//! each of uid and gid space: inner 0 maps to the caller and inner
//! 1..65536 to the caller's subordinate range.
//!
//! Mapping happens in one of two modes, selected by probing the external
//! `unshare` helper's help output for its `--map-users` argv shape:
//! *sync* lets the helper map ids itself, *async* backgrounds the helper
//! and runs `newuidmap`/`newgidmap` against its pid while the child sits
//! in its map-wait loop.

pub mod child;
pub mod subid;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{write_atomic, CacheLayout};
use crate::cache::repo::ensure_pacman_static;
use crate::context::BuildContext;
use crate::pacman::PacmanConfigs;
use crate::preflight;
use crate::process::{self, Cmd};
use subid::{Identity, SUBID_MIN};

/// Argument order of the unshare helper's `--map-users`/`--map-groups`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSyntax {
    /// `inner:outer:count`
    InnerOuterCount,
    /// `outer,inner,count`
    OuterInnerCount,
}

/// Inspect the helper's help text for the mapping option and its shape.
pub fn probe_unshare() -> Result<Option<MapSyntax>> {
    let help = Cmd::new("unshare")
        .arg("--help")
        .allow_fail()
        .read()
        .context("failed to run 'unshare --help'")?;
    Ok(parse_map_syntax(&help))
}

fn parse_map_syntax(help: &str) -> Option<MapSyntax> {
    let pos = help.find("--map-users=")?;
    let shape: String = help[pos + "--map-users=".len()..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect();
    if shape.contains(',') {
        Some(MapSyntax::OuterInnerCount)
    } else {
        Some(MapSyntax::InnerOuterCount)
    }
}

fn format_mapping(syntax: MapSyntax, inner: u32, outer: u32, count: u32) -> String {
    match syntax {
        MapSyntax::InnerOuterCount => format!("{}:{}:{}", inner, outer, count),
        MapSyntax::OuterInnerCount => format!("{},{},{}", outer, inner, count),
    }
}

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn kill_child_handler(_signal: i32) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
    std::process::exit(1);
}

fn install_parent_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(kill_child_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }
}

/// Run the parent half of a build: prepare, spawn the child, wait, clean.
pub fn run_parent(ctx: &BuildContext) -> Result<()> {
    let identity = subid::resolve()?;
    debug!(
        "running as {} (uid {}, subuid {}, subgid {})",
        identity.name, identity.uid, identity.subuid, identity.subgid
    );
    preflight::check_parent_tools(ctx)?;
    if ctx.cross {
        preflight::check_binfmt(&ctx.arch_host, &ctx.arch_target)?;
    }

    let layout = ctx.layout();
    layout.ensure()?;
    let build_dir = layout.ensure_build_dir(&ctx.build_id)?;

    prepare_pacman_binary(ctx, &layout, &build_dir)?;
    PacmanConfigs::generate(ctx, &layout)?;

    let context_file = build_dir.join("bin/context.json");
    let json = serde_json::to_vec_pretty(ctx).context("failed to serialize build context")?;
    write_atomic(&context_file, &json)?;

    if ctx.only_prepare_child {
        info!("child prepared under {}", build_dir.display());
        return Ok(());
    }

    let status = spawn_child(ctx, &identity, &context_file)?;
    if !status.success() {
        bail!("child build failed with {}", status);
    }

    // The child already emptied the chroot; the remaining scratch files
    // are owned by the caller.
    fs::remove_dir_all(&build_dir)
        .with_context(|| format!("failed to remove build scratch {}", build_dir.display()))?;
    info!("build {} complete", ctx.build_id);
    Ok(())
}

/// Place the static pacman into the build scratch when the host needs it.
///
/// The child probes `<scratch>/bin/pacman-static` and falls back to the
/// host `pacman` when absent.
fn prepare_pacman_binary(
    ctx: &BuildContext,
    layout: &CacheLayout,
    build_dir: &Path,
) -> Result<()> {
    if !ctx.use_pacman_static && process::exists("pacman") {
        return Ok(());
    }
    let extracted = ensure_pacman_static(layout, &ctx.arch_host, ctx.freeze_pacman_static)?;
    let dest = build_dir.join("bin/pacman-static");
    if dest.exists() {
        fs::remove_file(&dest)
            .with_context(|| format!("failed to remove {}", dest.display()))?;
    }
    if fs::hard_link(&extracted, &dest).is_err() {
        fs::copy(&extracted, &dest).with_context(|| {
            format!("failed to copy {} to {}", extracted.display(), dest.display())
        })?;
    }
    let mut perms = fs::metadata(&dest)?.permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
    fs::set_permissions(&dest, perms)?;
    Ok(())
}

/// Fork the child under new namespaces and wait for it.
fn spawn_child(ctx: &BuildContext, identity: &Identity, context_file: &Path) -> Result<ExitStatus> {
    let exe = std::env::current_exe().context("failed to resolve own executable")?;
    let syntax = probe_unshare()?;

    match syntax {
        Some(syntax) if !ctx.async_child => {
            spawn_sync(&exe, identity, context_file, syntax)
        }
        _ => spawn_async(&exe, identity, context_file),
    }
}

/// Sync mode: the helper applies both mappings itself.
fn spawn_sync(
    exe: &Path,
    identity: &Identity,
    context_file: &Path,
    syntax: MapSyntax,
) -> Result<ExitStatus> {
    let mut cmd = Command::new("unshare");
    cmd.args(["--user", "--pid", "--mount", "--fork", "--kill-child"]);
    for (inner, outer, count) in id_mappings(identity.uid, identity.subuid.start) {
        cmd.arg(format!(
            "--map-users={}",
            format_mapping(syntax, inner, outer, count)
        ));
    }
    for (inner, outer, count) in id_mappings(identity.gid, identity.subgid.start) {
        cmd.arg(format!(
            "--map-groups={}",
            format_mapping(syntax, inner, outer, count)
        ));
    }
    cmd.arg("--")
        .arg(exe)
        .arg("child")
        .arg("--context")
        .arg(context_file);

    info!("spawning child (sync id mapping)");
    install_parent_handlers();
    let mut child = cmd.spawn().context("failed to spawn unshare")?;
    CHILD_PID.store(child.id() as i32, Ordering::SeqCst);
    let status = child.wait().context("failed to wait for child")?;
    CHILD_PID.store(0, Ordering::SeqCst);
    Ok(status)
}

/// Async mode: background the helper, map the ids from outside, wait.
fn spawn_async(exe: &Path, identity: &Identity, context_file: &Path) -> Result<ExitStatus> {
    let mut cmd = Command::new("unshare");
    cmd.args(["--user", "--pid", "--mount", "--fork"]);
    cmd.arg("--")
        .arg(exe)
        .arg("child")
        .arg("--context")
        .arg(context_file);

    info!("spawning child (async id mapping)");
    install_parent_handlers();
    let mut child = cmd.spawn().context("failed to spawn unshare")?;
    CHILD_PID.store(child.id() as i32, Ordering::SeqCst);

    // No direct signal that the child reached its map-wait loop; its
    // 10-second poll window absorbs this delay.
    std::thread::sleep(Duration::from_secs(1));

    let pid = child.id().to_string();
    let map_result = run_idmap_helpers(&pid, identity);
    if let Err(e) = map_result {
        let _ = signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
        let _ = child.wait();
        CHILD_PID.store(0, Ordering::SeqCst);
        return Err(e);
    }

    let status = child.wait().context("failed to wait for child")?;
    CHILD_PID.store(0, Ordering::SeqCst);
    Ok(status)
}

fn run_idmap_helpers(pid: &str, identity: &Identity) -> Result<()> {
    let mut uid_cmd = Cmd::new("newuidmap").arg(pid);
    for (inner, outer, count) in id_mappings(identity.uid, identity.subuid.start) {
        uid_cmd = uid_cmd.args([inner.to_string(), outer.to_string(), count.to_string()]);
    }
    uid_cmd.error_msg("newuidmap failed to map the child").run()?;

    let mut gid_cmd = Cmd::new("newgidmap").arg(pid);
    for (inner, outer, count) in id_mappings(identity.gid, identity.subgid.start) {
        gid_cmd = gid_cmd.args([inner.to_string(), outer.to_string(), count.to_string()]);
    }
    gid_cmd.error_msg("newgidmap failed to map the child").run()?;
    Ok(())
}

/// The two mappings every child needs: inner 0 to the caller, inner
/// 1..65536 to the subordinate range.
fn id_mappings(caller: u32, sub_start: u32) -> [(u32, u32, u32); 2] {
    [(0, caller, 1), (1, sub_start, SUBID_MIN)]
}

/// The child-side pacman binary for a build scratch directory.
pub fn pacman_program(build_dir: &Path) -> PathBuf {
    let static_copy = build_dir.join("bin/pacman-static");
    if static_copy.exists() {
        static_copy
    } else {
        PathBuf::from("pacman")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_map_syntax_colon() {
        let help = " -U, --map-users=<inneruid>:<outeruid>:<count>\n";
        assert_eq!(parse_map_syntax(help), Some(MapSyntax::InnerOuterCount));
    }

    #[test]
    fn test_parse_map_syntax_comma() {
        let help = " -U, --map-users=<outeruid>,<inneruid>,<count>\n";
        assert_eq!(parse_map_syntax(help), Some(MapSyntax::OuterInnerCount));
    }

    #[test]
    fn test_parse_map_syntax_absent() {
        let help = " -U, --user  unshare user namespace\n";
        assert_eq!(parse_map_syntax(help), None);
    }

    #[test]
    fn test_format_mapping() {
        assert_eq!(
            format_mapping(MapSyntax::InnerOuterCount, 0, 1000, 1),
            "0:1000:1"
        );
        assert_eq!(
            format_mapping(MapSyntax::OuterInnerCount, 1, 100000, 65535),
            "100000,1,65535"
        );
    }

    #[test]
    fn test_id_mappings() {
        let maps = id_mappings(1000, 100000);
        assert_eq!(maps[0], (0, 1000, 1));
        assert_eq!(maps[1], (1, 100000, 65535));
    }
}

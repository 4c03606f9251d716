//! Host validation before any work happens.
//!
//! Checks the external tools a run will need, so the build fails with an
//! installation hint instead of a mid-build subprocess error, and
//! verifies the binfmt handler wiring for cross builds.

use anyhow::{bail, Result};
use std::fs;
use std::path::Path;

use crate::context::{qemu_arch, ArtifactKind, BuildContext};
use crate::process;

/// Tools every build needs, as (command, providing package) tuples.
const BASE_TOOLS: &[(&str, &str)] = &[
    ("unshare", "util-linux"),
    ("bsdtar", "libarchive"),
    ("chroot", "coreutils"),
];

/// Additional tools for partition and disk artifacts.
const DISK_TOOLS: &[(&str, &str)] = &[
    ("sfdisk", "util-linux"),
    ("mkfs.fat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mcopy", "mtools"),
    ("mmd", "mtools"),
    ("dd", "coreutils"),
];

/// Id-mapping helpers used by the async spawn mode.
const ASYNC_TOOLS: &[(&str, &str)] = &[
    ("newuidmap", "shadow"),
    ("newgidmap", "shadow"),
];

/// Check that specific tools are available.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();
    for (tool, package) in tools {
        if !process::exists(tool) {
            missing.push(format!("  {} (install: {})", tool, package));
        }
    }
    if !missing.is_empty() {
        bail!("missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Check everything the parent knows this run will shell out to.
pub fn check_parent_tools(ctx: &BuildContext) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = BASE_TOOLS.to_vec();
    let wants_disk = ctx.creates.iter().any(|c| {
        matches!(
            c,
            ArtifactKind::PartBoot
                | ArtifactKind::PartRoot
                | ArtifactKind::PartHome
                | ArtifactKind::DiskImg
        )
    });
    if wants_disk {
        tools.extend_from_slice(DISK_TOOLS);
    }
    if ctx.async_child {
        tools.extend_from_slice(ASYNC_TOOLS);
    }
    check_required_tools(&tools)
}

/// Verify the binfmt_misc handler for a foreign target architecture.
pub fn check_binfmt(arch_host: &str, arch_target: &str) -> Result<()> {
    if arch_host == arch_target {
        return Ok(());
    }
    let handler = format!("qemu-{}", qemu_arch(arch_target));
    let path = Path::new("/proc/sys/fs/binfmt_misc").join(&handler);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => bail!(
            "no binfmt handler at {}; install and register {} to run {} binaries",
            path.display(),
            handler,
            arch_target
        ),
    };
    if !content.starts_with("enabled") {
        bail!("binfmt handler {} is registered but disabled", handler);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure_names_package() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn test_check_binfmt_native_is_noop() {
        assert!(check_binfmt("x86_64", "x86_64").is_ok());
    }
}

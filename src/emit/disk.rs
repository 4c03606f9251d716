//! Disk assembly: partition table creation and image splicing.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::process::Cmd;
use crate::table::PartitionTable;

const MIB: u64 = 1024 * 1024;

/// Assemble a raw disk image in place at `target`.
///
/// The file is sized to the table's computed minimum, the partition table
/// is applied by `sfdisk`, an optional bootstrap head is stamped over the
/// first bytes and each partition image is spliced in at its MiB offset.
pub fn assemble(
    target: &Path,
    table: &PartitionTable,
    head: Option<&Path>,
    partitions: &[(u64, PathBuf)],
) -> Result<()> {
    if target.exists() {
        fs::remove_file(target)
            .with_context(|| format!("failed to remove stale {}", target.display()))?;
    }
    let file = File::create(target)
        .with_context(|| format!("failed to create {}", target.display()))?;
    file.set_len(table.size_mib * MIB)
        .with_context(|| format!("failed to size {}", target.display()))?;
    drop(file);

    Cmd::new("sfdisk")
        .arg_path(target)
        .stdin_bytes(table.render_sfdisk())
        .quiet()
        .error_msg("sfdisk failed to apply the partition table")
        .run()?;

    if let Some(head) = head {
        info!("stamping bootstrap head {}", head.display());
        Cmd::new("dd")
            .arg(format!("if={}", head.display()))
            .arg(format!("of={}", target.display()))
            .args(["conv=notrunc", "status=none"])
            .error_msg("dd failed for the bootstrap head")
            .run()?;
    }

    for (offset_mib, image) in partitions {
        info!(
            "writing {} at offset {} MiB",
            image.display(),
            offset_mib
        );
        Cmd::new("dd")
            .arg(format!("if={}", image.display()))
            .arg(format!("of={}", target.display()))
            .args(["bs=1M", "conv=notrunc", "status=none"])
            .arg(format!("seek={}", offset_mib))
            .error_msg("dd failed for a partition image")
            .run()?;
    }

    Ok(())
}

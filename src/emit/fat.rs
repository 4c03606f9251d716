//! FAT image helpers over `mkfs.fat` and mtools.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::process::Cmd;

const MIB: u64 = 1024 * 1024;

/// Create a FAT image of the given size with a fixed volume id.
pub fn create_image(path: &Path, size_mib: u64, volume_id: &str, extra_args: &[String]) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale {}", path.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.set_len(size_mib * MIB)
        .with_context(|| format!("failed to size {}", path.display()))?;
    drop(file);

    Cmd::new("mkfs.fat")
        .args(["-i", volume_id])
        .args(extra_args.iter().map(String::as_str))
        .arg_path(path)
        .error_msg("mkfs.fat failed")
        .run()?;
    Ok(())
}

/// Create a directory inside a FAT image; an existing one is fine.
pub fn mmd(image: &Path, dir: &str) -> Result<()> {
    let _ = Cmd::new("mmd")
        .arg("-i")
        .arg_path(image)
        .arg(format!("::{}", dir))
        .allow_fail()
        .quiet()
        .run();
    Ok(())
}

/// Copy files into a FAT image, recursively and overwriting.
pub fn mcopy(image: &Path, sources: &[PathBuf], dest: &str) -> Result<()> {
    if sources.is_empty() {
        return Ok(());
    }
    let mut cmd = Cmd::new("mcopy").args(["-o", "-s", "-i"]).arg_path(image);
    for source in sources {
        cmd = cmd.arg_path(source);
    }
    cmd.arg(format!("::{}", dest))
        .error_msg("mcopy into the FAT image failed")
        .run()?;
    Ok(())
}

/// Write text content to a path inside a FAT image.
pub fn mcopy_text(image: &Path, dest: &str, content: &str) -> Result<()> {
    let staging = image.with_extension("mcopy.tmp");
    fs::write(&staging, content)
        .with_context(|| format!("failed to write {}", staging.display()))?;
    let result = Cmd::new("mcopy")
        .args(["-o", "-i"])
        .arg_path(image)
        .arg_path(&staging)
        .arg(format!("::{}", dest))
        .error_msg("mcopy into the FAT image failed")
        .run();
    let _ = fs::remove_file(&staging);
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_image_sizes_file() {
        if !crate::process::exists("mkfs.fat") {
            return;
        }
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("boot.img");
        create_image(&image, 4, "DEADBEEF", &[]).unwrap();
        assert_eq!(fs::metadata(&image).unwrap().len(), 4 * MIB);
    }
}

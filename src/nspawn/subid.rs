//! Caller identity and subordinate id resolution.
//!
//! The builder must run as a regular user that owns a contiguous range of
//! at least 65535 subordinate uids and gids, so the child can map inner
//! id 0 to the caller and inner ids 1..65536 to the subordinate range.

use anyhow::{bail, Context, Result};
use nix::unistd::{Gid, Uid, User};
use std::fmt;
use std::fs;
use std::path::Path;

/// Minimum subordinate range length required for a usable chroot.
pub const SUBID_MIN: u32 = 65535;

/// One contiguous subordinate id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubidRange {
    pub start: u32,
    pub count: u32,
}

impl fmt::Display for SubidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.count)
    }
}

/// The resolved caller identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub subuid: SubidRange,
    pub subgid: SubidRange,
}

/// Resolve the caller and its subordinate ranges, refusing real root.
pub fn resolve() -> Result<Identity> {
    let uid = Uid::current();
    let gid = Gid::current();
    let user = User::from_uid(uid)
        .context("failed to look up the calling user")?
        .with_context(|| format!("no passwd entry for uid {}", uid))?;

    if uid.is_root() || gid.as_raw() == 0 || user.name == "root" {
        bail!(
            "refusing to run as root (uid {}, gid {}, name '{}'); \
             the builder is rootless by design",
            uid,
            gid,
            user.name
        );
    }

    let subuid = resolve_range(Path::new("/etc/subuid"), &user.name, uid.as_raw())?;
    let subgid = resolve_range(Path::new("/etc/subgid"), &user.name, uid.as_raw())?;

    Ok(Identity {
        uid: uid.as_raw(),
        gid: gid.as_raw(),
        name: user.name,
        subuid,
        subgid,
    })
}

fn resolve_range(path: &Path, name: &str, uid: u32) -> Result<SubidRange> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let range = find_range(&content, name, uid).with_context(|| {
        format!(
            "{} carries no entry for '{}' or uid {}; \
             grant a subordinate range of at least {} ids",
            path.display(),
            name,
            uid,
            SUBID_MIN
        )
    })?;
    if range.count < SUBID_MIN {
        bail!(
            "subordinate range {} in {} is shorter than the required {} ids",
            range,
            path.display(),
            SUBID_MIN
        );
    }
    Ok(range)
}

/// Find the first entry keyed by user name, falling back to the numeric
/// uid as Linux tooling does.
fn find_range(content: &str, name: &str, uid: u32) -> Option<SubidRange> {
    let uid_key = uid.to_string();
    let mut by_uid = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, ':');
        let key = fields.next()?;
        let start = fields.next()?.parse().ok()?;
        let count = fields.next()?.trim().parse().ok()?;
        let range = SubidRange { start, count };
        if key == name {
            return Some(range);
        }
        if key == uid_key && by_uid.is_none() {
            by_uid = Some(range);
        }
    }
    by_uid
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBUID: &str = "\
# comment
alice:100000:65536
bob:165536:65536
1000:231072:65536
";

    #[test]
    fn test_find_range_by_name() {
        let range = find_range(SUBUID, "bob", 1001).unwrap();
        assert_eq!(range, SubidRange { start: 165536, count: 65536 });
    }

    #[test]
    fn test_find_range_numeric_fallback() {
        let range = find_range(SUBUID, "carol", 1000).unwrap();
        assert_eq!(range, SubidRange { start: 231072, count: 65536 });
    }

    #[test]
    fn test_name_wins_over_numeric() {
        let content = "1000:300000:65536\nalice:100000:65536\n";
        let range = find_range(content, "alice", 1000).unwrap();
        assert_eq!(range.start, 100000);
    }

    #[test]
    fn test_find_range_missing() {
        assert!(find_range(SUBUID, "carol", 1234).is_none());
    }

    #[test]
    fn test_short_range_rejected() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), "dave:100000:100\n").unwrap();
        let err = resolve_range(temp.path(), "dave", 1000).unwrap_err();
        assert!(err.to_string().contains("shorter"));
    }
}

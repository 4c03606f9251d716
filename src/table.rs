//! Partition table model.
//!
//! Parses an `sfdisk --dump`-style declaration in which builder-managed
//! partitions are prefixed `aimager@<role>:`, computes per-partition
//! sizes and offsets in MiB, synthesizes filesystem UUIDs and derives the
//! minimum disk size. The model renders back out as an sfdisk script for
//! disk assembly and as `/etc/fstab` entries for the target.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

const SECTOR: u64 = 512;
const MIB: u64 = 1024 * 1024;
const SECTORS_PER_MIB: u64 = MIB / SECTOR;
/// Backup GPT header and table at the tail of the disk.
const GPT_BACKUP_SECTORS: u64 = 33;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("duplicate partition role: {0}")]
    DuplicateRole(PartRole),
    #[error("unknown size suffix in '{0}'")]
    UnknownSuffix(String),
    #[error("partition table declares no root partition")]
    MissingTableRoot,
    #[error("malformed partition table: {0}")]
    Malformed(String),
}

type Result<T> = std::result::Result<T, TableError>;

/// Semantic purpose of a partition, from the last four characters of its
/// declared `aimager@` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartRole {
    Boot,
    Root,
    Home,
    Swap,
}

impl PartRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartRole::Boot => "boot",
            PartRole::Root => "root",
            PartRole::Home => "home",
            PartRole::Swap => "swap",
        }
    }

    /// Mount point recorded in fstab.
    pub fn mountpoint(&self) -> &'static str {
        match self {
            PartRole::Boot => "/boot",
            PartRole::Root => "/",
            PartRole::Home => "/home",
            PartRole::Swap => "none",
        }
    }
}

impl fmt::Display for PartRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartRole {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "boot" => Ok(PartRole::Boot),
            "root" => Ok(PartRole::Root),
            "home" => Ok(PartRole::Home),
            "swap" => Ok(PartRole::Swap),
            other => Err(TableError::Malformed(format!(
                "unknown partition role '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableLabel {
    Gpt,
    Dos,
}

impl TableLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableLabel::Gpt => "gpt",
            TableLabel::Dos => "dos",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub role: PartRole,
    pub size_mib: u64,
    pub offset_mib: u64,
    pub part_type: Option<String>,
    /// Filesystem UUID. Full v4 for ext4/swap; `XXXX-XXXX` FAT serial for
    /// the boot partition.
    pub uuid: String,
    /// Declaration fields as written, without the `aimager@<role>:` prefix.
    pub raw: String,
}

impl Partition {
    /// FAT volume id (8 hex digits, no separator) for the boot partition.
    pub fn fat_volume_id(&self) -> String {
        self.uuid.replace('-', "")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionTable {
    pub label: TableLabel,
    pub partitions: Vec<Partition>,
    /// Minimum disk size in MiB.
    pub size_mib: u64,
}

impl PartitionTable {
    /// Parse a declaration, synthesizing random UUIDs.
    pub fn parse(decl: &str) -> Result<Self> {
        Self::parse_with(decl, &mut Uuid::new_v4)
    }

    /// Parse with an injected uuid source.
    pub fn parse_with(decl: &str, uuid_source: &mut dyn FnMut() -> Uuid) -> Result<Self> {
        struct ParsedLine {
            role: PartRole,
            size_mib: u64,
            offset_mib: Option<u64>,
            part_type: Option<String>,
            uuid: String,
            raw: String,
        }

        let mut label = TableLabel::Dos;
        let mut first_lba: Option<u64> = None;
        let mut last_lba: Option<u64> = None;
        let mut lines: Vec<ParsedLine> = Vec::new();

        for line in decl.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(value) = line.strip_prefix("label:") {
                if value.trim() == "gpt" {
                    label = TableLabel::Gpt;
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("first-lba:") {
                first_lba = Some(parse_lba(value)?);
                continue;
            }
            if let Some(value) = line.strip_prefix("last-lba:") {
                last_lba = Some(parse_lba(value)?);
                continue;
            }
            let Some(rest) = line.strip_prefix("aimager@") else {
                // Not a builder-managed line (label-id, device, unit, …).
                continue;
            };

            let (name, fields) = rest.split_once(':').ok_or_else(|| {
                TableError::Malformed(format!("partition line without ':': {}", line))
            })?;
            let name = name.trim().to_lowercase();
            let tail: String = {
                let chars: Vec<char> = name.chars().collect();
                if chars.len() < 4 {
                    return Err(TableError::Malformed(format!(
                        "partition name '{}' is too short to carry a role",
                        name
                    )));
                }
                chars[chars.len() - 4..].iter().collect()
            };
            let role: PartRole = tail.parse()?;
            if lines.iter().any(|p| p.role == role) {
                return Err(TableError::DuplicateRole(role));
            }

            let kv = parse_fields(fields);
            let size = kv.get("size").ok_or_else(|| {
                TableError::Malformed(format!("partition '{}' has no size", name))
            })?;
            let size_mib = parse_size_mib(size)?;
            let offset_mib = match kv.get("start").or_else(|| kv.get("offset")) {
                Some(v) => Some(parse_size_mib(v)?),
                None => None,
            };

            let uuid = uuid_source();
            let uuid = match role {
                PartRole::Boot => fat_serial(&uuid),
                _ => uuid.to_string(),
            };

            lines.push(ParsedLine {
                role,
                size_mib,
                offset_mib,
                part_type: kv.get("type").cloned(),
                uuid,
                raw: fields.trim().to_string(),
            });
        }

        if !lines.iter().any(|p| p.role == PartRole::Root) {
            return Err(TableError::MissingTableRoot);
        }

        // Default offsets chain from first-lba (2048 sectors unless declared).
        let first_mib = lba_to_mib(first_lba.unwrap_or(2048));
        let mut next = first_mib;
        let mut partitions = Vec::with_capacity(lines.len());
        for line in lines {
            let offset_mib = match line.offset_mib {
                Some(offset) if offset < next => {
                    return Err(TableError::Malformed(format!(
                        "partition '{}' at {} MiB overlaps the previous end at {} MiB",
                        line.role, offset, next
                    )));
                }
                Some(offset) => offset,
                None => next,
            };
            next = offset_mib + line.size_mib;
            partitions.push(Partition {
                role: line.role,
                size_mib: line.size_mib,
                offset_mib,
                part_type: line.part_type,
                uuid: line.uuid,
                raw: line.raw,
            });
        }

        let size_mib = match last_lba {
            Some(lba) => {
                let backup = match label {
                    TableLabel::Gpt => GPT_BACKUP_SECTORS,
                    TableLabel::Dos => 0,
                };
                div_ceil((lba + backup + 1) * SECTOR, MIB)
            }
            None => {
                let max_end = partitions
                    .iter()
                    .map(|p| p.offset_mib + p.size_mib)
                    .max()
                    .unwrap_or(first_mib);
                match label {
                    TableLabel::Gpt => max_end + 1,
                    TableLabel::Dos => max_end,
                }
            }
        };

        Ok(Self {
            label,
            partitions,
            size_mib,
        })
    }

    pub fn part(&self, role: PartRole) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.role == role)
    }

    /// The sfdisk script that reproduces this table on a blank image.
    pub fn render_sfdisk(&self) -> String {
        let mut script = format!("label: {}\n", self.label.as_str());
        for part in &self.partitions {
            script.push_str(&format!(
                "start={}, size={}",
                part.offset_mib * SECTORS_PER_MIB,
                part.size_mib * SECTORS_PER_MIB
            ));
            if let Some(ptype) = &part.part_type {
                if ptype.chars().all(|c| c.is_ascii_alphanumeric()) {
                    script.push_str(&format!(", type={}", ptype));
                } else {
                    script.push_str(&format!(", type=\"{}\"", ptype));
                }
            }
            script.push('\n');
        }
        script
    }

    /// `/etc/fstab` for the target, one entry per declared role.
    pub fn render_fstab(&self) -> String {
        let mut fstab = String::from("# <file system> <dir> <type> <options> <dump> <pass>\n");
        for part in &self.partitions {
            let (fstype, options, pass) = match part.role {
                PartRole::Root => ("ext4", "rw,noatime,defaults", 1),
                PartRole::Boot => ("vfat", "rw,defaults", 2),
                PartRole::Home => ("ext4", "rw,noatime,defaults", 1),
                PartRole::Swap => ("swap", "defaults", 0),
            };
            fstab.push_str(&format!(
                "UUID={} {} {} {} 0 {}\n",
                part.uuid,
                part.role.mountpoint(),
                fstype,
                options,
                pass
            ));
        }
        fstab
    }
}

/// `XXXX-XXXX` from the first 8 hex digits of a uuid, upper-cased to
/// match how the kernel reports FAT volume ids.
fn fat_serial(uuid: &Uuid) -> String {
    let hex: String = uuid
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase();
    format!("{}-{}", &hex[..4], &hex[4..])
}

fn parse_lba(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| TableError::Malformed(format!("bad lba value '{}'", value.trim())))
}

fn lba_to_mib(lba: u64) -> u64 {
    lba * SECTOR / MIB
}

fn div_ceil(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Split `key=value` fields on commas, honouring double quotes.
fn parse_fields(fields: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut parts = Vec::new();
    for c in fields.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => {
                map.insert(k.trim().to_lowercase(), v.trim().trim_matches('"').to_string());
            }
            None => {
                // Bare flag such as `bootable`.
                map.insert(part.to_lowercase(), String::new());
            }
        }
    }
    map
}

/// Parse a size field to MiB, rounding up.
///
/// A bare integer counts sectors; `K`/`M`/`G`/`T`/`P`/`E` with an optional
/// `iB`/`B` tail are binary multiples of bytes.
pub fn parse_size_mib(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TableError::Malformed("empty size".to_string()));
    }
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(TableError::UnknownSuffix(value.to_string()));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| TableError::Malformed(format!("bad size '{}'", value)))?;
    let suffix = &value[digits.len()..];

    if suffix.is_empty() {
        return Ok(div_ceil(number * SECTOR, MIB));
    }

    let mut chars = suffix.chars();
    let unit = chars.next().unwrap().to_ascii_uppercase();
    let tail: String = chars.collect();
    if !matches!(tail.as_str(), "" | "B" | "b" | "iB" | "ib") {
        return Err(TableError::UnknownSuffix(value.to_string()));
    }
    let exponent = match unit {
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        'P' => 5,
        'E' => 6,
        _ => return Err(TableError::UnknownSuffix(value.to_string())),
    };
    let bytes = number
        .checked_mul(1024u64.pow(exponent))
        .ok_or_else(|| TableError::Malformed(format!("size '{}' overflows", value)))?;
    Ok(div_ceil(bytes, MIB))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_uuids(uuids: &[&str]) -> impl FnMut() -> Uuid {
        let parsed: Vec<Uuid> = uuids.iter().map(|u| Uuid::parse_str(u).unwrap()).collect();
        let mut index = 0;
        move || {
            let u = parsed[index % parsed.len()];
            index += 1;
            u
        }
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size_mib("1G").unwrap(), 1024);
        assert_eq!(parse_size_mib("1GiB").unwrap(), 1024);
        assert_eq!(parse_size_mib("16G").unwrap(), 16384);
        assert_eq!(parse_size_mib("512M").unwrap(), 512);
        assert_eq!(parse_size_mib("1K").unwrap(), 1);
        // Bare integers are sectors.
        assert_eq!(parse_size_mib("2048").unwrap(), 1);
        assert_eq!(parse_size_mib("2049").unwrap(), 2);
    }

    #[test]
    fn test_parse_size_unknown_suffix() {
        assert!(matches!(
            parse_size_mib("1Q").unwrap_err(),
            TableError::UnknownSuffix(_)
        ));
        assert!(matches!(
            parse_size_mib("1Gx").unwrap_err(),
            TableError::UnknownSuffix(_)
        ));
    }

    #[test]
    fn test_two_partition_gpt_layout() {
        let decl = "label: gpt\n\
                    aimager@boot: size=1G,type=uefi\n\
                    aimager@root: size=16G,type=\"Linux root (x86-64)\"\n";
        let table = PartitionTable::parse(decl).unwrap();

        assert_eq!(table.label, TableLabel::Gpt);
        assert_eq!(table.partitions.len(), 2);

        let boot = table.part(PartRole::Boot).unwrap();
        assert_eq!(boot.size_mib, 1024);
        assert_eq!(boot.offset_mib, 1);

        let root = table.part(PartRole::Root).unwrap();
        assert_eq!(root.size_mib, 16384);
        assert_eq!(root.offset_mib, 1025);
        assert_eq!(root.part_type.as_deref(), Some("Linux root (x86-64)"));

        // 16384 + 1024 + 1 (first MiB) + 1 (gpt footer)
        assert_eq!(table.size_mib, 17410);
    }

    #[test]
    fn test_explicit_offsets_and_dos_label() {
        let decl = "label: dos\n\
                    aimager@boot: start=4M,size=256M,type=c\n\
                    aimager@root: size=2G,type=83\n";
        let table = PartitionTable::parse(decl).unwrap();
        assert_eq!(table.label, TableLabel::Dos);
        let boot = table.part(PartRole::Boot).unwrap();
        assert_eq!(boot.offset_mib, 4);
        let root = table.part(PartRole::Root).unwrap();
        assert_eq!(root.offset_mib, 260);
        // No gpt footer for dos.
        assert_eq!(table.size_mib, 260 + 2048);
    }

    #[test]
    fn test_last_lba_overrides_size() {
        let decl = "label: gpt\n\
                    last-lba: 4194270\n\
                    aimager@root: size=1G\n";
        let table = PartitionTable::parse(decl).unwrap();
        // (4194270 + 33 + 1) * 512 / MiB = 2048.00… rounded up
        assert_eq!(table.size_mib, 2048);
    }

    #[test]
    fn test_duplicate_role() {
        let decl = "label: gpt\n\
                    aimager@root: size=1G\n\
                    aimager@root: size=2G\n";
        assert!(matches!(
            PartitionTable::parse(decl).unwrap_err(),
            TableError::DuplicateRole(PartRole::Root)
        ));
    }

    #[test]
    fn test_missing_root() {
        let decl = "label: gpt\naimager@boot: size=1G\n";
        assert!(matches!(
            PartitionTable::parse(decl).unwrap_err(),
            TableError::MissingTableRoot
        ));
    }

    #[test]
    fn test_boot_uuid_is_fat_serial() {
        let decl = "label: gpt\n\
                    aimager@boot: size=512M,type=uefi\n\
                    aimager@root: size=4G\n";
        let mut source = fixed_uuids(&[
            "deadbeef-cafe-4000-8000-000000000001",
            "12345678-9abc-4000-8000-000000000002",
        ]);
        let table = PartitionTable::parse_with(decl, &mut source).unwrap();

        let boot = table.part(PartRole::Boot).unwrap();
        assert_eq!(boot.uuid, "DEAD-BEEF");
        assert_eq!(boot.fat_volume_id(), "DEADBEEF");

        let root = table.part(PartRole::Root).unwrap();
        assert_eq!(root.uuid, "12345678-9abc-4000-8000-000000000002");
    }

    #[test]
    fn test_fstab_rendering() {
        let decl = "label: gpt\n\
                    aimager@boot: size=512M,type=uefi\n\
                    aimager@root: size=4G\n\
                    aimager@home: size=8G\n\
                    aimager@swap: size=2G\n";
        let mut source = fixed_uuids(&["deadbeef-cafe-4000-8000-000000000001"]);
        let table = PartitionTable::parse_with(decl, &mut source).unwrap();
        let fstab = table.render_fstab();

        assert!(fstab.contains("UUID=DEAD-BEEF /boot vfat rw,defaults 0 2"));
        assert!(fstab.contains(" / ext4 rw,noatime,defaults 0 1"));
        assert!(fstab.contains(" /home ext4 rw,noatime,defaults 0 1"));
        assert!(fstab.contains(" none swap defaults 0 0"));
    }

    #[test]
    fn test_sfdisk_rendering() {
        let decl = "label: gpt\n\
                    aimager@boot: size=1G,type=uefi\n\
                    aimager@root: size=16G,type=\"Linux root (x86-64)\"\n";
        let table = PartitionTable::parse(decl).unwrap();
        let script = table.render_sfdisk();

        assert!(script.starts_with("label: gpt\n"));
        assert!(script.contains("start=2048, size=2097152, type=uefi"));
        assert!(script.contains("start=2099200, size=33554432, type=\"Linux root (x86-64)\""));
    }

    #[test]
    fn test_overlapping_offsets_rejected() {
        let decl = "label: gpt\n\
                    aimager@boot: size=1G\n\
                    aimager@root: start=512M,size=1G\n";
        assert!(matches!(
            PartitionTable::parse(decl).unwrap_err(),
            TableError::Malformed(_)
        ));
    }
}

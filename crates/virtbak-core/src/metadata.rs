//! On-disk metadata records.
//!
//! A completed backup is described by a [`Definition`] stored as
//! `<name>.json` next to its artifacts; a backup in flight (or aborted) is
//! described by a [`PendingInfo`] stored as `<name>.json.pending`. Both are
//! schema-versioned and run through the compat chain on load, so records
//! written by older releases keep working.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compat;
use crate::error::{Error, Result};

/// Archive container variant holding a backup's artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagerKind {
    Directory,
    Tar,
    Zstd,
}

impl PackagerKind {
    /// Shareable containers may hold artifacts from several backups; for
    /// those, retention removes individual artifacts and only drops the
    /// package once it is empty.
    pub fn is_shareable(self) -> bool {
        match self {
            PackagerKind::Directory | PackagerKind::Zstd => true,
            PackagerKind::Tar => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackagerKind::Directory => "directory",
            PackagerKind::Tar => "tar",
            PackagerKind::Zstd => "zstd",
        }
    }
}

impl fmt::Display for PackagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackagerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "directory" => Ok(PackagerKind::Directory),
            "tar" => Ok(PackagerKind::Tar),
            "zstd" => Ok(PackagerKind::Zstd),
            other => Err(Error::unsupported_packager(other, "unknown packager type")),
        }
    }
}

/// Stream compression applied inside a tar archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gz,
    Bz2,
    Xz,
}

impl Compression {
    /// File extension suffix for a tar archive using this compression.
    pub fn tar_extension(self) -> &'static str {
        match self {
            Compression::None => "tar",
            Compression::Gz => "tar.gz",
            Compression::Bz2 => "tar.bz2",
            Compression::Xz => "tar.xz",
        }
    }
}

/// Packager tuning knobs, persisted verbatim in definitions.
///
/// `compression_lvl` passes through to the selected codec as-is: gz and bz2
/// take a 0-9 / 1-9 level, xz interprets it as a preset, zstd as its own
/// level scale. `threads` only applies to zstd.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagerOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_lvl: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

impl PackagerOpts {
    /// The compression actually in effect (`none` collapses to no codec).
    pub fn effective_compression(&self) -> Option<Compression> {
        match self.compression {
            Some(Compression::None) | None => None,
            other => other,
        }
    }
}

/// Packager section of a metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagerInfo {
    #[serde(rename = "type")]
    pub kind: PackagerKind,
    #[serde(default)]
    pub opts: PackagerOpts,
}

/// Metadata of a completed backup, written as `<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub version: String,
    #[serde(default)]
    pub name: String,
    pub domain_id: i64,
    pub domain_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_xml: Option<String>,
    pub date: i64,
    #[serde(default)]
    pub disks: BTreeMap<String, String>,
    pub packager: PackagerInfo,
}

/// Per-disk progress recorded while a backup runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDisk {
    pub src: String,
    pub snapshot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Metadata of an in-flight backup, written as `<name>.json.pending`.
/// Its presence after the fact marks a broken backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInfo {
    pub version: String,
    #[serde(default)]
    pub name: String,
    pub domain_id: i64,
    pub domain_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_xml: Option<String>,
    pub date: i64,
    #[serde(default)]
    pub disks: BTreeMap<String, PendingDisk>,
    pub packager: PackagerInfo,
}

/// `<backup_dir>/<name>.json`
pub fn definition_path(backup_dir: &Path, name: &str) -> PathBuf {
    backup_dir.join(format!("{name}.json"))
}

/// `<backup_dir>/<name>.json.pending`
pub fn pending_info_path(backup_dir: &Path, name: &str) -> PathBuf {
    backup_dir.join(format!("{name}.json.pending"))
}

/// Serialize with the repository's canonical pretty format (4-space indent).
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(buf).map_err(|e| Error::InvalidMetadata(e.to_string()))
}

/// Write a metadata record with open-write-close semantics (no append).
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, to_json_pretty(value)?)?;
    Ok(())
}

/// Load and migrate a definition record.
pub fn load_definition(path: &Path) -> Result<Definition> {
    let mut record = read_record(path)?;
    compat::definition::convert(&mut record)?;
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Load and migrate a pending-info record.
pub fn load_pending_info(path: &Path) -> Result<PendingInfo> {
    let mut record = read_record(path)?;
    compat::pending_info::convert(&mut record)?;
    Ok(serde_json::from_value(Value::Object(record))?)
}

fn read_record(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::InvalidMetadata(format!(
            "{} does not hold a JSON object",
            path.display()
        ))),
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every fallible operation in virtbak returns one of these variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk {0} not found in domain")]
    DiskNotFound(String),

    #[error("domain {0} not found")]
    DomainNotFound(String),

    #[error("domain {0} must be shut down for this operation")]
    DomainRunning(String),

    #[error("snapshot not started")]
    SnapshotNotStarted,

    #[error("disk {0} is not part of the snapshot")]
    DiskNotSnapshot(String),

    #[error("image {name} not found in {location}")]
    ImageNotFound { name: String, location: String },

    #[error("image {} already exists", .0.display())]
    ImageExists(PathBuf),

    #[error("packager is not opened")]
    PackagerNotOpened,

    #[error("packager is already opened")]
    PackagerOpened,

    #[error("packager {name} is unsupported: {reason}")]
    UnsupportedPackager { name: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("backup not found")]
    BackupNotFound,

    #[error("{0}")]
    BackupsFailureInGroup(GroupFailure),

    #[error("invalid domain XML: {0}")]
    InvalidXml(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported hypervisor URI {0:?}: only the built-in test driver is available")]
    UnsupportedUri(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn unsupported_packager(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnsupportedPackager {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Aggregate outcome of a group run in which at least one backup failed.
///
/// `completed` holds the names of the domains whose backup finished;
/// `errors` maps each failed domain to the rendered error.
#[derive(Debug, Default)]
pub struct GroupFailure {
    pub completed: Vec<String>,
    pub errors: BTreeMap<String, String>,
}

impl fmt::Display for GroupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} backup(s) failed in group ({} completed)",
            self.errors.len(),
            self.completed.len()
        )?;
        for (domain, err) in &self.errors {
            write!(f, "\n  {domain}: {err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_failure_display() {
        let mut errors = BTreeMap::new();
        errors.insert("vm1".to_string(), "boom".to_string());
        let failure = GroupFailure {
            completed: vec!["vm2".to_string()],
            errors,
        };
        let rendered = failure.to_string();
        assert!(rendered.contains("1 backup(s) failed"));
        assert!(rendered.contains("vm1: boom"));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::DiskNotFound("vda".to_string()).to_string(),
            "disk vda not found in domain"
        );
        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }
}

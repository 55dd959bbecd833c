//! YAML configuration.
//!
//! The file holds the hypervisor URI, a thread count, and named backup
//! groups; a `default:` section is shallow-merged into each group before
//! typed parsing. Deprecated keys are rewritten by the compat layer, which
//! reports warnings for the operator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

use crate::compat;
use crate::error::{Error, Result};
use crate::metadata::PackagerOpts;
use crate::retention::{KeepCount, RetentionPolicy};

pub const CONFIG_FILENAME: &str = "config.yml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub uri: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub debug: bool,
    pub threads: Option<usize>,
    pub groups: BTreeMap<String, GroupConfig>,
}

/// One backup group as configured.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Repository directory for this group's backups.
    pub target: Option<PathBuf>,
    pub packager: Option<String>,
    pub packager_opts: Option<PackagerOpts>,
    pub hosts: Vec<HostEntry>,
    pub hourly: Option<KeepCount>,
    pub daily: Option<KeepCount>,
    pub weekly: Option<KeepCount>,
    pub monthly: Option<KeepCount>,
    pub yearly: Option<KeepCount>,
    /// Run this group when `backup` is invoked without group names.
    pub autostart: Option<bool>,
    pub quiesce: Option<bool>,
    /// Seconds to wait for a block-job pivot; unset waits forever.
    pub timeout: Option<u64>,
}

/// One entry of a group's `hosts:` list: a bare pattern, or a mapping with
/// per-host overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HostEntry {
    Pattern(String),
    Detailed {
        host: String,
        #[serde(default)]
        disks: Option<Vec<String>>,
        #[serde(default)]
        quiesce: Option<bool>,
    },
}

impl HostEntry {
    pub fn pattern(&self) -> &str {
        match self {
            HostEntry::Pattern(p) => p,
            HostEntry::Detailed { host, .. } => host,
        }
    }
}

impl GroupConfig {
    pub fn autostart(&self) -> bool {
        self.autostart.unwrap_or(true)
    }

    /// Host patterns only, overrides stripped.
    pub fn host_patterns(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.pattern().to_string()).collect()
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            hourly: self.hourly.unwrap_or_default(),
            daily: self.daily.unwrap_or_default(),
            weekly: self.weekly.unwrap_or_default(),
            monthly: self.monthly.unwrap_or_default(),
            yearly: self.yearly.unwrap_or_default(),
        }
    }
}

impl Config {
    /// Parse a config document, returning the typed config plus the compat
    /// warnings to surface to the operator.
    pub fn from_str(text: &str) -> Result<(Self, Vec<String>)> {
        let mut raw: Value = serde_yaml::from_str(text)?;
        let warnings = compat::config::convert_warn(&mut raw);
        merge_defaults(&mut raw);
        let config = serde_yaml::from_value(raw)?;
        Ok((config, warnings))
    }

    pub fn load(path: &Path) -> Result<(Self, Vec<String>)> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_str(&text)
    }
}

/// Shallow-merge the `default:` mapping into every group, group keys winning.
fn merge_defaults(root: &mut Value) {
    let Some(root) = root.as_mapping_mut() else {
        return;
    };
    let Some(defaults) = root.remove("default").and_then(|d| match d {
        Value::Mapping(m) => Some(m),
        _ => None,
    }) else {
        return;
    };

    let Some(groups) = root.get_mut("groups").and_then(Value::as_mapping_mut) else {
        return;
    };
    for (_, group) in groups.iter_mut() {
        let Some(group) = group.as_mapping_mut() else {
            continue;
        };
        for (key, value) in &defaults {
            if !group.contains_key(key) {
                group.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Configuration search path: user config dir first, then the system one.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let user_base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")));
    if let Some(base) = user_base {
        paths.push(base.join("virtbak").join(CONFIG_FILENAME));
    }
    paths.push(PathBuf::from("/etc/virtbak").join(CONFIG_FILENAME));
    paths
}

/// First config file present in the search path.
pub fn find_config() -> Option<PathBuf> {
    default_config_paths().into_iter().find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Compression;

    const SAMPLE: &str = r#"
uri: "qemu:///system"
threads: 4

default:
  packager: tar
  packager_opts:
    compression: xz
  daily: 3

groups:
  test:
    target: /mnt/backups
    autostart: true
    hourly: 2
    hosts:
      - "r:^matching\\d?$"
      - "!matching2"
      - host: web
        disks: [vda, vdb]
        quiesce: true
  other:
    target: /mnt/other
    packager: directory
    hosts: [db]
"#;

    #[test]
    fn test_parse_sample_config() {
        let (config, warnings) = Config::from_str(SAMPLE).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.uri.as_deref(), Some("qemu:///system"));
        assert_eq!(config.threads, Some(4));
        assert_eq!(config.groups.len(), 2);

        let test = &config.groups["test"];
        assert_eq!(test.target.as_deref(), Some(Path::new("/mnt/backups")));
        assert_eq!(test.hosts.len(), 3);
        assert_eq!(test.hosts[0].pattern(), r"r:^matching\d?$");
        match &test.hosts[2] {
            HostEntry::Detailed { host, disks, quiesce } => {
                assert_eq!(host, "web");
                assert_eq!(disks.as_deref(), Some(&["vda".to_string(), "vdb".to_string()][..]));
                assert_eq!(*quiesce, Some(true));
            }
            other => panic!("expected detailed host entry, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_merge_shallowly() {
        let (config, _) = Config::from_str(SAMPLE).unwrap();

        // group without its own packager inherits the default
        let test = &config.groups["test"];
        assert_eq!(test.packager.as_deref(), Some("tar"));
        assert_eq!(
            test.packager_opts.as_ref().and_then(|o| o.compression),
            Some(Compression::Xz)
        );
        assert_eq!(test.daily, Some(KeepCount::Count(3)));
        // group keys win over the default
        assert_eq!(test.hourly, Some(KeepCount::Count(2)));
        let other = &config.groups["other"];
        assert_eq!(other.packager.as_deref(), Some("directory"));
    }

    #[test]
    fn test_retention_policy_defaults_to_five() {
        let (config, _) = Config::from_str(SAMPLE).unwrap();
        let policy = config.groups["other"].retention_policy();
        assert_eq!(policy.hourly, KeepCount::Count(5));
    }

    #[test]
    fn test_compat_warning_for_old_compression_keys() {
        let (config, warnings) = Config::from_str(
            r#"
groups:
  legacy:
    target: /mnt
    compression: gz
    hosts: [vm]
"#,
        )
        .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(config.groups["legacy"].packager.as_deref(), Some("tar"));
        assert_eq!(
            config.groups["legacy"]
                .packager_opts
                .as_ref()
                .and_then(|o| o.compression),
            Some(Compression::Gz)
        );
    }
}

//! The write-side backup group: a set of per-domain backups built from
//! configuration, run sequentially or over a bounded worker pool.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use virtbak_core::cancel::CancelToken;
use virtbak_core::config::{GroupConfig, HostEntry};
use virtbak_core::error::{Error, GroupFailure, Result};
use virtbak_core::metadata::{PackagerKind, PackagerOpts};
use virtbak_core::pattern::split_exclusion;

use crate::backup::DomBackup;
use crate::hypervisor::{VirtConnection, VirtDomain};
use crate::snapshot::BlockJobRegistrar;

use super::run_serialized_by_key;

/// Parameters applied to every backup of a group.
#[derive(Debug, Clone, Default)]
pub struct GroupDefaults {
    pub backup_dir: Option<PathBuf>,
    pub packager_kind: Option<PackagerKind>,
    pub packager_opts: Option<PackagerOpts>,
    pub timeout: Option<Duration>,
    /// Group-wide quiesce; per-host overrides win and are never clobbered
    /// by [`BackupGroup::propagate_defaults`].
    pub quiesce: Option<bool>,
}

/// An ordered collection of pending backups for one configured group.
pub struct BackupGroup {
    pub name: String,
    pub autostart: bool,
    pub defaults: GroupDefaults,
    backups: Vec<DomBackup>,
    conn: Arc<dyn VirtConnection>,
    registrar: Arc<BlockJobRegistrar>,
}

impl BackupGroup {
    pub fn new(
        name: &str,
        conn: Arc<dyn VirtConnection>,
        registrar: Arc<BlockJobRegistrar>,
    ) -> Self {
        Self {
            name: name.to_string(),
            autostart: true,
            defaults: GroupDefaults::default(),
            backups: Vec::new(),
            conn,
            registrar,
        }
    }

    /// Build a group from its configuration: resolve host patterns against
    /// the hypervisor's domains and attach one backup per matching domain.
    pub fn from_config(
        name: &str,
        config: &GroupConfig,
        conn: Arc<dyn VirtConnection>,
        registrar: Arc<BlockJobRegistrar>,
    ) -> Result<Self> {
        let mut group = Self::new(name, conn.clone(), registrar);
        group.autostart = config.autostart();
        group.defaults = GroupDefaults {
            backup_dir: config.target.clone(),
            packager_kind: config
                .packager
                .as_deref()
                .map(|p| p.parse::<PackagerKind>())
                .transpose()?,
            packager_opts: config.packager_opts.clone(),
            timeout: config.timeout.map(Duration::from_secs),
            quiesce: config.quiesce,
        };

        let domain_names: Vec<String> = conn
            .list_all_domains()?
            .iter()
            .map(|d| d.name())
            .collect();

        let mut included: Vec<(String, Vec<String>, Option<bool>)> = Vec::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();

        for entry in &config.hosts {
            let (exclude, pattern) = split_exclusion(entry.pattern());
            let matches = matching_domains(pattern, &domain_names, &conn)?;
            if exclude {
                excluded.extend(matches);
                continue;
            }
            let (disks, quiesce) = match entry {
                HostEntry::Pattern(_) => (Vec::new(), None),
                HostEntry::Detailed { disks, quiesce, .. } => {
                    (disks.clone().unwrap_or_default(), *quiesce)
                }
            };
            for domain in matches {
                included.push((domain, disks.clone(), quiesce));
            }
        }

        for (domain, disks, quiesce) in included {
            if excluded.contains(&domain) {
                continue;
            }
            let dom = conn.lookup_by_name(&domain)?;
            group.add_domain(dom, &disks, quiesce)?;
        }

        Ok(group)
    }

    pub fn backups(&self) -> &[DomBackup] {
        &self.backups
    }

    pub fn backups_mut(&mut self) -> &mut [DomBackup] {
        &mut self.backups
    }

    /// Stop flags of every attached backup; cancelling them all cancels the
    /// group cooperatively.
    pub fn cancel_tokens(&self) -> Vec<CancelToken> {
        self.backups.iter().map(|b| b.cancel_token()).collect()
    }

    /// Add a domain. If the domain already has a backup in this group, the
    /// disk set is merged into it instead of creating a duplicate.
    pub fn add_domain(
        &mut self,
        dom: Arc<dyn VirtDomain>,
        disks: &[String],
        quiesce: Option<bool>,
    ) -> Result<()> {
        let name = dom.name();
        if let Some(existing) = self.backups.iter_mut().find(|b| b.domain_name() == name) {
            return existing.add_disks(disks);
        }

        let mut backup = DomBackup::new(dom, self.conn.clone(), self.registrar.clone());
        apply_defaults(&self.defaults, &mut backup);
        backup.quiesce = quiesce
            .or(self.defaults.quiesce)
            .unwrap_or(false);
        backup.add_disks(disks)?;
        self.backups.push(backup);
        Ok(())
    }

    /// Add a prepared backup; merged into an existing compatible one when
    /// possible.
    pub fn add_pending(&mut self, backup: DomBackup) -> Result<()> {
        for existing in &mut self.backups {
            if existing.compatible_with(&backup) {
                return existing.merge_with(&backup);
            }
        }
        self.backups.push(backup);
        Ok(())
    }

    /// Re-apply the group defaults to every attached backup.
    pub fn propagate_defaults(&mut self) {
        let defaults = self.defaults.clone();
        for backup in &mut self.backups {
            apply_defaults(&defaults, backup);
        }
    }

    /// Each backup lands in a directory named after its domain, unless its
    /// directory already is.
    fn place_in_domain_dirs(&mut self) {
        for backup in &mut self.backups {
            let domain = backup.domain_name();
            if let Some(dir) = &backup.backup_dir {
                if dir.file_name().map(|n| n.to_string_lossy().into_owned())
                    != Some(domain.clone())
                {
                    backup.backup_dir = Some(dir.join(&domain));
                }
            }
        }
    }

    /// Run every backup in order. Failures are isolated per domain and
    /// reported together once all backups had their turn.
    pub fn start(&mut self) -> Result<()> {
        self.place_in_domain_dirs();

        let mut failure = GroupFailure::default();
        for backup in &mut self.backups {
            let domain = backup.domain_name();
            match backup.start() {
                Ok(()) => failure.completed.push(domain),
                Err(e) => {
                    tracing::error!(group = %self.name, domain = %domain, error = %e, "backup failed");
                    failure.errors.insert(domain, e.to_string());
                }
            }
        }

        if failure.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::BackupsFailureInGroup(failure))
        }
    }

    /// Run up to `parallel` backups at once, never two against the same
    /// domain. Consumes the attached backups.
    pub fn start_multithread(&mut self, parallel: usize) -> Result<()> {
        self.place_in_domain_dirs();

        let items: Vec<(String, DomBackup)> = std::mem::take(&mut self.backups)
            .into_iter()
            .map(|b| (b.domain_name(), b))
            .collect();

        let results = run_serialized_by_key(items, parallel, |backup: &mut DomBackup| {
            backup.start()
        });

        let mut failure = GroupFailure::default();
        for (domain, result) in results {
            match result {
                Ok(()) => failure.completed.push(domain),
                Err(e) => {
                    tracing::error!(group = %self.name, domain = %domain, error = %e, "backup failed");
                    failure.errors.insert(domain, e.to_string());
                }
            }
        }

        if failure.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::BackupsFailureInGroup(failure))
        }
    }
}

fn apply_defaults(defaults: &GroupDefaults, backup: &mut DomBackup) {
    if let Some(dir) = &defaults.backup_dir {
        backup.backup_dir = Some(dir.clone());
    }
    if let Some(kind) = defaults.packager_kind {
        backup.packager_kind = kind;
    }
    if let Some(opts) = &defaults.packager_opts {
        backup.packager_opts = opts.clone();
    }
    if let Some(timeout) = defaults.timeout {
        backup.timeout = Some(timeout);
    }
}

/// Domains matching one sanitized pattern: `r:` regexes scan the domain
/// list, bare names go through a lookup (a miss is logged, not fatal), and
/// `g:` stays a reserved no-match.
fn matching_domains(
    pattern: &str,
    domain_names: &[String],
    conn: &Arc<dyn VirtConnection>,
) -> Result<Vec<String>> {
    if let Some(regex) = pattern.strip_prefix("r:") {
        let regex = Regex::new(&format!("^(?:{regex})"))
            .map_err(|e| Error::InvalidConfig(format!("bad host regex {regex:?}: {e}")))?;
        return Ok(domain_names
            .iter()
            .filter(|name| regex.is_match(name))
            .cloned()
            .collect());
    }
    if pattern.strip_prefix("g:").is_some() {
        return Ok(Vec::new());
    }
    match conn.lookup_by_name(pattern) {
        Ok(dom) => Ok(vec![dom.name()]),
        Err(Error::DomainNotFound(_)) => {
            tracing::error!(domain = pattern, "configured domain not found");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

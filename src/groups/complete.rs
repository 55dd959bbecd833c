//! The read-side backup group: repository scanning, queries, retention.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use virtbak_core::cancel::CancelToken;
use virtbak_core::error::{Error, Result};
use virtbak_core::metadata;
use virtbak_core::pattern::domains_matching_with_patterns;
use virtbak_core::retention::{RetentionPolicy, plan_kept};

use crate::backup::{CompleteBackup, DomBackup};
use crate::hypervisor::VirtConnection;
use crate::snapshot::BlockJobRegistrar;

/// The catalog of one group's repository directory: completed backups and
/// broken ones (a pending-info file with no finished run behind it).
pub struct CompleteBackupGroup {
    pub name: String,
    pub backup_dir: PathBuf,
    /// Host patterns filtering which domains belong to the group.
    pub hosts: Vec<String>,
    pub backups: BTreeMap<String, Vec<CompleteBackup>>,
    pub broken_backups: BTreeMap<String, Vec<DomBackup>>,
    conn: Option<Arc<dyn VirtConnection>>,
    registrar: Option<Arc<BlockJobRegistrar>>,
}

impl CompleteBackupGroup {
    /// Without a connection the group still scans completed backups, but
    /// cannot rebuild (and therefore cannot clean) broken ones.
    pub fn new(
        name: &str,
        backup_dir: &Path,
        hosts: Vec<String>,
        conn: Option<Arc<dyn VirtConnection>>,
        registrar: Option<Arc<BlockJobRegistrar>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            backup_dir: backup_dir.to_path_buf(),
            hosts,
            backups: BTreeMap::new(),
            broken_backups: BTreeMap::new(),
            conn,
            registrar,
        }
    }

    /// Walk `backup_dir/*/*.json[.pending]` and rebuild the catalog.
    /// Unreadable records are logged and skipped.
    pub fn scan(&mut self) -> Result<()> {
        self.build_backups()?;
        if self.conn.is_some() {
            self.build_broken_backups()?;
        } else {
            tracing::debug!(
                group = %self.name,
                "no hypervisor connection, not scanning for broken backups"
            );
        }
        Ok(())
    }

    fn build_backups(&mut self) -> Result<()> {
        let mut backups: BTreeMap<String, Vec<CompleteBackup>> = BTreeMap::new();

        for path in metadata_files(&self.backup_dir, ".json")? {
            let definition = match metadata::load_definition(&path) {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::debug!(file = %path.display(), error = %e, "skipping unreadable definition");
                    continue;
                }
            };
            let backup_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.backup_dir.clone());
            let backup = CompleteBackup::from_definition(definition, &backup_dir, Some(path));
            backups.entry(backup.domain_name.clone()).or_default().push(backup);
        }

        let included = domains_matching_with_patterns(
            backups.keys().map(String::as_str).collect::<Vec<_>>(),
            &self.hosts,
        )?;
        backups.retain(|domain, _| included.contains(domain));
        for domain_backups in backups.values_mut() {
            domain_backups.sort_by_key(|b| b.date);
        }

        self.backups = backups;
        Ok(())
    }

    fn build_broken_backups(&mut self) -> Result<()> {
        let (Some(conn), Some(registrar)) = (&self.conn, &self.registrar) else {
            return Ok(());
        };
        let mut broken: BTreeMap<String, Vec<(i64, DomBackup)>> = BTreeMap::new();

        for path in metadata_files(&self.backup_dir, ".json.pending")? {
            let pending = match metadata::load_pending_info(&path) {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::debug!(file = %path.display(), error = %e, "skipping unreadable pending info");
                    continue;
                }
            };
            let backup_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.backup_dir.clone());
            let domain_name = pending.domain_name.clone();
            let date = pending.date;
            match DomBackup::from_pending_info(
                pending,
                backup_dir,
                conn.clone(),
                registrar.clone(),
            ) {
                Ok(backup) => {
                    broken.entry(domain_name).or_default().push((date, backup));
                }
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %e,
                        "cannot rebuild broken backup"
                    );
                }
            }
        }

        let included = domains_matching_with_patterns(
            broken.keys().map(String::as_str).collect::<Vec<_>>(),
            &self.hosts,
        )?;
        broken.retain(|domain, _| included.contains(domain));

        self.broken_backups = broken
            .into_iter()
            .map(|(domain, mut entries)| {
                entries.sort_by_key(|(date, _)| *date);
                (domain, entries.into_iter().map(|(_, b)| b).collect())
            })
            .collect();
        Ok(())
    }

    /// The backup taken exactly at `date` (unix timestamp).
    pub fn get_backup_at_date(&self, domain: &str, date: i64) -> Result<&CompleteBackup> {
        let backups = self
            .backups
            .get(domain)
            .ok_or_else(|| Error::DomainNotFound(domain.to_string()))?;
        backups
            .iter()
            .find(|b| b.date == date)
            .ok_or(Error::BackupNotFound)
    }

    /// The `n` backups closest to `date` by absolute distance.
    pub fn get_n_nearest_backup(
        &self,
        domain: &str,
        date: i64,
        n: usize,
    ) -> Result<Vec<&CompleteBackup>> {
        let backups = self
            .backups
            .get(domain)
            .ok_or_else(|| Error::DomainNotFound(domain.to_string()))?;
        let mut by_distance: Vec<&CompleteBackup> = backups.iter().collect();
        by_distance.sort_by_key(|b| (b.date - date).abs());
        by_distance.truncate(n);
        Ok(by_distance)
    }

    /// Apply the retention policy to every domain: each period keeps the
    /// earliest backup of its last buckets, the rest are deleted. Deletion
    /// failures are logged and skipped.
    pub fn clean(&mut self, policy: &RetentionPolicy, cancel: &CancelToken) -> Result<Vec<String>> {
        let mut removed = Vec::new();

        for (domain, backups) in &mut self.backups {
            backups.sort_by_key(|b| b.date);
            let mut dates = Vec::with_capacity(backups.len());
            for backup in backups.iter() {
                dates.push(backup.date_time()?);
            }
            let kept = plan_kept(&dates, policy);

            let mut survivors = Vec::with_capacity(kept.len());
            for (i, backup) in backups.drain(..).enumerate() {
                if kept.contains(&i) {
                    survivors.push(backup);
                    continue;
                }
                tracing::info!(domain = %domain, backup = %backup.name, "removing expired backup");
                match backup.delete(cancel) {
                    Ok(()) => removed.push(backup.name.clone()),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        tracing::error!(backup = %backup.name, error = %e, "could not delete backup");
                        survivors.push(backup);
                    }
                }
            }
            *backups = survivors;
        }

        Ok(removed)
    }

    /// Clean every broken backup through its abort path. Failures are
    /// logged and skipped so the other backups still get their attempt.
    pub fn clean_broken_backups(&mut self) -> Result<Vec<String>> {
        let mut removed = Vec::new();

        for (domain, backups) in &mut self.broken_backups {
            let mut remaining = Vec::new();
            for mut backup in backups.drain(..) {
                let name = backup.name().to_string();
                match backup.clean_aborted() {
                    Ok(()) => removed.push(name),
                    Err(e) => {
                        tracing::error!(
                            domain = %domain,
                            backup = %name,
                            error = %e,
                            "could not clean broken backup"
                        );
                        remaining.push(backup);
                    }
                }
            }
            *backups = remaining;
        }
        self.broken_backups.retain(|_, backups| !backups.is_empty());

        Ok(removed)
    }
}

/// All `*<suffix>` metadata files one level below `dir` (`dir/domain/file`).
/// `.json` does not match `.json.pending`.
fn metadata_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(entry.path())? {
            let file = file?;
            let name = file.file_name().to_string_lossy().into_owned();
            if name.ends_with(suffix) {
                files.push(file.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

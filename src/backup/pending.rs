//! The per-VM backup driver (write side).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use virtbak_core::cancel::CancelToken;
use virtbak_core::domain_xml::{self, DomainDisk};
use virtbak_core::error::{Error, Result};
use virtbak_core::metadata::{
    self, Definition, PackagerKind, PackagerOpts, PendingDisk, PendingInfo,
};
use virtbak_core::naming;

use crate::hypervisor::{VirtConnection, VirtDomain};
use crate::snapshot::{BlockJobRegistrar, ExtSnapshot, SnapshotDiskRecord, SnapshotRecord};

use super::{clean_packager, packager_info, write_packager};

/// A backup of one domain, from snapshot to written definition.
///
/// One instance is single-threaded; concurrency comes from running several
/// instances, each against a distinct domain (the group orchestrator
/// enforces that).
pub struct DomBackup {
    dom: Arc<dyn VirtDomain>,
    conn: Arc<dyn VirtConnection>,
    registrar: Arc<BlockJobRegistrar>,

    /// Directory the backup's artifacts and metadata land in.
    pub backup_dir: Option<PathBuf>,
    pub packager_kind: PackagerKind,
    pub packager_opts: PackagerOpts,
    /// Bound on the wait for each block-job pivot; unset waits forever.
    pub timeout: Option<Duration>,
    /// Ask the guest agent to quiesce filesystems before the snapshot.
    pub quiesce: bool,

    disks: BTreeMap<String, DomainDisk>,
    cancel: CancelToken,
    snapshot: Option<ExtSnapshot>,
    pending_info: Option<PendingInfo>,
    name: String,
    running: bool,
}

impl DomBackup {
    pub fn new(
        dom: Arc<dyn VirtDomain>,
        conn: Arc<dyn VirtConnection>,
        registrar: Arc<BlockJobRegistrar>,
    ) -> Self {
        Self {
            dom,
            conn,
            registrar,
            backup_dir: None,
            packager_kind: PackagerKind::Tar,
            packager_opts: PackagerOpts::default(),
            timeout: None,
            quiesce: false,
            disks: BTreeMap::new(),
            cancel: CancelToken::new(),
            snapshot: None,
            pending_info: None,
            name: String::new(),
            running: false,
        }
    }

    /// Rebuild a driver for a broken backup found on disk, so it can be
    /// cleaned through [`DomBackup::clean_aborted`].
    pub fn from_pending_info(
        pending_info: PendingInfo,
        backup_dir: PathBuf,
        conn: Arc<dyn VirtConnection>,
        registrar: Arc<BlockJobRegistrar>,
    ) -> Result<Self> {
        let dom = conn.lookup_by_name(&pending_info.domain_name)?;
        let mut backup = Self::new(dom, conn, registrar);
        backup.backup_dir = Some(backup_dir);
        backup.packager_kind = pending_info.packager.kind;
        backup.packager_opts = pending_info.packager.opts.clone();
        let devs: Vec<String> = pending_info.disks.keys().cloned().collect();
        backup.add_disks(&devs)?;
        backup.name = pending_info.name.clone();
        backup.pending_info = Some(pending_info);
        Ok(backup)
    }

    pub fn domain_name(&self) -> String {
        self.dom.name()
    }

    pub fn domain_id(&self) -> i64 {
        self.dom.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn disks(&self) -> &BTreeMap<String, DomainDisk> {
        &self.disks
    }

    pub fn pending_info(&self) -> Option<&PendingInfo> {
        self.pending_info.as_ref()
    }

    /// The shared stop flag; every streaming stage of this backup polls it.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation; honored at the next buffer boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Track disks by device name; with no names given, track every
    /// file-backed disk of the domain. Unknown names fail with
    /// [`Error::DiskNotFound`].
    pub fn add_disks(&mut self, dev_disks: &[String]) -> Result<()> {
        let all_disks = domain_xml::domain_disks_of(&self.dom.xml_desc()?, &[])?;
        if dev_disks.is_empty() {
            self.disks = all_disks;
            return Ok(());
        }
        for dev in dev_disks {
            if self.disks.contains_key(dev) {
                continue;
            }
            let disk = all_disks
                .get(dev)
                .ok_or_else(|| Error::DiskNotFound(dev.clone()))?;
            self.disks.insert(dev.clone(), disk.clone());
        }
        Ok(())
    }

    /// Run the whole backup. On any failure (or a cancel observed at a
    /// buffer boundary) the partial state is cleaned through
    /// [`DomBackup::clean_aborted`] before the error is returned.
    pub fn start(&mut self) -> Result<()> {
        assert!(!self.running, "backup is already running");
        let backup_dir = self
            .backup_dir
            .clone()
            .ok_or_else(|| Error::InvalidConfig("backup directory not set".to_string()))?;
        if !backup_dir.is_dir() {
            std::fs::create_dir_all(&backup_dir)?;
        }

        tracing::info!(domain = %self.dom.name(), "backup started");
        self.running = true;
        let result = self.run(&backup_dir);
        if result.is_err() {
            if let Err(e) = self.clean_aborted() {
                tracing::warn!(
                    domain = %self.dom.name(),
                    error = %e,
                    "cleanup of the aborted backup failed"
                );
            }
        }
        self.running = false;
        result?;

        tracing::info!(domain = %self.dom.name(), "backup finished");
        Ok(())
    }

    fn run(&mut self, backup_dir: &Path) -> Result<()> {
        let mut definition = self.base_definition()?;

        let mut snapshot = ExtSnapshot::new(
            self.dom.clone(),
            self.conn.clone(),
            self.disks.clone(),
            self.registrar.clone(),
            self.timeout,
            self.quiesce,
        );
        let record = snapshot.start()?;
        self.snapshot = Some(snapshot);

        // every disk is frozen now, so this instant is the backup date
        definition.date = record.taken_at.timestamp();
        self.name = naming::backup_name(record.taken_at, self.dom.id(), &self.dom.name());
        definition.name = self.name.clone();

        self.pending_info = Some(self.build_pending_info(&definition, &record));
        self.dump_pending_info(backup_dir)?;
        metadata::write_json_pretty(
            &metadata::definition_path(backup_dir, &self.name),
            &definition,
        )?;

        let mut packager = write_packager(&definition.packager, backup_dir, &self.name)?;
        let disks = self.disks.clone();
        packager.scoped(|packager| {
            for (dev, disk) in &disks {
                let artifact = naming::disk_artifact_name(&self.name, dev, &disk.format);
                tracing::info!(domain = %self.dom.name(), %dev, "backing up disk");

                if let Some(pending) = self.pending_info.as_mut() {
                    if let Some(entry) = pending.disks.get_mut(dev) {
                        entry.target = Some(artifact.clone());
                    }
                }
                self.dump_pending_info(backup_dir)?;
                definition.disks.insert(dev.clone(), artifact.clone());

                packager.add(Path::new(&disk.src), Some(&artifact), &self.cancel)?;
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.clean_for_disk(dev)?;
                }
            }
            Ok(())
        })?;

        metadata::write_json_pretty(
            &metadata::definition_path(backup_dir, &self.name),
            &definition,
        )?;
        self.post_backup()?;
        self.clean_pending_info(backup_dir);
        Ok(())
    }

    fn base_definition(&self) -> Result<Definition> {
        Ok(Definition {
            version: virtbak_core::VERSION.to_string(),
            name: String::new(),
            domain_id: self.dom.id(),
            domain_name: self.dom.name(),
            domain_xml: Some(self.dom.xml_desc()?),
            date: 0,
            disks: BTreeMap::new(),
            packager: packager_info(self.packager_kind, &self.packager_opts),
        })
    }

    fn build_pending_info(&self, definition: &Definition, record: &SnapshotRecord) -> PendingInfo {
        let disks = record
            .disks
            .iter()
            .map(|(dev, snap)| {
                (
                    dev.clone(),
                    PendingDisk {
                        src: snap.src.clone(),
                        snapshot: snap.overlay.clone(),
                        target: None,
                        format: self.disks.get(dev).map(|d| d.format.clone()),
                    },
                )
            })
            .collect();

        PendingInfo {
            version: definition.version.clone(),
            name: self.name.clone(),
            domain_id: definition.domain_id,
            domain_name: definition.domain_name.clone(),
            domain_xml: definition.domain_xml.clone(),
            date: definition.date,
            disks,
            packager: definition.packager.clone(),
        }
    }

    /// Persist the pending info after every state change (open-write-close).
    fn dump_pending_info(&self, backup_dir: &Path) -> Result<()> {
        if let Some(pending) = &self.pending_info {
            metadata::write_json_pretty(
                &metadata::pending_info_path(backup_dir, &pending.name),
                pending,
            )?;
        }
        Ok(())
    }

    fn clean_pending_info(&mut self, backup_dir: &Path) {
        if let Some(pending) = self.pending_info.take() {
            let path = metadata::pending_info_path(backup_dir, &pending.name);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(path = %path.display(), error = %e, "could not remove pending info");
                }
            }
        }
    }

    fn post_backup(&mut self) -> Result<()> {
        if let Some(mut snapshot) = self.snapshot.take() {
            snapshot.clean()?;
        }
        Ok(())
    }

    /// Clean everything a failed or cancelled run may have left behind:
    /// reconcile the snapshots, drop this backup's artifacts, and delete the
    /// pending info. Files already gone are tolerated.
    pub fn clean_aborted(&mut self) -> Result<()> {
        self.rebuild_snapshot_from_pending_info()?;
        if let Some(mut snapshot) = self.snapshot.take() {
            if let Err(e) = snapshot.clean() {
                tracing::error!(
                    domain = %self.dom.name(),
                    error = %e,
                    "snapshot reconciliation failed during abort cleanup"
                );
            }
        }

        // without a persisted name no packager was ever created
        let named = self
            .pending_info
            .as_ref()
            .map(|p| (p.name.clone(), p.packager.clone()))
            .filter(|(name, _)| !name.is_empty());
        if let Some((name, info)) = named {
            let backup_dir = self
                .backup_dir
                .clone()
                .ok_or_else(|| Error::InvalidConfig("backup directory not set".to_string()))?;
            let targets: Vec<String> = self
                .pending_info
                .as_ref()
                .map(|p| p.disks.values().filter_map(|d| d.target.clone()).collect())
                .unwrap_or_default();

            let mut packager = write_packager(&info, &backup_dir, &name)?;
            match clean_packager(&mut packager, &targets, &self.cancel) {
                Ok(()) => {}
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!(domain = %self.dom.name(), "packager not found, nothing to clean");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(backup_dir) = self.backup_dir.clone() {
            self.clean_pending_info(&backup_dir);
        }
        Ok(())
    }

    /// A broken backup loaded from disk has no live coordinator; rebuild one
    /// from the recorded per-disk snapshot state.
    fn rebuild_snapshot_from_pending_info(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Ok(());
        }
        let Some(pending) = &self.pending_info else {
            return Ok(());
        };
        if pending.disks.is_empty() {
            return Ok(());
        }

        let mut snapshot = ExtSnapshot::new(
            self.dom.clone(),
            self.conn.clone(),
            self.disks.clone(),
            self.registrar.clone(),
            self.timeout,
            self.quiesce,
        );
        snapshot.set_record(SnapshotRecord {
            taken_at: naming::local_datetime(pending.date)?,
            disks: pending
                .disks
                .iter()
                .map(|(dev, disk)| {
                    (
                        dev.clone(),
                        SnapshotDiskRecord {
                            src: disk.src.clone(),
                            overlay: disk.snapshot.clone(),
                        },
                    )
                })
                .collect(),
        });
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Two backups can merge when they target the same domain, directory,
    /// and packager with identical options.
    pub fn compatible_with(&self, other: &DomBackup) -> bool {
        if self.dom.id() != other.dom.id() {
            return false;
        }
        if self.backup_dir != other.backup_dir || self.packager_kind != other.packager_kind {
            return false;
        }
        // canonical comparison: serialized options, keys sorted
        serde_json::to_value(&self.packager_opts).ok()
            == serde_json::to_value(&other.packager_opts).ok()
    }

    /// Union the disk sets; the timeout becomes the first one set.
    pub fn merge_with(&mut self, other: &DomBackup) -> Result<()> {
        let devs: Vec<String> = other.disks.keys().cloned().collect();
        self.add_disks(&devs)?;
        self.timeout = self.timeout.or(other.timeout);
        Ok(())
    }
}

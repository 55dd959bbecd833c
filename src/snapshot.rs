//! External snapshot and block-commit lifecycle.
//!
//! [`ExtSnapshot`] quiesces a domain's disks behind external snapshots,
//! hands the stable base images to the copy stage, and reconciles each
//! overlay back into its base afterwards: an active block commit with a
//! pivot on the READY event for running domains, an image-tool commit plus
//! a definition rewrite for stopped ones.
//!
//! The hypervisor supports a single process-wide BLOCK_JOB callback, so
//! [`BlockJobRegistrar`] multiplexes events to per-overlay callbacks.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};

use virtbak_core::domain_xml::{self, DomainDisk};
use virtbak_core::error::{Error, Result};

use crate::hypervisor::{
    BlockCommitFlags, BlockJobAbortFlags, BlockJobStatus, SnapshotFlags, UPDATE_DEVICE_MIN_VERSION,
    VirtConnection, VirtDomain, lock,
};

/// Overlay file created by an external snapshot:
/// the source path with its extension replaced by the snapshot name.
pub fn overlay_path(src: &str, snapshot_name: &str) -> String {
    let stem = Path::new(src).with_extension("");
    format!("{}.{}", stem.display(), snapshot_name)
}

/// Per-overlay callback dispatched by the registrar.
pub type PivotCallback = Arc<dyn Fn(&Arc<dyn VirtDomain>, &Path, BlockJobStatus) + Send + Sync>;

/// Multiplexer for BLOCK_JOB events.
///
/// A scoped resource: `open` registers the process-wide callback with the
/// hypervisor, `close` deregisters it. In between, overlay paths map to the
/// callback that pivots them.
pub struct BlockJobRegistrar {
    conn: Arc<dyn VirtConnection>,
    callbacks: Mutex<HashMap<PathBuf, PivotCallback>>,
    callback_id: Mutex<Option<i32>>,
}

impl BlockJobRegistrar {
    pub fn new(conn: Arc<dyn VirtConnection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            callbacks: Mutex::new(HashMap::new()),
            callback_id: Mutex::new(None),
        })
    }

    pub fn open(self: &Arc<Self>) -> Result<()> {
        let mut callback_id = lock(&self.callback_id);
        if callback_id.is_some() {
            return Err(Error::Hypervisor(
                "block job registrar is already open".to_string(),
            ));
        }
        let registrar = Arc::downgrade(self);
        let id = self
            .conn
            .register_block_job_callback(Arc::new(move |dom, path, status| {
                if let Some(registrar) = registrar.upgrade() {
                    registrar.dispatch(dom, path, status);
                }
            }))?;
        *callback_id = Some(id);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if let Some(id) = lock(&self.callback_id).take() {
            self.conn.deregister_block_job_callback(id)?;
        }
        Ok(())
    }

    pub fn register(&self, overlay: &Path, callback: PivotCallback) {
        lock(&self.callbacks).insert(overlay.to_path_buf(), callback);
    }

    pub fn deregister(&self, overlay: &Path) {
        lock(&self.callbacks).remove(overlay);
    }

    fn dispatch(&self, dom: &Arc<dyn VirtDomain>, path: &Path, status: BlockJobStatus) {
        if status != BlockJobStatus::Ready {
            if status == BlockJobStatus::Failed {
                tracing::error!(overlay = %path.display(), "block job failed");
            }
            return;
        }

        let callback = lock(&self.callbacks).get(path).cloned();
        match callback {
            Some(callback) => callback(dom, path, status),
            None => {
                tracing::error!(overlay = %path.display(), "block job event for unregistered overlay")
            }
        }
    }
}

/// One-shot latch signalled by the pivot callback.
struct PivotLatch {
    fired: Mutex<bool>,
    condvar: Condvar,
}

impl PivotLatch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn set(&self) {
        *lock(&self.fired) = true;
        self.condvar.notify_all();
    }

    /// Wait for the latch; `None` waits forever. Returns whether it fired.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut fired = lock(&self.fired);
        match timeout {
            None => {
                while !*fired {
                    fired = self
                        .condvar
                        .wait(fired)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                true
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !*fired {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .condvar
                        .wait_timeout(fired, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    fired = guard;
                }
                true
            }
        }
    }
}

/// Where one snapshot disk stands: the stable base and its overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDiskRecord {
    pub src: String,
    pub overlay: String,
}

/// State of an active snapshot; `taken_at` is the authoritative backup date.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub taken_at: DateTime<Local>,
    pub disks: BTreeMap<String, SnapshotDiskRecord>,
}

/// External snapshot coordinator for one backup.
pub struct ExtSnapshot {
    dom: Arc<dyn VirtDomain>,
    conn: Arc<dyn VirtConnection>,
    disks: BTreeMap<String, DomainDisk>,
    registrar: Arc<BlockJobRegistrar>,
    timeout: Option<Duration>,
    quiesce: bool,
    record: Option<SnapshotRecord>,
}

impl ExtSnapshot {
    pub fn new(
        dom: Arc<dyn VirtDomain>,
        conn: Arc<dyn VirtConnection>,
        disks: BTreeMap<String, DomainDisk>,
        registrar: Arc<BlockJobRegistrar>,
        timeout: Option<Duration>,
        quiesce: bool,
    ) -> Self {
        Self {
            dom,
            conn,
            disks,
            registrar,
            timeout,
            quiesce,
            record: None,
        }
    }

    pub fn record(&self) -> Option<&SnapshotRecord> {
        self.record.as_ref()
    }

    /// Attach the record of an earlier run, for cleaning an aborted backup.
    pub fn set_record(&mut self, record: SnapshotRecord) {
        self.record = Some(record);
    }

    /// Take the external snapshot. All tracked disks are frozen atomically,
    /// so the returned `taken_at` is the backup date.
    pub fn start(&mut self) -> Result<SnapshotRecord> {
        let snapshot_xml = self.snapshot_xml()?;
        let snapshot_name = self.create_snapshot(&snapshot_xml)?;
        let taken_at = Local::now();

        let disks = self
            .disks
            .iter()
            .map(|(dev, disk)| {
                (
                    dev.clone(),
                    SnapshotDiskRecord {
                        src: disk.src.clone(),
                        overlay: overlay_path(&disk.src, &snapshot_name),
                    },
                )
            })
            .collect();

        let record = SnapshotRecord { taken_at, disks };
        self.record = Some(record.clone());
        Ok(record)
    }

    fn create_snapshot(&self, snapshot_xml: &str) -> Result<String> {
        let flags = SnapshotFlags {
            disk_only: true,
            atomic: true,
            no_metadata: true,
            quiesce: self.quiesce,
        };
        match self.dom.snapshot_create_xml(snapshot_xml, flags) {
            Ok(name) => Ok(name),
            Err(e) if self.quiesce => {
                tracing::warn!(
                    domain = %self.dom.name(),
                    error = %e,
                    "quiesced snapshot failed, retrying without quiesce"
                );
                self.dom.snapshot_create_xml(
                    snapshot_xml,
                    SnapshotFlags {
                        quiesce: false,
                        ..flags
                    },
                )
            }
            Err(e) => Err(e),
        }
    }

    /// Snapshot document covering every file-backed disk of the domain.
    /// Disks outside the backup are pinned to `snapshot="no"`, otherwise the
    /// hypervisor would snapshot them too.
    fn snapshot_xml(&self) -> Result<String> {
        let all_disks = domain_xml::domain_disks_of(&self.dom.xml_desc()?, &[])?;

        let mut xml = String::from("<domainsnapshot>\n");
        xml.push_str("  <description>Pre-backup external snapshot</description>\n");
        xml.push_str("  <disks>\n");
        for dev in all_disks.keys() {
            let mode = if self.disks.contains_key(dev) {
                "external"
            } else {
                "no"
            };
            xml.push_str(&format!("    <disk name=\"{dev}\" snapshot=\"{mode}\"/>\n"));
        }
        xml.push_str("  </disks>\n</domainsnapshot>\n");
        Ok(xml)
    }

    /// Reconcile every remaining disk, then drop the per-overlay callbacks.
    /// Failures are logged per disk so the others still get their attempt;
    /// the first error is reported once the loop is done.
    pub fn clean(&mut self) -> Result<()> {
        let record = self.record.as_ref().ok_or(Error::SnapshotNotStarted)?;
        let disks: Vec<String> = record.disks.keys().cloned().collect();
        let overlays: Vec<String> = record.disks.values().map(|d| d.overlay.clone()).collect();

        let mut first_error = None;
        for disk in disks {
            if let Err(e) = self.clean_for_disk(&disk) {
                tracing::error!(
                    domain = %self.dom.name(),
                    %disk,
                    error = %e,
                    "failed to clean snapshot"
                );
                first_error.get_or_insert(e);
            }
        }

        for overlay in overlays {
            self.registrar.deregister(Path::new(&overlay));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reconcile one disk's overlay back into its base image.
    pub fn clean_for_disk(&mut self, disk: &str) -> Result<()> {
        let record = self.record.as_ref().ok_or(Error::SnapshotNotStarted)?;
        let disk_record = record
            .disks
            .get(disk)
            .ok_or_else(|| Error::DiskNotSnapshot(disk.to_string()))?;
        let overlay = disk_record.overlay.clone();
        let base = disk_record.src.clone();

        // Do not commit and pivot if our overlay is no longer the active
        // image: someone changed the domain behind our back, and committing
        // would break the backing chain.
        let current = domain_xml::current_disk_source(&self.dom.xml_desc()?, disk)?;
        if Path::new(&current) != Path::new(&overlay) {
            tracing::warn!(
                domain = %self.dom.name(),
                disk,
                %current,
                %overlay,
                "disk definition changed since the snapshot, leaving it untouched; \
                 check for leftover temporary files"
            );
            return Ok(());
        }

        if self.dom.is_active()? {
            self.blockcommit_disk(disk, &overlay)?;
        } else {
            qemu_img_commit(&base, &overlay)?;
            self.manually_pivot_disk(disk, &base)?;
            std::fs::remove_file(&overlay)?;
        }

        if let Some(record) = self.record.as_mut() {
            record.disks.remove(disk);
        }
        self.registrar.deregister(Path::new(&overlay));
        Ok(())
    }

    /// Merge the overlay into the base on a live domain and pivot back.
    /// The pivot happens in the event callback; this blocks on the latch
    /// until it fires or the timeout passes.
    fn blockcommit_disk(&self, disk: &str, overlay: &str) -> Result<()> {
        let latch = PivotLatch::new();
        let overlay_path = PathBuf::from(overlay);
        let dom_id = self.dom.id();
        let callback_latch = latch.clone();

        self.registrar.register(
            &overlay_path,
            Arc::new(move |event_dom, snap, status| {
                if status != BlockJobStatus::Ready || event_dom.id() != dom_id {
                    return;
                }
                if let Err(e) =
                    event_dom.block_job_abort(&snap.to_string_lossy(), BlockJobAbortFlags {
                        pivot: true,
                    })
                {
                    tracing::error!(overlay = %snap.display(), error = %e, "pivot failed");
                    return;
                }
                if let Err(e) = std::fs::remove_file(snap) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(overlay = %snap.display(), error = %e, "could not remove overlay");
                    }
                }
                callback_latch.set();
            }),
        );

        tracing::debug!(domain = %self.dom.name(), disk, "block commit to pivot snapshot");
        self.dom.block_commit(disk, None, None, 0, BlockCommitFlags {
            active: true,
            shallow: true,
        })?;

        if !latch.wait(self.timeout) {
            tracing::warn!(
                domain = %self.dom.name(),
                disk,
                "timed out waiting for the block job pivot"
            );
        }
        Ok(())
    }

    /// Rewrite the disk source on a stopped domain after an offline commit.
    /// Updating a single device is broken on old hypervisors, which get a
    /// full redefinition instead.
    fn manually_pivot_disk(&self, disk: &str, new_src: &str) -> Result<()> {
        let xml = self.dom.xml_desc()?;
        let patched = domain_xml::patch_disk_source(&xml, disk, new_src)?;

        if self.conn.lib_version()? >= UPDATE_DEVICE_MIN_VERSION {
            let device_xml = domain_xml::disk_block_xml_of(&patched, disk)?;
            self.dom.update_device_flags(&device_xml, true)
        } else {
            self.conn.define_xml(&patched).map(drop)
        }
    }
}

/// Merge an overlay into its base with the image tool; the hypervisor
/// cannot block-commit a stopped domain.
fn qemu_img_commit(base: &str, overlay: &str) -> Result<()> {
    let qemu_img = which::which("qemu-img")
        .map_err(|e| Error::Io(std::io::Error::other(format!("qemu-img not found: {e}"))))?;
    let status = Command::new(qemu_img)
        .args(["commit", "-b", base, overlay])
        .status()?;
    if !status.success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "qemu-img commit of {overlay} into {base} failed with {status}"
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::{MockConnection, TEST_DOMAIN_XML};

    fn setup() -> (
        tempfile::TempDir,
        Arc<MockConnection>,
        Arc<dyn VirtDomain>,
        Arc<BlockJobRegistrar>,
    ) {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("test-disk-1.qcow2"), b"disk1").unwrap();
        std::fs::write(work.path().join("test-disk-2.img"), b"disk2").unwrap();

        let conn = Arc::new(MockConnection::new());
        let dom = conn.add_domain("test", 1, TEST_DOMAIN_XML);
        dom.set_storage_basedir(work.path()).unwrap();

        let registrar = BlockJobRegistrar::new(conn.clone());
        registrar.open().unwrap();

        let dyn_dom: Arc<dyn VirtDomain> = dom;
        (work, conn, dyn_dom, registrar)
    }

    fn snapshot_for(
        conn: &Arc<MockConnection>,
        dom: &Arc<dyn VirtDomain>,
        registrar: &Arc<BlockJobRegistrar>,
        devs: &[&str],
    ) -> ExtSnapshot {
        let disks = domain_xml::domain_disks_of(&dom.xml_desc().unwrap(), devs).unwrap();
        ExtSnapshot::new(
            dom.clone(),
            conn.clone() as Arc<dyn VirtConnection>,
            disks,
            registrar.clone(),
            Some(Duration::from_secs(5)),
            false,
        )
    }

    #[test]
    fn test_overlay_path_strips_extension() {
        assert_eq!(overlay_path("/img/disk.qcow2", "snap1"), "/img/disk.snap1");
        assert_eq!(overlay_path("/img/disk", "snap1"), "/img/disk.snap1");
    }

    #[test]
    fn test_snapshot_xml_marks_untracked_disks_no() {
        let (_work, conn, dom, registrar) = setup();
        let snapshot = snapshot_for(&conn, &dom, &registrar, &["vda"]);
        let xml = snapshot.snapshot_xml().unwrap();

        assert!(xml.contains(r#"<disk name="vda" snapshot="external"/>"#));
        assert!(xml.contains(r#"<disk name="vdb" snapshot="no"/>"#));
        let vda = xml.find(r#"name="vda""#).unwrap();
        let vdb = xml.find(r#"name="vdb""#).unwrap();
        assert!(vda < vdb, "disks must be emitted in sorted order");
    }

    #[test]
    fn test_start_records_overlays_and_date() {
        let (work, conn, dom, registrar) = setup();
        let mut snapshot = snapshot_for(&conn, &dom, &registrar, &["vda", "vdb"]);

        let record = snapshot.start().unwrap();
        assert_eq!(record.disks.len(), 2);
        let vda = &record.disks["vda"];
        assert!(vda.overlay.ends_with("test-disk-1.snap1"));
        assert!(Path::new(&vda.overlay).exists());
        assert!(vda.src.starts_with(&work.path().display().to_string()));
    }

    #[test]
    fn test_clean_before_start_fails() {
        let (_work, conn, dom, registrar) = setup();
        let mut snapshot = snapshot_for(&conn, &dom, &registrar, &["vda"]);
        assert!(matches!(snapshot.clean(), Err(Error::SnapshotNotStarted)));
    }

    #[test]
    fn test_clean_for_untracked_disk_fails() {
        let (_work, conn, dom, registrar) = setup();
        let mut snapshot = snapshot_for(&conn, &dom, &registrar, &["vda"]);
        snapshot.start().unwrap();
        assert!(matches!(
            snapshot.clean_for_disk("vdb"),
            Err(Error::DiskNotSnapshot(_))
        ));
    }

    #[test]
    fn test_clean_pivots_running_domain() {
        let (_work, conn, dom, registrar) = setup();
        let mut snapshot = snapshot_for(&conn, &dom, &registrar, &["vda"]);
        let record = snapshot.start().unwrap();
        let overlay = record.disks["vda"].overlay.clone();
        let base = record.disks["vda"].src.clone();

        snapshot.clean().unwrap();

        // pivoted back to the base, overlay gone
        let current = domain_xml::current_disk_source(&dom.xml_desc().unwrap(), "vda").unwrap();
        assert_eq!(current, base);
        assert!(!Path::new(&overlay).exists());
        assert!(snapshot.record().unwrap().disks.is_empty());
    }

    #[test]
    fn test_externally_modified_disk_is_left_alone() {
        let (work, conn, dom, registrar) = setup();
        let mut snapshot = snapshot_for(&conn, &dom, &registrar, &["vda"]);
        let record = snapshot.start().unwrap();
        let overlay = record.disks["vda"].overlay.clone();

        // someone re-pointed the disk at another image behind our back
        let other = work.path().join("other.qcow2");
        std::fs::write(&other, b"other").unwrap();
        let patched = domain_xml::patch_disk_source(
            &dom.xml_desc().unwrap(),
            "vda",
            &other.to_string_lossy(),
        )
        .unwrap();
        conn.mock_domain("test").unwrap().set_xml(&patched);

        snapshot.clean().unwrap();
        // no pivot happened: overlay file still present
        assert!(Path::new(&overlay).exists());
    }

    #[test]
    fn test_quiesce_falls_back_without_flag() {
        let (_work, conn, dom, registrar) = setup();
        conn.set_fail_quiesce(true);
        let disks = domain_xml::domain_disks_of(&dom.xml_desc().unwrap(), &["vda"]).unwrap();
        let mut snapshot = ExtSnapshot::new(
            dom.clone(),
            conn.clone() as Arc<dyn VirtConnection>,
            disks,
            registrar.clone(),
            None,
            true,
        );
        // quiesced attempt fails, the fallback without the flag succeeds
        assert!(snapshot.start().is_ok());
    }
}

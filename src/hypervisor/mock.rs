//! In-memory hypervisor, the driver behind `test://` URIs.
//!
//! Mirrors libvirt's test driver: domains live in memory, external
//! snapshots rewrite the domain definition to the overlay and touch the
//! overlay file, and an active block commit delivers a READY event from a
//! separate thread, like the real event loop would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use virtbak_core::domain_xml;
use virtbak_core::error::{Error, Result};

use super::{
    BlockCommitFlags, BlockJobAbortFlags, BlockJobCallback, BlockJobStatus, DomainState,
    SnapshotFlags, VirtConnection, VirtDomain, lock,
};
use crate::snapshot::overlay_path;

/// Definition of the default `test:///default` domain.
pub const TEST_DOMAIN_XML: &str = r#"
<domain type="test" id="1">
  <name>test</name>
  <devices>
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2"/>
      <source file="/var/lib/virtbak-test/test-disk-1.qcow2"/>
      <target dev="vda" bus="virtio"/>
    </disk>
    <disk type="file" device="disk">
      <driver name="qemu" type="raw"/>
      <source file="/var/lib/virtbak-test/test-disk-2.img"/>
      <target dev="vdb" bus="virtio"/>
    </disk>
  </devices>
</domain>
"#;

pub struct MockConnection {
    domains: Mutex<Vec<Arc<MockDomain>>>,
    handler: Mutex<Option<(i32, BlockJobCallback)>>,
    next_callback_id: AtomicI32,
    lib_version: AtomicU64,
    auto_pivot: AtomicBool,
    fail_quiesce: AtomicBool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            domains: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            next_callback_id: AtomicI32::new(1),
            lib_version: AtomicU64::new(3_000_000),
            auto_pivot: AtomicBool::new(true),
            fail_quiesce: AtomicBool::new(false),
        }
    }

    /// The connection behind `test:///default`: one running domain "test".
    pub fn with_test_domain() -> Arc<Self> {
        let conn = Arc::new(Self::new());
        conn.add_domain("test", 1, TEST_DOMAIN_XML);
        conn
    }

    pub fn add_domain(self: &Arc<Self>, name: &str, id: i64, xml: &str) -> Arc<MockDomain> {
        let domain = Arc::new(MockDomain {
            conn: Arc::downgrade(self),
            inner: Mutex::new(DomainInner {
                id,
                name: name.to_string(),
                xml: xml.to_string(),
                active: true,
                backing: HashMap::new(),
                snap_counter: 0,
            }),
        });
        lock(&self.domains).push(domain.clone());
        domain
    }

    /// Deliver a BLOCK_JOB event to the registered process-wide callback.
    pub fn dispatch_block_job(&self, domain_name: &str, path: &Path, status: BlockJobStatus) {
        let domain = lock(&self.domains)
            .iter()
            .find(|d| d.name() == domain_name)
            .cloned();
        let Some(domain) = domain else {
            tracing::debug!(domain = domain_name, "block job event for unknown domain");
            return;
        };
        let callback = lock(&self.handler).as_ref().map(|(_, cb)| cb.clone());
        match callback {
            Some(callback) => callback(&(domain as Arc<dyn VirtDomain>), path, status),
            None => tracing::debug!("block job event with no registered callback"),
        }
    }

    /// Concrete handle on a domain, for tests that poke at mock state.
    pub fn mock_domain(&self, name: &str) -> Option<Arc<MockDomain>> {
        lock(&self.domains).iter().find(|d| d.name() == name).cloned()
    }

    /// Deliver a READY event after `block_commit` (default on).
    pub fn set_auto_pivot(&self, enabled: bool) {
        self.auto_pivot.store(enabled, Ordering::SeqCst);
    }

    /// Refuse snapshots that carry the quiesce flag.
    pub fn set_fail_quiesce(&self, enabled: bool) {
        self.fail_quiesce.store(enabled, Ordering::SeqCst);
    }

    pub fn set_lib_version(&self, version: u64) {
        self.lib_version.store(version, Ordering::SeqCst);
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtConnection for MockConnection {
    fn lookup_by_name(&self, name: &str) -> Result<Arc<dyn VirtDomain>> {
        lock(&self.domains)
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.clone() as Arc<dyn VirtDomain>)
            .ok_or_else(|| Error::DomainNotFound(name.to_string()))
    }

    fn list_all_domains(&self) -> Result<Vec<Arc<dyn VirtDomain>>> {
        Ok(lock(&self.domains)
            .iter()
            .map(|d| d.clone() as Arc<dyn VirtDomain>)
            .collect())
    }

    fn define_xml(&self, xml: &str) -> Result<Arc<dyn VirtDomain>> {
        let name = domain_xml::domain_name_of(xml)?;
        let domains = lock(&self.domains);
        if let Some(existing) = domains.iter().find(|d| d.name() == name) {
            lock(&existing.inner).xml = xml.to_string();
            return Ok(existing.clone() as Arc<dyn VirtDomain>);
        }
        drop(domains);

        let id = domain_xml::parse(xml)?
            .attributes
            .get("id")
            .and_then(|id| id.parse().ok())
            .unwrap_or(-1);
        // a freshly defined domain is not running
        let domain = Arc::new(MockDomain {
            conn: Weak::new(),
            inner: Mutex::new(DomainInner {
                id,
                name,
                xml: xml.to_string(),
                active: false,
                backing: HashMap::new(),
                snap_counter: 0,
            }),
        });
        lock(&self.domains).push(domain.clone());
        Ok(domain as Arc<dyn VirtDomain>)
    }

    fn lib_version(&self) -> Result<u64> {
        Ok(self.lib_version.load(Ordering::SeqCst))
    }

    fn register_block_job_callback(&self, callback: BlockJobCallback) -> Result<i32> {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        *lock(&self.handler) = Some((id, callback));
        Ok(id)
    }

    fn deregister_block_job_callback(&self, callback_id: i32) -> Result<()> {
        let mut handler = lock(&self.handler);
        match handler.take() {
            Some((id, cb)) if id != callback_id => {
                *handler = Some((id, cb));
                Err(Error::Hypervisor(format!(
                    "unknown block job callback id {callback_id}"
                )))
            }
            _ => Ok(()),
        }
    }
}

struct DomainInner {
    id: i64,
    name: String,
    xml: String,
    active: bool,
    backing: HashMap<String, String>,
    snap_counter: u64,
}

pub struct MockDomain {
    conn: Weak<MockConnection>,
    inner: Mutex<DomainInner>,
}

impl MockDomain {
    pub fn set_active(&self, active: bool) {
        lock(&self.inner).active = active;
    }

    pub fn set_xml(&self, xml: &str) {
        lock(&self.inner).xml = xml.to_string();
    }

    /// Rewrite every file-backed disk source into `dir`, keeping basenames.
    pub fn set_storage_basedir(&self, dir: &Path) -> Result<()> {
        let mut inner = lock(&self.inner);
        let disks = domain_xml::domain_disks_of(&inner.xml, &[])?;
        let mut patched = inner.xml.clone();
        for (dev, disk) in disks {
            let base = Path::new(&disk.src)
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| Error::InvalidXml(format!("disk {dev} has no file name")))?;
            let new_src = dir.join(base);
            patched = domain_xml::patch_disk_source(&patched, &dev, &new_src.to_string_lossy())?;
        }
        inner.xml = patched;
        Ok(())
    }
}

/// Disk names marked `snapshot="external"` in a `<domainsnapshot>` document.
fn external_disks_of_snapshot(xml: &str) -> Result<Vec<String>> {
    let root = domain_xml::parse(xml)?;
    let mut devs = Vec::new();
    if let Some(disks) = root.get_child("disks") {
        for node in &disks.children {
            if let xmltree::XMLNode::Element(el) = node {
                if el.name == "disk"
                    && el.attributes.get("snapshot").map(String::as_str) == Some("external")
                {
                    if let Some(name) = el.attributes.get("name") {
                        devs.push(name.clone());
                    }
                }
            }
        }
    }
    Ok(devs)
}

impl VirtDomain for MockDomain {
    fn id(&self) -> i64 {
        lock(&self.inner).id
    }

    fn name(&self) -> String {
        lock(&self.inner).name.clone()
    }

    fn xml_desc(&self) -> Result<String> {
        Ok(lock(&self.inner).xml.clone())
    }

    fn is_active(&self) -> Result<bool> {
        Ok(lock(&self.inner).active)
    }

    fn state(&self) -> Result<DomainState> {
        Ok(if lock(&self.inner).active {
            DomainState::Running
        } else {
            DomainState::Shutoff
        })
    }

    fn snapshot_create_xml(&self, xml: &str, flags: SnapshotFlags) -> Result<String> {
        if flags.quiesce {
            let fail = self
                .conn
                .upgrade()
                .is_some_and(|c| c.fail_quiesce.load(Ordering::SeqCst));
            if fail {
                return Err(Error::Hypervisor("guest agent quiesce failed".to_string()));
            }
        }

        let external = external_disks_of_snapshot(xml)?;
        let mut inner = lock(&self.inner);
        inner.snap_counter += 1;
        let snap_name = format!("snap{}", inner.snap_counter);

        let mut patched = inner.xml.clone();
        for dev in external {
            let src = domain_xml::current_disk_source(&patched, &dev)?;
            let overlay = overlay_path(&src, &snap_name);
            // like the hypervisor, materialize the overlay next to the base
            let _ = std::fs::File::create(&overlay);
            inner.backing.insert(overlay.clone(), src);
            patched = domain_xml::patch_disk_source(&patched, &dev, &overlay)?;
        }
        inner.xml = patched;

        Ok(snap_name)
    }

    fn block_commit(
        &self,
        dev: &str,
        _base: Option<&str>,
        _top: Option<&str>,
        _bandwidth: u64,
        flags: BlockCommitFlags,
    ) -> Result<()> {
        let inner = lock(&self.inner);
        if !inner.active {
            return Err(Error::Hypervisor(format!(
                "domain {} is not running",
                inner.name
            )));
        }
        let overlay = domain_xml::current_disk_source(&inner.xml, dev)?;
        let name = inner.name.clone();
        drop(inner);

        let auto_pivot = self
            .conn
            .upgrade()
            .is_some_and(|c| c.auto_pivot.load(Ordering::SeqCst));
        if flags.active && auto_pivot {
            let Some(conn) = self.conn.upgrade() else {
                return Err(Error::Hypervisor("connection closed".to_string()));
            };
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                conn.dispatch_block_job(&name, Path::new(&overlay), BlockJobStatus::Ready);
            });
        }
        Ok(())
    }

    fn block_job_abort(&self, disk: &str, flags: BlockJobAbortFlags) -> Result<()> {
        if !flags.pivot {
            return Ok(());
        }
        let mut inner = lock(&self.inner);
        let Some(base) = inner.backing.remove(disk) else {
            return Err(Error::Hypervisor(format!("no block job active on {disk}")));
        };
        let xml = inner.xml.clone();
        let disks = domain_xml::domain_disks_of(&xml, &[])?;
        let dev = disks
            .iter()
            .find(|(_, d)| d.src == disk)
            .map(|(dev, _)| dev.clone())
            .ok_or_else(|| Error::Hypervisor(format!("no disk backed by {disk}")))?;
        inner.xml = domain_xml::patch_disk_source(&xml, &dev, &base)?;
        Ok(())
    }

    fn update_device_flags(&self, device_xml: &str, _affect_config: bool) -> Result<()> {
        let device = domain_xml::parse(device_xml)?;
        let dev = device
            .get_child("target")
            .and_then(|t| t.attributes.get("dev"))
            .cloned()
            .ok_or_else(|| Error::InvalidXml("device has no target dev".to_string()))?;

        let mut inner = lock(&self.inner);
        let mut root = domain_xml::parse(&inner.xml)?;
        let devices = root
            .get_mut_child("devices")
            .ok_or_else(|| Error::InvalidXml("domain has no devices element".to_string()))?;
        let pos = devices
            .children
            .iter()
            .position(|node| {
                matches!(node, xmltree::XMLNode::Element(el)
                    if el.name == "disk"
                        && el.get_child("target")
                            .and_then(|t| t.attributes.get("dev"))
                            .map(String::as_str) == Some(dev.as_str()))
            })
            .ok_or_else(|| Error::DiskNotFound(dev.clone()))?;
        devices.children[pos] = xmltree::XMLNode::Element(device);
        inner.xml = domain_xml::element_to_string(&root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_list() {
        let conn = Arc::new(MockConnection::new());
        conn.add_domain("vm1", 1, TEST_DOMAIN_XML);
        conn.add_domain("vm2", 2, TEST_DOMAIN_XML);

        assert_eq!(conn.lookup_by_name("vm1").unwrap().name(), "vm1");
        assert!(matches!(
            conn.lookup_by_name("vm3"),
            Err(Error::DomainNotFound(_))
        ));
        assert_eq!(conn.list_all_domains().unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_rewrites_disk_sources() {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("test-disk-1.qcow2"), b"a").unwrap();
        std::fs::write(work.path().join("test-disk-2.img"), b"b").unwrap();

        let conn = Arc::new(MockConnection::new());
        let dom = conn.add_domain("test", 1, TEST_DOMAIN_XML);
        dom.set_storage_basedir(work.path()).unwrap();

        let snap_xml = r#"<domainsnapshot><disks>
            <disk name="vda" snapshot="external"/>
            <disk name="vdb" snapshot="no"/>
        </disks></domainsnapshot>"#;
        let snap = dom
            .snapshot_create_xml(snap_xml, SnapshotFlags::default())
            .unwrap();
        assert_eq!(snap, "snap1");

        let xml = dom.xml_desc().unwrap();
        let vda = domain_xml::current_disk_source(&xml, "vda").unwrap();
        assert!(vda.ends_with("test-disk-1.snap1"), "got {vda}");
        assert!(Path::new(&vda).exists());
        // vdb untouched
        let vdb = domain_xml::current_disk_source(&xml, "vdb").unwrap();
        assert!(vdb.ends_with("test-disk-2.img"));
    }

    #[test]
    fn test_pivot_restores_base_source() {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("test-disk-1.qcow2"), b"a").unwrap();
        std::fs::write(work.path().join("test-disk-2.img"), b"b").unwrap();

        let conn = Arc::new(MockConnection::new());
        let dom = conn.add_domain("test", 1, TEST_DOMAIN_XML);
        dom.set_storage_basedir(work.path()).unwrap();

        let snap_xml = r#"<domainsnapshot><disks>
            <disk name="vda" snapshot="external"/>
        </disks></domainsnapshot>"#;
        dom.snapshot_create_xml(snap_xml, SnapshotFlags::default())
            .unwrap();

        let overlay = domain_xml::current_disk_source(&dom.xml_desc().unwrap(), "vda").unwrap();
        dom.block_job_abort(&overlay, BlockJobAbortFlags { pivot: true })
            .unwrap();

        let vda = domain_xml::current_disk_source(&dom.xml_desc().unwrap(), "vda").unwrap();
        assert!(vda.ends_with("test-disk-1.qcow2"));
    }

    #[test]
    fn test_quiesce_failure_is_injectable() {
        let conn = Arc::new(MockConnection::new());
        let dom = conn.add_domain("test", 1, TEST_DOMAIN_XML);
        conn.set_fail_quiesce(true);

        let snap_xml = "<domainsnapshot><disks/></domainsnapshot>";
        let flags = SnapshotFlags {
            quiesce: true,
            ..Default::default()
        };
        assert!(dom.snapshot_create_xml(snap_xml, flags).is_err());
        // without the flag the snapshot goes through
        assert!(
            dom.snapshot_create_xml(snap_xml, SnapshotFlags::default())
                .is_ok()
        );
    }

    #[test]
    fn test_block_job_events_reach_registered_callback() {
        let conn = Arc::new(MockConnection::new());
        conn.add_domain("test", 1, TEST_DOMAIN_XML);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = conn
            .register_block_job_callback(Arc::new(move |dom, path, status| {
                lock(&sink).push((dom.name(), path.to_path_buf(), status));
            }))
            .unwrap();

        conn.dispatch_block_job("test", Path::new("/x/overlay"), BlockJobStatus::Ready);
        assert_eq!(lock(&seen).len(), 1);
        assert_eq!(lock(&seen)[0].0, "test");

        conn.deregister_block_job_callback(id).unwrap();
        conn.dispatch_block_job("test", Path::new("/x/overlay"), BlockJobStatus::Ready);
        assert_eq!(lock(&seen).len(), 1);
    }
}

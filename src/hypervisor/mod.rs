//! Hypervisor contract.
//!
//! The backup core only ever talks to these traits. A production deployment
//! plugs in a libvirt-backed implementation; this build ships the `test://`
//! driver (mirroring libvirt's own test driver) so every flow can be driven
//! end to end without a hypervisor.

pub mod mock;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use virtbak_core::error::{Error, Result};

/// Lock a mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Domain lifecycle state, reduced to what the backup flows care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    Shutoff,
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotFlags {
    pub disk_only: bool,
    pub atomic: bool,
    pub no_metadata: bool,
    pub quiesce: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockCommitFlags {
    pub active: bool,
    pub shallow: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockJobAbortFlags {
    pub pivot: bool,
}

/// Block-job event status, as delivered by the hypervisor event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockJobStatus {
    Ready,
    Failed,
    Other,
}

/// Process-wide block-job event callback: `(domain, disk-or-overlay, status)`.
pub type BlockJobCallback =
    Arc<dyn Fn(&Arc<dyn VirtDomain>, &Path, BlockJobStatus) + Send + Sync>;

/// Threshold above which disk definitions are updated through
/// `updateDeviceFlags`; older hypervisors go through a full `defineXML`.
pub const UPDATE_DEVICE_MIN_VERSION: u64 = 3_000_000;

/// One virtualization guest.
pub trait VirtDomain: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> String;
    fn xml_desc(&self) -> Result<String>;
    fn is_active(&self) -> Result<bool>;
    fn state(&self) -> Result<DomainState>;

    /// Create a snapshot from a `<domainsnapshot>` document; returns the
    /// snapshot's name.
    fn snapshot_create_xml(&self, xml: &str, flags: SnapshotFlags) -> Result<String>;

    fn block_commit(
        &self,
        dev: &str,
        base: Option<&str>,
        top: Option<&str>,
        bandwidth: u64,
        flags: BlockCommitFlags,
    ) -> Result<()>;

    /// `disk` may be a device name or the path of the active image.
    fn block_job_abort(&self, disk: &str, flags: BlockJobAbortFlags) -> Result<()>;

    /// Update one device definition; `affect_config` persists the change.
    fn update_device_flags(&self, device_xml: &str, affect_config: bool) -> Result<()>;
}

/// A hypervisor connection, shared between threads.
pub trait VirtConnection: Send + Sync {
    fn lookup_by_name(&self, name: &str) -> Result<Arc<dyn VirtDomain>>;
    fn list_all_domains(&self) -> Result<Vec<Arc<dyn VirtDomain>>>;
    fn define_xml(&self, xml: &str) -> Result<Arc<dyn VirtDomain>>;
    fn lib_version(&self) -> Result<u64>;

    /// Register the process-wide BLOCK_JOB callback; returns the
    /// registration id to pass to [`Self::deregister_block_job_callback`].
    fn register_block_job_callback(&self, callback: BlockJobCallback) -> Result<i32>;
    fn deregister_block_job_callback(&self, callback_id: i32) -> Result<()>;

    /// Start the driver's event loop. Drivers that deliver events inline
    /// return a no-op handle.
    fn start_event_loop(&self) -> Result<EventLoopHandle> {
        Ok(EventLoopHandle::inline())
    }
}

/// Owned handle on a running event loop; the loop stops when the handle is
/// stopped or dropped.
pub struct EventLoopHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl EventLoopHandle {
    /// For drivers that deliver events inline, with no loop thread.
    pub fn inline() -> Self {
        Self { stop: None }
    }

    pub fn with_stop(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for EventLoopHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// Open a connection for a hypervisor URI.
///
/// Only the built-in test driver is compiled into this build; a libvirt
/// driver is an external integration point.
pub fn connect(uri: &str) -> Result<Arc<dyn VirtConnection>> {
    if uri == "test:///default" {
        return Ok(mock::MockConnection::with_test_domain());
    }
    if uri.starts_with("test://") {
        return Ok(Arc::new(mock::MockConnection::new()));
    }
    Err(Error::UnsupportedUri(uri.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_test_driver() {
        let conn = connect("test:///default").unwrap();
        assert!(conn.lookup_by_name("test").is_ok());
        assert!(conn.lib_version().unwrap() >= UPDATE_DEVICE_MIN_VERSION);
    }

    #[test]
    fn test_connect_unknown_uri() {
        assert!(matches!(
            connect("qemu:///system"),
            Err(Error::UnsupportedUri(_))
        ));
    }

    #[test]
    fn test_event_loop_handle_runs_stop_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = EventLoopHandle::with_stop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

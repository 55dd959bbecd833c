//! The read side of a finished backup: restores and deletion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};

use virtbak_core::cancel::CancelToken;
use virtbak_core::domain_xml;
use virtbak_core::error::{Error, Result};
use virtbak_core::metadata::{Definition, PackagerInfo};
use virtbak_core::naming;

use virtbak_storage::ReadPackager;

use crate::hypervisor::{UPDATE_DEVICE_MIN_VERSION, VirtConnection, VirtDomain};

use super::{clean_packager, read_packager, write_packager};

/// A completed backup, built from its definition record.
#[derive(Debug, Clone)]
pub struct CompleteBackup {
    pub name: String,
    pub domain_name: String,
    pub backup_dir: PathBuf,
    /// Unix timestamp of the snapshot instant.
    pub date: i64,
    pub domain_xml: Option<String>,
    /// `dev -> artifact name` as stored by the packager.
    pub disks: BTreeMap<String, String>,
    pub packager: PackagerInfo,
    /// Set when the backup was discovered on disk.
    pub definition_path: Option<PathBuf>,
}

impl CompleteBackup {
    pub fn from_definition(
        definition: Definition,
        backup_dir: &Path,
        definition_path: Option<PathBuf>,
    ) -> Self {
        Self {
            name: definition.name,
            domain_name: definition.domain_name,
            backup_dir: backup_dir.to_path_buf(),
            date: definition.date,
            domain_xml: definition.domain_xml,
            disks: definition.disks,
            packager: definition.packager,
            definition_path,
        }
    }

    pub fn date_time(&self) -> Result<DateTime<Local>> {
        naming::local_datetime(self.date)
    }

    fn reader(&self) -> Result<ReadPackager> {
        read_packager(&self.packager, &self.backup_dir, &self.name)
    }

    fn stored_domain_xml(&self) -> Result<&str> {
        self.domain_xml
            .as_deref()
            .ok_or_else(|| Error::InvalidMetadata(format!("backup {} has no domain XML", self.name)))
    }

    /// Restore the whole backup into a directory: every disk under its
    /// original basename, plus the domain XML next to them.
    pub fn restore_to(&self, target: &Path, cancel: &CancelToken) -> Result<()> {
        if !target.is_dir() {
            std::fs::create_dir_all(target)?;
        }

        let dom_xml = self.stored_domain_xml()?;
        let sources = domain_xml::domain_disks_of(dom_xml, &[])?;
        for dev in self.disks.keys() {
            let source = sources
                .get(dev)
                .ok_or_else(|| Error::DiskNotFound(dev.clone()))?;
            let original_name = Path::new(&source.src)
                .file_name()
                .ok_or_else(|| Error::InvalidXml(format!("disk {dev} has no file name")))?;
            self.restore_disk_to(dev, &target.join(original_name), cancel)?;
        }

        std::fs::write(
            target.join(format!("{}.xml", self.domain_name)),
            dom_xml,
        )?;
        Ok(())
    }

    /// Restore one disk; `target` may be a file path or a directory.
    pub fn restore_disk_to(&self, dev: &str, target: &Path, cancel: &CancelToken) -> Result<PathBuf> {
        let artifact = self
            .disks
            .get(dev)
            .ok_or_else(|| Error::DiskNotFound(dev.to_string()))?
            .clone();
        let mut packager = self.reader()?;
        packager.scoped(|p| p.restore(&artifact, target, cancel))
    }

    /// Restore a disk over `target_dev` of an existing, stopped domain and
    /// carry the stored `<driver>` element over so the image format matches.
    pub fn restore_and_replace_disk_of(
        &self,
        dev: &str,
        target_dom: &Arc<dyn VirtDomain>,
        target_dev: &str,
        conn: &Arc<dyn VirtConnection>,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        if target_dom.is_active()? {
            return Err(Error::DomainRunning(target_dom.name()));
        }

        let target_xml = target_dom.xml_desc()?;
        let target_disks = domain_xml::domain_disks_of(&target_xml, &[target_dev])?;
        let replaced_path = target_disks
            .get(target_dev)
            .map(|d| d.src.clone())
            .ok_or_else(|| Error::DiskNotFound(target_dev.to_string()))?;

        // the old image is being replaced wholesale
        if let Err(e) = std::fs::remove_file(&replaced_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        let restored = self.restore_disk_to(dev, Path::new(&replaced_path), cancel)?;

        let patched =
            domain_xml::replace_disk_driver(&target_xml, target_dev, self.stored_domain_xml()?, dev)?;
        if conn.lib_version()? >= UPDATE_DEVICE_MIN_VERSION {
            let device_xml = domain_xml::disk_block_xml_of(&patched, target_dev)?;
            target_dom.update_device_flags(&device_xml, true)?;
        } else {
            conn.define_xml(&patched)?;
        }
        Ok(restored)
    }

    /// Define the stored domain again, optionally under another id.
    pub fn restore_replace_domain(
        &self,
        conn: &Arc<dyn VirtConnection>,
        id: Option<i64>,
    ) -> Result<()> {
        let dom_xml = self.stored_domain_xml()?;
        let dom_xml = match id {
            Some(id) => domain_xml::set_domain_id(dom_xml, id)?,
            None => dom_xml.to_string(),
        };
        conn.define_xml(&dom_xml)?;
        Ok(())
    }

    /// Delete the backup: its artifacts (or the whole package when nothing
    /// else shares it) and its definition file.
    pub fn delete(&self, cancel: &CancelToken) -> Result<()> {
        let artifacts: Vec<String> = self.disks.values().cloned().collect();
        let mut packager = write_packager(&self.packager, &self.backup_dir, &self.name)?;
        clean_packager(&mut packager, &artifacts, cancel)?;

        if let Some(path) = &self.definition_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

//! Plain-directory packager: one file per artifact, stored flat.
//!
//! Shareable: several backups may keep their artifacts side by side in the
//! same directory, which is why `remove_package` is reserved for the case
//! where nothing else is left.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use virtbak_core::cancel::CancelToken;
use virtbak_core::error::{Error, Result};

use super::{artifact_name, ensure_closed, ensure_opened};
use crate::stream::{copy_cancellable, remove_partial, resolve_restore_target};

pub struct DirectoryPackager {
    log_name: String,
    path: PathBuf,
    opened: bool,
}

impl DirectoryPackager {
    pub fn new(log_name: &str, path: &Path) -> Self {
        Self {
            log_name: log_name.to_string(),
            path: path.to_path_buf(),
            opened: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&mut self) -> Result<()> {
        ensure_closed(self.opened)?;
        if !self.path.is_dir() {
            std::fs::create_dir_all(&self.path)?;
        }
        self.opened = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        ensure_opened(self.opened)?;
        self.opened = false;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        ensure_opened(self.opened)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            entries.push(entry?.file_name().to_string_lossy().into_owned());
        }
        entries.sort();
        Ok(entries)
    }

    pub fn add(&mut self, src: &Path, name: Option<&str>, cancel: &CancelToken) -> Result<PathBuf> {
        ensure_opened(self.opened)?;
        let name = artifact_name(src, name)?;
        let target = self.path.join(&name);
        tracing::debug!(packager = %self.log_name, src = %src.display(), target = %target.display(), "copy artifact");

        copy_into(src, &target, cancel)
    }

    pub fn restore(&self, name: &str, target: &Path, cancel: &CancelToken) -> Result<PathBuf> {
        ensure_opened(self.opened)?;
        let src = self.path.join(name);
        if !src.exists() {
            return Err(Error::ImageNotFound {
                name: name.to_string(),
                location: self.path.display().to_string(),
            });
        }
        let target = resolve_restore_target(target, name)?;
        tracing::debug!(packager = %self.log_name, src = %src.display(), target = %target.display(), "restore artifact");

        copy_into(&src, &target, cancel)
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        ensure_opened(self.opened)?;
        std::fs::remove_file(self.path.join(name))?;
        Ok(())
    }

    /// Delete the directory tree. Atomic with respect to cancellation:
    /// either the tree goes away or the error is reported wholesale.
    pub fn remove_package(&mut self, _cancel: &CancelToken) -> Result<()> {
        ensure_closed(self.opened)?;
        std::fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

/// Exclusive-create copy; the destination is removed on error or cancel.
fn copy_into(src: &Path, target: &Path, cancel: &CancelToken) -> Result<PathBuf> {
    let mut reader = File::open(src)?;
    let mut writer = OpenOptions::new().write(true).create_new(true).open(target)?;
    match copy_cancellable(&mut reader, &mut writer, cancel) {
        Ok(_) => Ok(target.to_path_buf()),
        Err(e) => {
            drop(writer);
            remove_partial(target);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_add_list_restore_roundtrip() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "disk.qcow2", b"disk-bytes");
        let cancel = CancelToken::new();

        let mut packager = DirectoryPackager::new("test", &store);
        packager.open().unwrap();
        packager.add(&src, Some("bak_vda.qcow2"), &cancel).unwrap();
        assert_eq!(packager.list().unwrap(), vec!["bak_vda.qcow2"]);

        let restored = packager
            .restore("bak_vda.qcow2", &work.path().join("restored.qcow2"), &cancel)
            .unwrap();
        assert_eq!(std::fs::read(restored).unwrap(), b"disk-bytes");
        packager.close().unwrap();
    }

    #[test]
    fn test_operations_require_open() {
        let work = tempfile::tempdir().unwrap();
        let mut packager = DirectoryPackager::new("test", work.path());
        assert!(matches!(packager.list(), Err(Error::PackagerNotOpened)));
        assert!(matches!(
            packager.remove("x"),
            Err(Error::PackagerNotOpened)
        ));
    }

    #[test]
    fn test_double_open_fails() {
        let work = tempfile::tempdir().unwrap();
        let mut packager = DirectoryPackager::new("test", &work.path().join("s"));
        packager.open().unwrap();
        assert!(matches!(packager.open(), Err(Error::PackagerOpened)));
    }

    #[test]
    fn test_cancelled_add_leaves_no_destination() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "disk.qcow2", &vec![1u8; 64]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut packager = DirectoryPackager::new("test", &store);
        packager.open().unwrap();
        let err = packager.add(&src, Some("bak"), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!store.join("bak").exists());
    }

    #[test]
    fn test_restore_missing_artifact() {
        let work = tempfile::tempdir().unwrap();
        let mut packager = DirectoryPackager::new("test", work.path());
        packager.open().unwrap();
        let err = packager
            .restore("nope", work.path(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { .. }));
    }

    #[test]
    fn test_remove_and_remove_package() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "a", b"a");
        let cancel = CancelToken::new();

        let mut packager = DirectoryPackager::new("test", &store);
        packager.open().unwrap();
        packager.add(&src, None, &cancel).unwrap();
        packager.remove("a").unwrap();
        assert!(packager.list().unwrap().is_empty());

        assert!(matches!(
            packager.remove_package(&cancel),
            Err(Error::PackagerOpened)
        ));
        packager.close().unwrap();
        packager.remove_package(&cancel).unwrap();
        assert!(!store.exists());
    }
}

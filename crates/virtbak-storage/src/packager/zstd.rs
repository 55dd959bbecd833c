//! Zstd packager: one compressed file per artifact, named
//! `<prefix>_<artifact>.zst` and stored flat next to other backups.
//!
//! Shareable; discovery goes through the prefix, so `remove_package` only
//! touches this backup's files and leaves unrelated `.zst` files alone.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use regex::Regex;

use virtbak_core::cancel::CancelToken;
use virtbak_core::error::{Error, Result};
use virtbak_core::metadata::PackagerOpts;

use super::{artifact_name, ensure_closed, ensure_opened};
use crate::stream::{copy_cancellable, remove_partial, resolve_restore_target};

pub struct ZstdPackager {
    log_name: String,
    path: PathBuf,
    prefix: String,
    compression_lvl: Option<i64>,
    threads: Option<u32>,
    opened: bool,
}

impl ZstdPackager {
    pub fn new(log_name: &str, path: &Path, prefix: &str, opts: &PackagerOpts) -> Self {
        Self {
            log_name: log_name.to_string(),
            path: path.to_path_buf(),
            prefix: prefix.to_string(),
            compression_lvl: opts.compression_lvl,
            threads: opts.threads,
            opened: false,
        }
    }

    /// Path the archive for `name` would live at; does not check existence.
    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{}_{}.zst", self.prefix, name))
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

    /// Artifact names and paths discovered through the prefix.
    fn matching_files(&self) -> Result<Vec<(String, PathBuf)>> {
        if !self.path.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = Regex::new(&format!(r"^{}_(.*)\.zst$", regex::escape(&self.prefix)))
            .map_err(|e| Error::InvalidMetadata(e.to_string()))?;

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(captures) = pattern.captures(&file_name) {
                if let Some(artifact) = captures.get(1) {
                    found.push((artifact.as_str().to_string(), entry.path()));
                }
            }
        }
        found.sort();
        Ok(found)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        ensure_opened(self.opened)?;
        Ok(self.matching_files()?.into_iter().map(|(name, _)| name).collect())
    }

    pub fn add(&mut self, src: &Path, name: Option<&str>, cancel: &CancelToken) -> Result<PathBuf> {
        ensure_opened(self.opened)?;
        cancel.check()?;

        let name = artifact_name(src, name)?;
        let target = self.archive_path(&name);
        tracing::debug!(packager = %self.log_name, src = %src.display(), target = %target.display(), "compress artifact");

        let mut reader = File::open(src)?;
        let result = (|| -> Result<()> {
            let file = File::create(&target)?;
            let mut encoder =
                ::zstd::stream::write::Encoder::new(file, self.compression_lvl.unwrap_or(0) as i32)?;
            if let Some(threads) = self.threads {
                encoder.multithread(threads)?;
            }
            copy_cancellable(&mut reader, &mut encoder, cancel)?;
            encoder.finish()?.flush()?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(target),
            Err(e) => {
                remove_partial(&target);
                Err(e)
            }
        }
    }

    pub fn restore(&self, name: &str, target: &Path, cancel: &CancelToken) -> Result<PathBuf> {
        ensure_opened(self.opened)?;
        let archive = self.archive_path(name);
        if !archive.is_file() {
            return Err(Error::ImageNotFound {
                name: name.to_string(),
                location: self.path.display().to_string(),
            });
        }

        let target = resolve_restore_target(target, name)?;
        if target.exists() {
            return Err(Error::ImageExists(target));
        }
        tracing::debug!(packager = %self.log_name, artifact = name, target = %target.display(), "decompress artifact");

        let mut decoder = ::zstd::stream::read::Decoder::new(File::open(&archive)?)?;
        let mut writer = File::create(&target)?;
        match copy_cancellable(&mut decoder, &mut writer, cancel) {
            Ok(_) => Ok(target),
            Err(e) => {
                drop(writer);
                remove_partial(&target);
                Err(e)
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        ensure_opened(self.opened)?;
        let archive = self.archive_path(name);
        if !archive.is_file() {
            return Err(Error::ImageNotFound {
                name: name.to_string(),
                location: self.path.display().to_string(),
            });
        }
        std::fs::remove_file(archive)?;
        Ok(())
    }

    /// Remove every file carrying this backup's prefix; unrelated archives
    /// in the same directory are preserved.
    pub fn remove_package(&mut self, cancel: &CancelToken) -> Result<()> {
        ensure_closed(self.opened)?;
        for (_, path) in self.matching_files()? {
            cancel.check()?;
            std::fs::remove_file(path)?;
        }
        Ok(())
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

    fn packager(store: &Path, prefix: &str) -> ZstdPackager {
        ZstdPackager::new("t", store, prefix, &PackagerOpts::default())
    }

    #[test]
    fn test_roundtrip() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "disk.qcow2", b"zstd-disk-bytes");
        let cancel = CancelToken::new();

        let mut p = packager(&store, "20160815-171013_1_test");
        p.open().unwrap();
        let archive = p.add(&src, Some("bak_vda.qcow2"), &cancel).unwrap();
        assert_eq!(
            archive,
            store.join("20160815-171013_1_test_bak_vda.qcow2.zst")
        );
        assert_eq!(p.list().unwrap(), vec!["bak_vda.qcow2"]);

        let restored = p
            .restore("bak_vda.qcow2", &work.path().join("restored"), &cancel)
            .unwrap();
        assert_eq!(std::fs::read(restored).unwrap(), b"zstd-disk-bytes");
        p.close().unwrap();
    }

    #[test]
    fn test_list_ignores_other_prefixes() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "disk", b"x");
        let cancel = CancelToken::new();

        let mut mine = packager(&store, "backup-a");
        let mut other = packager(&store, "backup-b");
        mine.open().unwrap();
        other.open().unwrap();
        mine.add(&src, Some("vda"), &cancel).unwrap();
        other.add(&src, Some("vdb"), &cancel).unwrap();

        assert_eq!(mine.list().unwrap(), vec!["vda"]);
        assert_eq!(other.list().unwrap(), vec!["vdb"]);
    }

    #[test]
    fn test_restore_refuses_existing_target() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "disk", b"x");
        let existing = fixture(work.path(), "already-there", b"y");
        let cancel = CancelToken::new();

        let mut p = packager(&store, "backup");
        p.open().unwrap();
        p.add(&src, Some("vda"), &cancel).unwrap();
        assert!(matches!(
            p.restore("vda", &existing, &cancel),
            Err(Error::ImageExists(_))
        ));
    }

    #[test]
    fn test_remove_package_preserves_unrelated_archives() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "disk", b"x");
        let cancel = CancelToken::new();

        let mut mine = packager(&store, "backup-a");
        let mut other = packager(&store, "backup-b");
        mine.open().unwrap();
        other.open().unwrap();
        mine.add(&src, Some("vda"), &cancel).unwrap();
        other.add(&src, Some("vdb"), &cancel).unwrap();
        mine.close().unwrap();

        mine.remove_package(&cancel).unwrap();
        assert!(!store.join("backup-a_vda.zst").exists());
        assert!(store.join("backup-b_vdb.zst").exists());
    }

    #[test]
    fn test_cancelled_add_leaves_no_destination() {
        let work = tempfile::tempdir().unwrap();
        let store = work.path().join("store");
        let src = fixture(work.path(), "disk", &vec![5u8; 4096]);
        let cancel = CancelToken::new();

        let mut p = packager(&store, "backup");
        p.open().unwrap();
        cancel.cancel();
        assert!(matches!(
            p.add(&src, Some("vda"), &cancel),
            Err(Error::Cancelled)
        ));
        assert!(!store.join("backup_vda.zst").exists());
    }

    #[test]
    fn test_remove_missing_artifact() {
        let work = tempfile::tempdir().unwrap();
        let mut p = packager(&work.path().join("store"), "backup");
        p.open().unwrap();
        assert!(matches!(
            p.remove("nope"),
            Err(Error::ImageNotFound { .. })
        ));
    }
}

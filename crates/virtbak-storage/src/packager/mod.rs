//! Packager variants and their capability surfaces.
//!
//! Each variant is a concrete struct; the [`ReadPackager`] and
//! [`WritePackager`] enums are the two capability sets over them. All
//! operations other than `remove_package` require the packager to be opened
//! first; `open`/`close` violations surface as [`Error::PackagerOpened`] /
//! [`Error::PackagerNotOpened`]. `remove_package` is a package-level
//! operation and is only valid on a closed packager.

pub mod directory;
pub mod tar;
#[cfg(feature = "zstd")]
pub mod zstd;

use std::path::{Path, PathBuf};

use virtbak_core::cancel::CancelToken;
use virtbak_core::error::{Error, Result};
use virtbak_core::metadata::{PackagerKind, PackagerOpts};

pub(crate) fn ensure_opened(opened: bool) -> Result<()> {
    if opened { Ok(()) } else { Err(Error::PackagerNotOpened) }
}

/// Artifact name for an add: explicit name, or the source file's basename.
pub(crate) fn artifact_name(src: &Path, name: Option<&str>) -> Result<String> {
    match name {
        Some(name) => Ok(name.to_string()),
        None => src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidMetadata(format!("no file name in {}", src.display()))),
    }
}

pub(crate) fn ensure_closed(opened: bool) -> Result<()> {
    if opened { Err(Error::PackagerOpened) } else { Ok(()) }
}

/// Read capability over a backup's container.
pub enum ReadPackager {
    Directory(directory::DirectoryPackager),
    Tar(tar::TarReadPackager),
    #[cfg(feature = "zstd")]
    Zstd(zstd::ZstdPackager),
}

/// Write capability over a backup's container.
pub enum WritePackager {
    Directory(directory::DirectoryPackager),
    Tar(tar::TarWritePackager),
    #[cfg(feature = "zstd")]
    Zstd(zstd::ZstdPackager),
}

#[cfg(not(feature = "zstd"))]
fn zstd_unsupported() -> Error {
    Error::unsupported_packager("zstd", "zstd support is not compiled in")
}

impl ReadPackager {
    /// Build the read side for backup `name` stored under `backup_dir`.
    pub fn build(
        kind: PackagerKind,
        log_name: &str,
        backup_dir: &Path,
        name: &str,
        opts: &PackagerOpts,
    ) -> Result<Self> {
        match kind {
            PackagerKind::Directory => Ok(ReadPackager::Directory(
                directory::DirectoryPackager::new(log_name, backup_dir),
            )),
            PackagerKind::Tar => Ok(ReadPackager::Tar(tar::TarReadPackager::new(
                log_name, backup_dir, name, opts,
            ))),
            #[cfg(feature = "zstd")]
            PackagerKind::Zstd => Ok(ReadPackager::Zstd(zstd::ZstdPackager::new(
                log_name, backup_dir, name, opts,
            ))),
            #[cfg(not(feature = "zstd"))]
            PackagerKind::Zstd => Err(zstd_unsupported()),
        }
    }

    pub fn kind(&self) -> PackagerKind {
        match self {
            ReadPackager::Directory(_) => PackagerKind::Directory,
            ReadPackager::Tar(_) => PackagerKind::Tar,
            #[cfg(feature = "zstd")]
            ReadPackager::Zstd(_) => PackagerKind::Zstd,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        match self {
            ReadPackager::Directory(p) => p.open(),
            ReadPackager::Tar(p) => p.open(),
            #[cfg(feature = "zstd")]
            ReadPackager::Zstd(p) => p.open(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            ReadPackager::Directory(p) => p.close(),
            ReadPackager::Tar(p) => p.close(),
            #[cfg(feature = "zstd")]
            ReadPackager::Zstd(p) => p.close(),
        }
    }

    pub fn list(&self) -> Result<Vec<String>> {
        match self {
            ReadPackager::Directory(p) => p.list(),
            ReadPackager::Tar(p) => p.list(),
            #[cfg(feature = "zstd")]
            ReadPackager::Zstd(p) => p.list(),
        }
    }

    /// Restore one artifact to `target`, returning the written path.
    pub fn restore(&self, name: &str, target: &Path, cancel: &CancelToken) -> Result<PathBuf> {
        match self {
            ReadPackager::Directory(p) => p.restore(name, target, cancel),
            ReadPackager::Tar(p) => p.restore(name, target, cancel),
            #[cfg(feature = "zstd")]
            ReadPackager::Zstd(p) => p.restore(name, target, cancel),
        }
    }

    /// Run `f` inside an open/close pair; `close` runs on every exit path.
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.open()?;
        let result = f(self);
        let closed = self.close();
        match result {
            Ok(value) => closed.map(|_| value),
            Err(e) => {
                if let Err(close_err) = closed {
                    tracing::warn!(error = %close_err, "packager close failed after error");
                }
                Err(e)
            }
        }
    }
}

impl WritePackager {
    /// Build the write side for backup `name` stored under `backup_dir`.
    pub fn build(
        kind: PackagerKind,
        log_name: &str,
        backup_dir: &Path,
        name: &str,
        opts: &PackagerOpts,
    ) -> Result<Self> {
        match kind {
            PackagerKind::Directory => Ok(WritePackager::Directory(
                directory::DirectoryPackager::new(log_name, backup_dir),
            )),
            PackagerKind::Tar => Ok(WritePackager::Tar(tar::TarWritePackager::new(
                log_name, backup_dir, name, opts,
            ))),
            #[cfg(feature = "zstd")]
            PackagerKind::Zstd => Ok(WritePackager::Zstd(zstd::ZstdPackager::new(
                log_name, backup_dir, name, opts,
            ))),
            #[cfg(not(feature = "zstd"))]
            PackagerKind::Zstd => Err(zstd_unsupported()),
        }
    }

    pub fn kind(&self) -> PackagerKind {
        match self {
            WritePackager::Directory(_) => PackagerKind::Directory,
            WritePackager::Tar(_) => PackagerKind::Tar,
            #[cfg(feature = "zstd")]
            WritePackager::Zstd(_) => PackagerKind::Zstd,
        }
    }

    pub fn is_shareable(&self) -> bool {
        self.kind().is_shareable()
    }

    pub fn open(&mut self) -> Result<()> {
        match self {
            WritePackager::Directory(p) => p.open(),
            WritePackager::Tar(p) => p.open(),
            #[cfg(feature = "zstd")]
            WritePackager::Zstd(p) => p.open(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            WritePackager::Directory(p) => p.close(),
            WritePackager::Tar(p) => p.close(),
            #[cfg(feature = "zstd")]
            WritePackager::Zstd(p) => p.close(),
        }
    }

    pub fn list(&self) -> Result<Vec<String>> {
        match self {
            WritePackager::Directory(p) => p.list(),
            WritePackager::Tar(p) => p.list(),
            #[cfg(feature = "zstd")]
            WritePackager::Zstd(p) => p.list(),
        }
    }

    /// Store `src` as artifact `name` (source basename when unset).
    /// Returns the path the artifact lives at inside the package.
    pub fn add(&mut self, src: &Path, name: Option<&str>, cancel: &CancelToken) -> Result<PathBuf> {
        match self {
            WritePackager::Directory(p) => p.add(src, name, cancel),
            WritePackager::Tar(p) => p.add(src, name, cancel),
            #[cfg(feature = "zstd")]
            WritePackager::Zstd(p) => p.add(src, name, cancel),
        }
    }

    /// Remove one artifact. Only shareable packagers support this.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        match self {
            WritePackager::Directory(p) => p.remove(name),
            WritePackager::Tar(_) => Err(Error::unsupported_packager(
                "tar",
                "tar archives cannot drop single entries",
            )),
            #[cfg(feature = "zstd")]
            WritePackager::Zstd(p) => p.remove(name),
        }
    }

    /// Remove the whole package. Valid on a closed packager only.
    pub fn remove_package(&mut self, cancel: &CancelToken) -> Result<()> {
        match self {
            WritePackager::Directory(p) => p.remove_package(cancel),
            WritePackager::Tar(p) => p.remove_package(cancel),
            #[cfg(feature = "zstd")]
            WritePackager::Zstd(p) => p.remove_package(cancel),
        }
    }

    /// Run `f` inside an open/close pair; `close` runs on every exit path.
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.open()?;
        let result = f(self);
        let closed = self.close();
        match result {
            Ok(value) => closed.map(|_| value),
            Err(e) => {
                if let Err(close_err) = closed {
                    tracing::warn!(error = %close_err, "packager close failed after error");
                }
                Err(e)
            }
        }
    }
}

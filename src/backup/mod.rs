//! Per-VM backup drivers: the pending (write) side and the complete (read)
//! side, plus the cleanup policy they share.

pub mod complete;
pub mod pending;

pub use complete::CompleteBackup;
pub use pending::DomBackup;

use std::path::Path;

use virtbak_core::cancel::CancelToken;
use virtbak_core::error::{Error, Result};
use virtbak_core::metadata::{PackagerInfo, PackagerKind, PackagerOpts};
use virtbak_storage::{ReadPackager, WritePackager};

pub(crate) fn write_packager(
    info: &PackagerInfo,
    backup_dir: &Path,
    name: &str,
) -> Result<WritePackager> {
    WritePackager::build(info.kind, name, backup_dir, name, &info.opts)
}

pub(crate) fn read_packager(
    info: &PackagerInfo,
    backup_dir: &Path,
    name: &str,
) -> Result<ReadPackager> {
    ReadPackager::build(info.kind, name, backup_dir, name, &info.opts)
}

pub(crate) fn packager_info(kind: PackagerKind, opts: &PackagerOpts) -> PackagerInfo {
    PackagerInfo {
        kind,
        opts: opts.clone(),
    }
}

fn is_missing(error: &Error) -> bool {
    match error {
        Error::ImageNotFound { .. } => true,
        Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

/// Drop a backup's artifacts.
///
/// For a shareable packager, remove this backup's artifacts one by one and
/// keep the package alive while unrelated entries remain; otherwise (or once
/// empty) remove the whole package. Files already gone are tolerated.
pub(crate) fn clean_packager(
    packager: &mut WritePackager,
    artifacts: &[String],
    cancel: &CancelToken,
) -> Result<()> {
    if packager.is_shareable() {
        let others_remain = packager.scoped(|p| {
            for artifact in artifacts {
                match p.remove(artifact) {
                    Ok(()) => {}
                    Err(e) if is_missing(&e) => {
                        tracing::debug!(%artifact, "artifact already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(!p.list()?.is_empty())
        })?;
        if others_remain {
            return Ok(());
        }
    }

    match packager.remove_package(cancel) {
        Ok(()) => Ok(()),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

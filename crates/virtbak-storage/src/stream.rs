//! Cancellable streaming copies.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use virtbak_core::cancel::CancelToken;
use virtbak_core::error::Result;

/// Copy buffer size; the cancellation flag is polled once per buffer.
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Stream `src` into `dst`, checking the cancellation flag before every
/// buffer. Returns the number of bytes written.
pub fn copy_cancellable<R, W>(src: &mut R, dst: &mut W, cancel: &CancelToken) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        cancel.check()?;
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        written += n as u64;
    }
    Ok(written)
}

/// Reader adapter that fails once the cancellation flag is set. Used where a
/// library drives the copy loop itself (tar appends).
pub struct CancelRead<'a, R> {
    inner: R,
    cancel: &'a CancelToken,
}

impl<'a, R: Read> CancelRead<'a, R> {
    pub fn new(inner: R, cancel: &'a CancelToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancelRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Resolve the destination of a restore: an existing directory (or a path
/// with a trailing slash, which is created) receives the artifact under its
/// own name; anything else is used as the target file verbatim.
pub fn resolve_restore_target(target: &Path, name: &str) -> Result<PathBuf> {
    if !target.exists() && target.as_os_str().to_string_lossy().ends_with('/') {
        std::fs::create_dir_all(target)?;
    }
    if target.is_dir() {
        Ok(target.join(name))
    } else {
        Ok(target.to_path_buf())
    }
}

/// Best-effort removal of a partially written destination.
pub(crate) fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove partial file");
        }
    }
}

//! Tar packager: all artifacts of a backup in one archive, optionally
//! compressed with gz, bz2, or xz.
//!
//! Not shareable. Writes stream entry blocks as they go, so cancellation is
//! observed at buffer boundaries; after a failed `add` the archive must be
//! considered corrupt and discarded by the caller's abort cleanup.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use virtbak_core::cancel::CancelToken;
use virtbak_core::error::{Error, Result};
use virtbak_core::metadata::{Compression, PackagerOpts};

use super::{artifact_name, ensure_closed, ensure_opened};
use crate::stream::{CancelRead, copy_cancellable, remove_partial, resolve_restore_target};

fn archive_path(dir: &Path, archive_name: &str, compression: Option<Compression>) -> PathBuf {
    // names that already carry a .tar extension are used verbatim
    if archive_name.contains(".tar") {
        dir.join(archive_name)
    } else {
        let extension = compression.map_or("tar", Compression::tar_extension);
        dir.join(format!("{archive_name}.{extension}"))
    }
}

fn gz_level(lvl: Option<i64>) -> flate2::Compression {
    lvl.map_or_else(flate2::Compression::default, |l| {
        flate2::Compression::new(l.clamp(0, 9) as u32)
    })
}

fn bz_level(lvl: Option<i64>) -> bzip2::Compression {
    lvl.map_or_else(bzip2::Compression::default, |l| {
        bzip2::Compression::new(l.clamp(1, 9) as u32)
    })
}

fn xz_preset(lvl: Option<i64>) -> u32 {
    lvl.map_or(6, |l| l.clamp(0, 9) as u32)
}

enum TarStream {
    Plain(File),
    Gz(GzEncoder<File>),
    Bz2(BzEncoder<File>),
    Xz(XzEncoder<File>),
}

impl Write for TarStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarStream::Plain(w) => w.write(buf),
            TarStream::Gz(w) => w.write(buf),
            TarStream::Bz2(w) => w.write(buf),
            TarStream::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarStream::Plain(w) => w.flush(),
            TarStream::Gz(w) => w.flush(),
            TarStream::Bz2(w) => w.flush(),
            TarStream::Xz(w) => w.flush(),
        }
    }
}

impl TarStream {
    fn finish(self) -> io::Result<()> {
        match self {
            TarStream::Plain(mut f) => f.flush(),
            TarStream::Gz(enc) => enc.finish().map(drop),
            TarStream::Bz2(enc) => enc.finish().map(drop),
            TarStream::Xz(enc) => enc.finish().map(drop),
        }
    }
}

pub struct TarWritePackager {
    log_name: String,
    dir: PathBuf,
    archive_name: String,
    compression: Option<Compression>,
    compression_lvl: Option<i64>,
    builder: Option<tar::Builder<TarStream>>,
    entries: Vec<String>,
}

impl TarWritePackager {
    pub fn new(log_name: &str, dir: &Path, archive_name: &str, opts: &PackagerOpts) -> Self {
        Self {
            log_name: log_name.to_string(),
            dir: dir.to_path_buf(),
            archive_name: archive_name.to_string(),
            compression: opts.effective_compression(),
            compression_lvl: opts.compression_lvl,
            builder: None,
            entries: Vec::new(),
        }
    }

    pub fn archive_path(&self) -> PathBuf {
        archive_path(&self.dir, &self.archive_name, self.compression)
    }

    pub fn open(&mut self) -> Result<()> {
        ensure_closed(self.builder.is_some())?;
        if !self.dir.is_dir() {
            std::fs::create_dir_all(&self.dir)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.archive_path())?;
        let stream = match self.compression {
            None | Some(Compression::None) => TarStream::Plain(file),
            Some(Compression::Gz) => {
                TarStream::Gz(GzEncoder::new(file, gz_level(self.compression_lvl)))
            }
            Some(Compression::Bz2) => {
                TarStream::Bz2(BzEncoder::new(file, bz_level(self.compression_lvl)))
            }
            Some(Compression::Xz) => {
                TarStream::Xz(XzEncoder::new(file, xz_preset(self.compression_lvl)))
            }
        };
        self.builder = Some(tar::Builder::new(stream));
        self.entries.clear();
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let builder = self.builder.take().ok_or(Error::PackagerNotOpened)?;
        let stream = builder.into_inner()?;
        stream.finish()?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        ensure_opened(self.builder.is_some())?;
        Ok(self.entries.clone())
    }

    pub fn add(&mut self, src: &Path, name: Option<&str>, cancel: &CancelToken) -> Result<PathBuf> {
        let archive = self.archive_path();
        let builder = self.builder.as_mut().ok_or(Error::PackagerNotOpened)?;
        cancel.check()?;

        let name = artifact_name(src, name)?;
        tracing::debug!(packager = %self.log_name, src = %src.display(), archive = %archive.display(), "append artifact");

        let file = File::open(src)?;
        let metadata = file.metadata()?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata(&metadata);

        match builder.append_data(&mut header, &name, CancelRead::new(file, cancel)) {
            Ok(()) => {
                self.entries.push(name);
                Ok(archive)
            }
            // the archive now ends mid-entry; the caller's abort cleanup
            // discards it wholesale
            Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the archive. Atomic with respect to cancellation.
    pub fn remove_package(&mut self, _cancel: &CancelToken) -> Result<()> {
        ensure_closed(self.builder.is_some())?;
        std::fs::remove_file(self.archive_path())?;
        Ok(())
    }
}

pub struct TarReadPackager {
    log_name: String,
    dir: PathBuf,
    archive_name: String,
    compression: Option<Compression>,
    opened: bool,
}

impl TarReadPackager {
    /// The compression level is deliberately not taken over from the options:
    /// it only applies to encoding.
    pub fn new(log_name: &str, dir: &Path, archive_name: &str, opts: &PackagerOpts) -> Self {
        Self {
            log_name: log_name.to_string(),
            dir: dir.to_path_buf(),
            archive_name: archive_name.to_string(),
            compression: opts.effective_compression(),
            opened: false,
        }
    }

    pub fn archive_path(&self) -> PathBuf {
        archive_path(&self.dir, &self.archive_name, self.compression)
    }

    pub fn open(&mut self) -> Result<()> {
        ensure_closed(self.opened)?;
        // fail now rather than on first read if the archive is gone
        File::open(self.archive_path())?;
        self.opened = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        ensure_opened(self.opened)?;
        self.opened = false;
        Ok(())
    }

    fn archive(&self) -> Result<tar::Archive<Box<dyn Read>>> {
        let file = File::open(self.archive_path())?;
        let reader: Box<dyn Read> = match self.compression {
            None | Some(Compression::None) => Box::new(file),
            Some(Compression::Gz) => Box::new(GzDecoder::new(file)),
            Some(Compression::Bz2) => Box::new(BzDecoder::new(file)),
            Some(Compression::Xz) => Box::new(XzDecoder::new(file)),
        };
        Ok(tar::Archive::new(reader))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        ensure_opened(self.opened)?;
        let mut names = Vec::new();
        for entry in self.archive()?.entries()? {
            names.push(entry?.path()?.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    pub fn restore(&self, name: &str, target: &Path, cancel: &CancelToken) -> Result<PathBuf> {
        ensure_opened(self.opened)?;
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() != name {
                continue;
            }

            let target = resolve_restore_target(target, name)?;
            tracing::debug!(packager = %self.log_name, artifact = name, target = %target.display(), "restore artifact");
            let mut writer = OpenOptions::new().write(true).create_new(true).open(&target)?;
            return match copy_cancellable(&mut entry, &mut writer, cancel) {
                Ok(_) => Ok(target),
                Err(e) => {
                    drop(writer);
                    remove_partial(&target);
                    Err(e)
                }
            };
        }

        Err(Error::ImageNotFound {
            name: name.to_string(),
            location: self.archive_path().display().to_string(),
        })
    }
}

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::progress::ProgressBridge;

const COPY_CHUNK_SIZE: usize = 256 * 1024;

/// Seekable bytes of an install source, local or remote.
pub trait ByteSource: Read + Seek + Send {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    /// Set when the bytes are backed by a file on this machine.
    fn local_path(&self) -> Option<&Path>;

    fn is_local(&self) -> bool {
        self.local_path().is_some()
    }
}

/// Opens the byte source behind an install location.
pub trait SourceOpener: Send + Sync {
    fn open(&self, location: &str, cancel: &CancelToken) -> Result<Box<dyn ByteSource>>;
}

pub struct LocalSource {
    file: File,
    path: PathBuf,
    name: String,
    size: u64,
}

impl LocalSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)
            .with_context(|| format!("failed to open install source {}", path.display()))?;
        let size = file
            .metadata()
            .with_context(|| format!("failed to stat install source {}", path.display()))?
            .len();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            file,
            path,
            name,
            size,
        })
    }
}

impl Read for LocalSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for LocalSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ByteSource for LocalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Opens plain paths and `file://` locations.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSourceOpener;

impl SourceOpener for LocalSourceOpener {
    fn open(&self, location: &str, _cancel: &CancelToken) -> Result<Box<dyn ByteSource>> {
        let path = local_location_path(location)
            .ok_or_else(|| anyhow!("'{location}' is not a local install source"))?;
        Ok(Box::new(LocalSource::open(path)?))
    }
}

pub fn local_location_path(location: &str) -> Option<PathBuf> {
    if let Some(rest) = location.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if location.contains("://") {
        return None;
    }
    Some(PathBuf::from(location))
}

/// Copies `source` to `dest`, continuing from whatever a previous attempt
/// already wrote. Cancellation is honored between chunks and leaves the
/// partial file in place for the next attempt.
pub fn copy_to_local(
    source: &mut dyn ByteSource,
    dest: &Path,
    progress: &ProgressBridge,
    cancel: &CancelToken,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let total = source.size();
    let mut written = match fs::metadata(dest) {
        Ok(meta) if meta.len() <= total => meta.len(),
        Ok(meta) => {
            debug!(
                path = %dest.display(),
                existing = meta.len(),
                total,
                "partial copy is larger than source, starting over"
            );
            0
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", dest.display()));
        }
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(written == 0)
        .open(dest)
        .with_context(|| format!("failed to open {}", dest.display()))?;
    if written > 0 {
        info!(
            path = %dest.display(),
            resumed_at = %indicatif::HumanBytes(written),
            "resuming local copy"
        );
        file.seek(SeekFrom::Start(written))
            .with_context(|| format!("failed to seek {}", dest.display()))?;
    }
    source
        .seek(SeekFrom::Start(written))
        .with_context(|| format!("failed to seek install source {}", source.name()))?;

    progress.set_bytes(written);
    let mut buf = vec![0_u8; COPY_CHUNK_SIZE];
    while written < total {
        cancel.check("download")?;
        let read = source
            .read(&mut buf)
            .with_context(|| format!("failed to read install source {}", source.name()))?;
        if read == 0 {
            return Err(anyhow!(
                "install source {} ended after {written} of {total} bytes",
                source.name()
            ));
        }
        file.write_all(&buf[..read])
            .with_context(|| format!("failed to write {}", dest.display()))?;
        written += read as u64;
        progress.set_bytes(written);
    }

    file.sync_all()
        .with_context(|| format!("failed to sync {}", dest.display()))?;
    Ok(written)
}

use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{SeekFrom, Write};
use std::path::Path;
use tracing::info;

use stagecoach_core::{FormatSubtype, InstallResult};

use crate::backend::{BackendError, InstallBackend, InstallParams};
use crate::cancel::CancelToken;
use crate::layout::sanitize_file_name;
use crate::progress::ProgressBridge;
use crate::source::ByteSource;
use crate::InstallFolderLayout;

const COPY_CHUNK_SIZE: usize = 256 * 1024;

/// Copies the source as-is into the install folder. Streams, so it works on
/// remote sources without a local copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NakedBackend;

impl NakedBackend {
    pub fn new() -> Self {
        Self
    }
}

impl InstallBackend for NakedBackend {
    fn name(&self) -> &str {
        "naked"
    }

    fn install(&self, params: InstallParams<'_>) -> Result<InstallResult, BackendError> {
        install_naked(params).map_err(BackendError::from_anyhow)
    }
}

fn install_naked(params: InstallParams<'_>) -> Result<InstallResult> {
    let file_name =
        sanitize_file_name(params.source.name()).unwrap_or_else(|| "download".to_string());
    let dst = InstallFolderLayout::new(params.install_folder)
        .resolve(&file_name)
        .ok_or_else(|| anyhow!("refusing to install bare file as '{file_name}'"))?;
    fs::create_dir_all(params.install_folder)
        .with_context(|| format!("failed to create {}", params.install_folder.display()))?;

    // The partial copy is never receipted, so it must not outlive a failure.
    let part = dst.with_file_name(format!("{file_name}.part"));
    if let Err(err) = copy_into(params.source, &part, params.cancel, params.progress) {
        let _ = fs::remove_file(&part);
        return Err(err);
    }
    fs::rename(&part, &dst)
        .with_context(|| format!("failed to move {} into place", dst.display()))?;

    if matches!(
        params.format.subtype,
        FormatSubtype::Elf | FormatSubtype::MachO | FormatSubtype::Script
    ) {
        mark_executable(&dst)?;
    }

    info!(file = %file_name, "copied bare file");
    Ok(InstallResult::new(vec![file_name]))
}

fn copy_into(
    source: &mut dyn ByteSource,
    part: &Path,
    cancel: &CancelToken,
    progress: &ProgressBridge,
) -> Result<()> {
    let total = source.size();
    source
        .seek(SeekFrom::Start(0))
        .with_context(|| format!("failed to rewind {}", source.name()))?;
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part)
        .with_context(|| format!("failed to open {}", part.display()))?;
    let mut buf = vec![0_u8; COPY_CHUNK_SIZE];
    let mut written = 0_u64;
    loop {
        cancel.check("naked install")?;
        let read = source
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", source.name()))?;
        if read == 0 {
            break;
        }
        out.write_all(&buf[..read])
            .with_context(|| format!("failed to write {}", part.display()))?;
        written += read as u64;
        if total > 0 {
            progress.set_fraction(written as f64 / total as f64);
        }
    }
    out.sync_all()
        .with_context(|| format!("failed to sync {}", part.display()))
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to mark {} executable", path.display()))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use stagecoach_core::Receipt;

use crate::fs_utils::{remove_file_if_exists, write_atomically};
use crate::InstallFolderLayout;

pub fn write_receipt(install_folder: &Path, receipt: &Receipt) -> Result<PathBuf> {
    let path = InstallFolderLayout::new(install_folder).receipt_path();
    let payload = serde_json::to_vec_pretty(receipt).context("failed to serialize receipt")?;
    write_atomically(&path, &payload)
        .with_context(|| format!("failed to write receipt: {}", path.display()))?;
    Ok(path)
}

/// Reads the receipt of an install folder. A missing file is `None`; so is
/// one that cannot be parsed, which gets logged and otherwise treated as if
/// the folder had never been installed by us.
pub fn read_receipt(install_folder: &Path) -> Result<Option<Receipt>> {
    let path = InstallFolderLayout::new(install_folder).receipt_path();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read receipt: {}", path.display()));
        }
    };

    match serde_json::from_slice::<Receipt>(&raw) {
        Ok(receipt) => Ok(Some(receipt)),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "could not parse receipt, treating install folder as unreceipted"
            );
            Ok(None)
        }
    }
}

pub fn remove_receipt(install_folder: &Path) -> Result<()> {
    let layout = InstallFolderLayout::new(install_folder);
    let path = layout.receipt_path();
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove receipt: {}", path.display()))?;
    let state_dir = layout.state_dir();
    if state_dir.exists() && fs::read_dir(&state_dir)?.next().is_none() {
        fs::remove_dir(&state_dir)
            .with_context(|| format!("failed to remove {}", state_dir.display()))?;
    }
    Ok(())
}

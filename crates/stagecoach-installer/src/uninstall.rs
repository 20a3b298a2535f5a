use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::fs_utils::{prune_empty_dirs, remove_file_if_exists};
use crate::receipts::{read_receipt, remove_receipt};
use crate::InstallFolderLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallStatus {
    Uninstalled,
    NotInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallResult {
    pub status: UninstallStatus,
    pub removed_files: Vec<String>,
}

/// Removes every file the folder's receipt lists, then the receipt itself.
/// A folder without a receipt has nothing of ours in it and succeeds as-is.
pub fn uninstall_folder(install_folder: &Path, cancel: &CancelToken) -> Result<UninstallResult> {
    let Some(receipt) = read_receipt(install_folder)? else {
        info!(folder = %install_folder.display(), "no receipt, nothing to uninstall");
        return Ok(UninstallResult {
            status: UninstallStatus::NotInstalled,
            removed_files: Vec::new(),
        });
    };

    let layout = InstallFolderLayout::new(install_folder);
    let mut removed_files = Vec::with_capacity(receipt.files.len());
    for file in &receipt.files {
        cancel.check("uninstall")?;
        let Some(path) = layout.resolve(file) else {
            warn!(file = %file, "receipt lists a path outside the install folder, skipping");
            continue;
        };
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove installed file {}", path.display()))?;
        if let Some(parent) = path.parent() {
            prune_empty_dirs(install_folder, parent);
        }
        removed_files.push(file.clone());
    }

    remove_receipt(install_folder)?;
    if install_folder.exists() && fs::read_dir(install_folder)?.next().is_none() {
        fs::remove_dir(install_folder)
            .with_context(|| format!("failed to remove {}", install_folder.display()))?;
    }

    info!(
        folder = %install_folder.display(),
        files = removed_files.len(),
        "uninstalled"
    );
    Ok(UninstallResult {
        status: UninstallStatus::Uninstalled,
        removed_files,
    })
}

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use stagecoach_core::{InstallResult, InstallTarget, Receipt};

use crate::fs_utils::{prune_empty_dirs, remove_file_if_exists};
use crate::receipts::write_receipt;
use crate::InstallFolderLayout;

pub struct CommitRequest<'a> {
    pub install_folder: &'a Path,
    pub target: &'a InstallTarget,
    pub result: &'a InstallResult,
    pub installer_name: &'a str,
    /// Receipt found before the operation started. Files it lists that the
    /// new result does not are removed.
    pub receipt_in: Option<&'a Receipt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub receipt: Receipt,
    pub removed_ghosts: Vec<String>,
}

/// Finalizes an install: removes ghost files, then writes the new receipt.
/// Safe to repeat; a second commit of the same result changes nothing.
pub fn commit_install(request: CommitRequest<'_>) -> Result<CommitOutcome> {
    let removed_ghosts = match request.receipt_in {
        Some(previous) => remove_ghost_files(request.install_folder, previous, request.result)?,
        None => Vec::new(),
    };

    let receipt = Receipt::for_target(
        request.target,
        request.result,
        request.installer_name,
        current_unix_timestamp()?,
    );
    let path = write_receipt(request.install_folder, &receipt)?;
    info!(
        receipt = %path.display(),
        files = receipt.files.len(),
        installer = request.installer_name,
        "committed install"
    );

    Ok(CommitOutcome {
        receipt,
        removed_ghosts,
    })
}

/// Deletes files a previous install left behind that the new manifest no
/// longer lists. Only paths inside the install folder are ever touched.
pub fn remove_ghost_files(
    install_folder: &Path,
    previous: &Receipt,
    result: &InstallResult,
) -> Result<Vec<String>> {
    let layout = InstallFolderLayout::new(install_folder);
    let keep: BTreeSet<&str> = result.files.iter().map(String::as_str).collect();
    let mut removed = Vec::new();

    for file in &previous.files {
        if keep.contains(file.as_str()) {
            continue;
        }
        let Some(path) = layout.resolve(file) else {
            debug!(file = %file, "skipping ghost outside install folder");
            continue;
        };
        if path.is_dir() {
            continue;
        }
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove ghost file {}", path.display()))?;
        if let Some(parent) = path.parent() {
            prune_empty_dirs(install_folder, parent);
        }
        removed.push(file.clone());
    }

    if !removed.is_empty() {
        info!(count = removed.len(), "removed ghost files");
    }
    Ok(removed)
}

fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

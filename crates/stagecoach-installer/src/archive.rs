use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

use stagecoach_core::{FormatSubtype, InstallResult};

use crate::backend::{BackendError, InstallBackend, InstallParams};
use crate::cancel::CancelToken;
use crate::command::{escape_ps_single_quote, run_command, CommandRunner};
use crate::fs_utils::{files_match, list_files_relative, move_file_or_copy};
use crate::{InstallFolderLayout, StagingLayout};

/// Extracts archives with the host's `unzip`/`tar`/`7z` tools into the
/// staging folder, then moves the entries into the install folder.
pub struct ArchiveBackend {
    runner: Arc<CommandRunner>,
}

impl ArchiveBackend {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(run_command))
    }

    pub fn with_runner(runner: Arc<CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Default for ArchiveBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallBackend for ArchiveBackend {
    fn name(&self) -> &str {
        "archive"
    }

    fn install(&self, params: InstallParams<'_>) -> Result<InstallResult, BackendError> {
        let Some(archive_path) = params.source.local_path().map(Path::to_path_buf) else {
            return Err(BackendError::NeedsLocal);
        };
        self.install_local(&archive_path, &params)
            .map_err(BackendError::from_anyhow)
    }
}

impl ArchiveBackend {
    fn install_local(&self, archive_path: &Path, params: &InstallParams<'_>) -> Result<InstallResult> {
        let extract_dir = StagingLayout::new(params.stage_folder).extract_dir();
        reset_dir(&extract_dir)?;

        params.progress.set_fraction(0.0);
        extract_archive(
            &*self.runner,
            archive_path,
            &extract_dir,
            params.format.subtype,
            params.cancel,
        )?;
        params.progress.set_fraction(0.5);

        let entries = list_files_relative(&extract_dir, &[])?;
        let layout = InstallFolderLayout::new(params.install_folder);
        let mut files = Vec::with_capacity(entries.len());
        let mut unchanged = 0_usize;
        for (index, entry) in entries.iter().enumerate() {
            params.cancel.check("archive placement")?;
            let Some(dst) = layout.resolve(entry) else {
                warn!(entry = %entry, "archive entry targets engine state, skipping");
                continue;
            };
            let src = extract_dir.join(entry);
            if params.receipt_in.is_some() && files_match(&src, &dst)? {
                unchanged += 1;
            } else {
                if dst.is_dir() {
                    fs::remove_dir_all(&dst)
                        .with_context(|| format!("failed to replace directory {}", dst.display()))?;
                }
                move_file_or_copy(&src, &dst)?;
            }
            files.push(entry.clone());
            params
                .progress
                .set_fraction(0.5 + 0.5 * (index + 1) as f64 / entries.len() as f64);
        }

        if let Err(err) = fs::remove_dir_all(&extract_dir) {
            warn!(path = %extract_dir.display(), error = %err, "failed to clean extract dir");
        }
        info!(
            files = files.len(),
            unchanged,
            folder = %params.install_folder.display(),
            "extracted archive"
        );
        Ok(InstallResult::new(files))
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

pub(crate) fn extract_archive(
    runner: &CommandRunner,
    archive_path: &Path,
    dst: &Path,
    subtype: FormatSubtype,
    cancel: &CancelToken,
) -> Result<()> {
    match subtype {
        FormatSubtype::Zip => extract_zip(runner, archive_path, dst, cancel),
        FormatSubtype::Tar | FormatSubtype::Gzip | FormatSubtype::Bzip2 | FormatSubtype::Xz => {
            runner(
                &mut build_tar_extract_command(archive_path, dst),
                "failed to extract tar archive",
                cancel,
            )
        }
        FormatSubtype::SevenZip | FormatSubtype::Rar => runner(
            &mut build_7z_extract_command(archive_path, dst),
            "failed to extract archive with 7z",
            cancel,
        ),
        other => Err(anyhow!(
            "archive backend cannot extract '{}' payloads",
            other.as_str()
        )),
    }
}

fn extract_zip(
    runner: &CommandRunner,
    archive_path: &Path,
    dst: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    if cfg!(windows) {
        let mut command = Command::new("powershell");
        command.arg("-NoProfile").arg("-Command").arg(format!(
            "Expand-Archive -LiteralPath '{}' -DestinationPath '{}' -Force",
            escape_ps_single_quote(archive_path),
            escape_ps_single_quote(dst)
        ));
        if runner(
            &mut command,
            "failed to extract zip archive with powershell",
            cancel,
        )
        .is_ok()
        {
            return Ok(());
        }
    }

    let mut unzip_command = Command::new("unzip");
    unzip_command.arg("-q").arg("-o").arg(archive_path).arg("-d").arg(dst);
    if runner(
        &mut unzip_command,
        "failed to extract zip archive with unzip",
        cancel,
    )
    .is_ok()
    {
        return Ok(());
    }
    cancel.check("zip extraction")?;

    runner(
        &mut build_tar_extract_command(archive_path, dst),
        "failed to extract zip archive with tar fallback",
        cancel,
    )
}

pub(crate) fn build_tar_extract_command(archive_path: &Path, dst: &Path) -> Command {
    let mut command = Command::new("tar");
    command.arg("-xf").arg(archive_path).arg("-C").arg(dst);
    command
}

pub(crate) fn build_7z_extract_command(archive_path: &Path, dst: &Path) -> Command {
    let mut command = Command::new("7z");
    command
        .arg("x")
        .arg(archive_path)
        .arg(format!("-o{}", dst.display()))
        .arg("-y");
    command
}

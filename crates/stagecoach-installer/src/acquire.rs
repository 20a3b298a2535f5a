use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use stagecoach_core::{
    InstallTarget, Notification, TaskReason, TaskStartedNotification, TaskSucceededNotification,
    TaskType,
};

use crate::context::{Checkpoint, OperationContext};
use crate::layout::install_source_file_name;
use crate::source::{copy_to_local, ByteSource, LocalSource, SourceOpener};
use crate::state::InstallSubState;

pub fn local_copy_path(oc: &OperationContext, target: &InstallTarget) -> PathBuf {
    crate::StagingLayout::new(oc.stage_folder())
        .install_source_path(&install_source_file_name(&target.upload))
}

/// Opens the install source, preferring a local copy an earlier attempt
/// already completed.
pub fn open_install_source(
    oc: &OperationContext,
    isub: &mut InstallSubState,
    opener: &dyn SourceOpener,
    target: &InstallTarget,
    location: &str,
) -> Result<Box<dyn ByteSource>> {
    oc.cancel().check("source acquisition")?;

    if isub.is_available_locally {
        let path = local_copy_path(oc, target);
        if path.is_file() {
            info!(path = %path.display(), "using local copy of install source");
            return Ok(Box::new(LocalSource::open(path)?));
        }
        warn!(
            path = %path.display(),
            "local copy of install source went missing, opening remote source again"
        );
        isub.is_available_locally = false;
        oc.save(isub)?;
    }

    opener
        .open(location, oc.cancel())
        .with_context(|| format!("failed to open install source for {}", target.describe()))
}

/// Copies `source` into the staging folder and returns the local copy.
/// Reuses a finished copy and resumes a partial one.
pub fn force_local(
    oc: &OperationContext,
    isub: &mut InstallSubState,
    source: &mut dyn ByteSource,
    target: &InstallTarget,
) -> Result<Box<dyn ByteSource>> {
    let dest = local_copy_path(oc, target);

    if isub.is_available_locally && dest.is_file() {
        info!(path = %dest.display(), "install source already copied locally");
    } else {
        oc.cancel().check("download")?;
        info!(
            size = %indicatif::HumanBytes(source.size()),
            dest = %dest.display(),
            "copying install source locally"
        );
        oc.notify(Notification::TaskStarted(TaskStartedNotification {
            reason: TaskReason::Install,
            task_type: TaskType::Download,
            game: Some(target.game.clone()),
            upload: Some(target.upload.clone()),
            build: target.build.clone(),
            total_size: source.size(),
        }));

        oc.progress().start(source.size());
        let copied = copy_to_local(source, &dest, oc.progress(), oc.cancel());
        oc.progress().end();
        copied?;

        oc.notify(Notification::TaskSucceeded(TaskSucceededNotification {
            task_type: TaskType::Download,
            install_result: None,
        }));
        isub.is_available_locally = true;
        oc.save(isub)?;
        oc.checkpoint(Checkpoint::SourceAvailableLocally)?;
    }

    Ok(Box::new(LocalSource::open(dest)?))
}

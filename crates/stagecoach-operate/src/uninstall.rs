use tracing::info;

use stagecoach_core::{
    Notification, TaskReason, TaskStartedNotification, TaskSucceededNotification, TaskType,
};
use stagecoach_installer::{
    read_receipt, uninstall_folder, OperationContext, RecordState, UninstallResult,
};

use crate::error::{OperationError, StepResultExt};
use crate::params::{MetaSubState, UninstallParams};

pub(crate) fn uninstall_perform(
    oc: OperationContext,
    meta: &MetaSubState,
    params: &UninstallParams,
) -> Result<UninstallResult, OperationError> {
    let folder = params.install_folder.as_path();
    info!(folder = %folder.display(), "uninstalling");
    oc.cancel().check("uninstall").step("uninstall")?;

    let receipt = read_receipt(folder).step("uninstall")?;
    oc.notify(Notification::TaskStarted(TaskStartedNotification {
        reason: TaskReason::Uninstall,
        task_type: TaskType::Uninstall,
        game: receipt.as_ref().and_then(|receipt| receipt.game.clone()),
        upload: receipt.as_ref().and_then(|receipt| receipt.upload.clone()),
        build: receipt.as_ref().and_then(|receipt| receipt.build.clone()),
        total_size: 0,
    }));

    let result = uninstall_folder(folder, oc.cancel()).step("uninstall")?;
    info!(
        status = ?result.status,
        removed = result.removed_files.len(),
        "uninstall finished"
    );

    oc.notify(Notification::TaskSucceeded(TaskSucceededNotification {
        task_type: TaskType::Uninstall,
        install_result: None,
    }));

    let live: [&dyn RecordState; 1] = [meta];
    oc.retire(&live)?;
    Ok(result)
}

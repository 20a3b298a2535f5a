use std::path::Path;
use tracing::{error, info, warn};

use stagecoach_api::{source_url_for, PackageApi};
use stagecoach_core::{
    FormatKind, InstallResult, InstallTarget, InstalledTarget, Notification, Receipt, Strategy,
    TaskReason, TaskStartedNotification, TaskSucceededNotification, TaskType,
};
use stagecoach_installer::{
    cancellation_in, commit_install, force_local, open_install_source, read_receipt,
    Checkpoint, CommitOutcome, CommitRequest, ExecutionRequest, InstallExecutor,
    InstallSubState, OperationContext, RecordState,
};

use crate::engine::{Engine, InstallOutcome};
use crate::error::{OperationError, StepResultExt};
use crate::params::{InstallParams, MetaSubState};
use crate::patch::PatchRequest;
use crate::strategy::{select_strategy, PatchPlan};

/// Brings `params.install_folder` to the requested target: picks a
/// strategy, patches or runs the install pipeline, commits the receipt and
/// retires the staging folder.
pub(crate) fn install_perform(
    engine: &Engine,
    oc: OperationContext,
    meta: &MetaSubState,
    params: &InstallParams,
) -> Result<InstallOutcome, OperationError> {
    let target = params.target();
    let install_folder = params.install_folder.as_path();
    info!(game = %target.game.title, target = %target.describe(), "preparing install");
    info!(folder = %install_folder.display(), "install destination");
    info!(folder = %oc.stage_folder().display(), "staging folder");

    let api = engine.connector.connect(&params.credentials).step("connect")?;
    let receipt_in = read_previous_receipt(install_folder);
    let mut isub: InstallSubState = oc.load()?;

    let session_id = ensure_download_session(&oc, &mut isub, api.as_ref(), params)?;

    match &receipt_in {
        Some(receipt) => info!(
            upload = ?receipt.upload_id(),
            build = ?receipt.build_id(),
            "previously installed"
        ),
        None => info!("no previous install info (no recorded upload or build)"),
    }
    info!(
        upload = target.upload.id,
        build = ?target.build.as_ref().map(|build| build.id),
        "to be installed"
    );

    let selection = select_strategy(
        receipt_in.as_ref(),
        &target,
        params.credentials.download_key,
        api.as_ref(),
    );
    let previous_strategy = isub.strategy;
    if isub.reset_for(selection.strategy) {
        info!(
            from = ?previous_strategy,
            to = selection.strategy.as_str(),
            "strategy changed since the last attempt, discarding cached install results"
        );
    }
    if previous_strategy != isub.strategy {
        oc.save(&isub)?;
    }

    if let (Some(plan), Some(receipt)) = (&selection.patch, &receipt_in) {
        let patched = try_patch(
            engine,
            &oc,
            api.as_ref(),
            params,
            plan,
            receipt,
            session_id.as_deref(),
        )?;
        if let Some(result) = patched {
            let outcome = finish(
                &oc,
                &target,
                install_folder,
                &result,
                &receipt.installer_name,
                receipt_in.as_ref(),
                TaskType::Update,
            )?;
            retire(oc, meta, &isub)?;
            return Ok(InstallOutcome {
                strategy: selection.strategy,
                patched: true,
                receipt: outcome.receipt,
                removed_ghosts: outcome.removed_ghosts,
            });
        }
    }

    let task_type = match selection.strategy {
        Strategy::Install => TaskType::Install,
        Strategy::Heal => TaskType::Heal,
        Strategy::None => {
            return Err(OperationError::Failed {
                step: "prepare",
                source: anyhow::anyhow!("no install strategy was selected"),
            })
        }
    };
    info!(strategy = selection.strategy.as_str(), "running install pipeline");

    let location = source_url_for(
        api.as_ref(),
        &target.upload,
        target.build.as_ref(),
        session_id.as_deref(),
        params.credentials.download_key,
    );
    let mut source = open_install_source(
        &oc,
        &mut isub,
        engine.opener.as_ref(),
        &target,
        &location,
    )
    .step("open install source")?;

    if target.build.is_none() && target.upload.is_probably_external() {
        warn!("dealing with an external upload, forcing a download before probing");
        source = force_local(&oc, &mut isub, source.as_mut(), &target).step("download")?;
    }

    let installer = match isub.installer_info.filter(|info| info.is_known()) {
        Some(cached) => {
            info!(format = %cached, "using cached source information");
            cached
        }
        None => {
            oc.cancel().check("probe").step("probe")?;
            info!(source = source.name(), "determining source information");
            let mut probed = engine.prober.probe(source.as_mut()).step("probe")?;
            if params.ignore_installers {
                let forced = probed.ignoring_installers();
                if forced != probed {
                    info!(
                        from = %probed,
                        to = %forced,
                        "asked to ignore installers, copying the package as-is"
                    );
                }
                probed = forced;
            }
            info!(format = %probed, "probed install source");
            isub.installer_info = Some(probed);
            oc.save(&isub)?;
            oc.checkpoint(Checkpoint::InstallerInfoCached).step("probe")?;
            probed
        }
    };

    if installer.kind == FormatKind::Unsupported {
        error!(
            format = %installer,
            "item is packaged in a way that isn't supported, refusing to install"
        );
        return Err(OperationError::UnsupportedPackaging { format: installer });
    }

    let backend_receipt = match selection.strategy {
        Strategy::Heal => receipt_in.as_ref(),
        _ => None,
    };
    let executed = InstallExecutor::new(&engine.registry, engine.prober.as_ref())
        .execute(
            &oc,
            &mut isub,
            source,
            &ExecutionRequest {
                target: &target,
                install_folder,
                receipt_in: backend_receipt,
                task_type,
                ignore_installers: params.ignore_installers,
            },
        )
        .step("install")?;

    let installer_name = executed.installer.installer_name().unwrap_or("unknown");
    let outcome = finish(
        &oc,
        &target,
        install_folder,
        &executed.result,
        installer_name,
        receipt_in.as_ref(),
        task_type,
    )?;
    retire(oc, meta, &isub)?;

    Ok(InstallOutcome {
        strategy: selection.strategy,
        patched: false,
        receipt: outcome.receipt,
        removed_ghosts: outcome.removed_ghosts,
    })
}

fn read_previous_receipt(install_folder: &Path) -> Option<Receipt> {
    match read_receipt(install_folder) {
        Ok(Some(receipt)) => Some(receipt),
        Ok(None) => {
            info!("no receipt found");
            None
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "could not read existing receipt");
            None
        }
    }
}

fn ensure_download_session(
    oc: &OperationContext,
    isub: &mut InstallSubState,
    api: &dyn PackageApi,
    params: &InstallParams,
) -> Result<Option<String>, OperationError> {
    if let Some(session) = &isub.download_session_id {
        info!(session = %session, "resuming download session");
        return Ok(Some(session.clone()));
    }

    oc.cancel().check("download session").step("prepare")?;
    let session = api
        .new_download_session(params.game.id, params.credentials.download_key)
        .step("download session")?;
    info!(session = %session, "starting fresh download session");
    isub.download_session_id = Some(session.clone());
    oc.save(isub)?;
    oc.checkpoint(Checkpoint::DownloadSessionCreated)
        .step("download session")?;
    Ok(Some(session))
}

/// Returns the patched manifest, or `None` when the operation should heal.
fn try_patch(
    engine: &Engine,
    oc: &OperationContext,
    api: &dyn PackageApi,
    params: &InstallParams,
    plan: &PatchPlan,
    receipt_in: &Receipt,
    session_id: Option<&str>,
) -> Result<Option<InstallResult>, OperationError> {
    let Some(patcher) = &engine.patcher else {
        info!("patching is not available, healing instead");
        return Ok(None);
    };

    oc.cancel().check("update").step("update")?;
    let target = &params.target();
    info!(from = plan.from_build_id, to = plan.to_build_id, "applying upgrade path");
    oc.notify(Notification::TaskStarted(TaskStartedNotification {
        reason: TaskReason::Install,
        task_type: TaskType::Update,
        game: Some(target.game.clone()),
        upload: Some(target.upload.clone()),
        build: target.build.clone(),
        total_size: plan.total_patch_size,
    }));

    oc.progress().start(plan.total_patch_size);
    let applied = patcher.apply(PatchRequest {
        target,
        plan,
        receipt_in,
        install_folder: &params.install_folder,
        stage_folder: oc.stage_folder(),
        download_session_id: session_id,
        download_key: params.credentials.download_key,
        api,
        cancel: oc.cancel(),
        progress: oc.progress(),
    });
    oc.progress().end();

    match applied {
        Ok(result) => Ok(Some(result)),
        Err(err) if cancellation_in(&err).is_some() => {
            Err(OperationError::from_step("update", err))
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "patching failed, falling back to heal");
            Ok(None)
        }
    }
}

fn finish(
    oc: &OperationContext,
    target: &InstallTarget,
    install_folder: &Path,
    result: &InstallResult,
    installer_name: &str,
    receipt_in: Option<&Receipt>,
    task_type: TaskType,
) -> Result<CommitOutcome, OperationError> {
    oc.cancel().check("commit").step("commit")?;
    let outcome = commit_install(CommitRequest {
        install_folder,
        target,
        result,
        installer_name,
        receipt_in,
    })
    .step("commit")?;
    if !outcome.removed_ghosts.is_empty() {
        info!(count = outcome.removed_ghosts.len(), "removed ghost files");
    }

    oc.notify(Notification::TaskSucceeded(TaskSucceededNotification {
        task_type,
        install_result: Some(InstalledTarget {
            game: target.game.clone(),
            upload: target.upload.clone(),
            build: target.build.clone(),
        }),
    }));
    Ok(outcome)
}

fn retire(
    oc: OperationContext,
    meta: &MetaSubState,
    isub: &InstallSubState,
) -> Result<(), OperationError> {
    info!("install successful, retiring context");
    let live: [&dyn RecordState; 2] = [meta, isub];
    oc.retire(&live)?;
    Ok(())
}

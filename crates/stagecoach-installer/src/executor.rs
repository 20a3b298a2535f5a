use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use stagecoach_core::{
    FormatInfo, InstallResult, InstallTarget, Notification, Receipt, TaskReason,
    TaskStartedNotification, TaskType,
};

use crate::acquire::force_local;
use crate::backend::{BackendError, BackendRegistry, InstallBackend, InstallParams};
use crate::context::{Checkpoint, OperationContext};
use crate::fs_utils::move_file_or_copy;
use crate::layout::sanitize_file_name;
use crate::probe::FormatProber;
use crate::source::{ByteSource, LocalSource};
use crate::state::InstallSubState;
use crate::{InstallFolderLayout, StagingLayout};

pub struct ExecutionRequest<'a> {
    pub target: &'a InstallTarget,
    pub install_folder: &'a Path,
    pub receipt_in: Option<&'a Receipt>,
    /// Task type announced when a backend starts: install or heal.
    pub task_type: TaskType,
    /// A single installed file is never treated as a nested installer.
    pub ignore_installers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub result: InstallResult,
    /// Format of the package whose backend produced `result`.
    pub installer: FormatInfo,
}

/// Runs the install backend, then at most one nested installer found inside
/// its output. Every intermediate result is cached in `InstallSubState`, so a
/// resumed operation skips whatever already completed.
pub struct InstallExecutor<'a> {
    registry: &'a BackendRegistry,
    prober: &'a dyn FormatProber,
}

impl<'a> InstallExecutor<'a> {
    pub fn new(registry: &'a BackendRegistry, prober: &'a dyn FormatProber) -> Self {
        Self { registry, prober }
    }

    pub fn execute(
        &self,
        oc: &OperationContext,
        isub: &mut InstallSubState,
        mut source: Box<dyn ByteSource>,
        request: &ExecutionRequest<'_>,
    ) -> Result<ExecutionOutcome> {
        let installer = isub
            .installer_info
            .filter(FormatInfo::is_known)
            .context("install source must be probed before installing")?;
        let backend = self.backend_for(&installer)?;

        let first = if let Some(cached) = isub.first_install_result.clone() {
            info!(files = cached.files.len(), "first install already done, reusing result");
            cached
        } else {
            let attempt = self.try_install(oc, &*backend, source.as_mut(), installer, request);
            let result = match attempt {
                Err(BackendError::NeedsLocal) => {
                    info!(backend = backend.name(), "backend needs a local source");
                    let mut local = force_local(oc, isub, source.as_mut(), request.target)?;
                    info!("re-invoking backend with local file");
                    match self.try_install(oc, &*backend, local.as_mut(), installer, request) {
                        Err(BackendError::NeedsLocal) => Err(BackendError::Failed(anyhow!(
                            "{} backend still needs a local source after copying it locally",
                            backend.name()
                        ))),
                        other => other,
                    }
                }
                other => other,
            };
            let result = result.map_err(into_anyhow)?;
            isub.first_install_result = Some(result.clone());
            oc.save(isub)?;
            oc.checkpoint(Checkpoint::FirstInstallDone)?;
            result
        };
        drop(source);

        let Some(single) = first.single_file() else {
            return Ok(ExecutionOutcome {
                result: first,
                installer,
            });
        };

        let nested = match isub.nested_installer_info {
            Some(cached) => cached,
            None => {
                let Some(path) = InstallFolderLayout::new(request.install_folder).resolve(single)
                else {
                    return Ok(ExecutionOutcome {
                        result: first,
                        installer,
                    });
                };
                let probed = LocalSource::open(&path)
                    .and_then(|mut single_source| self.prober.probe(&mut single_source));
                let probed = match probed {
                    Ok(info) if request.ignore_installers => info.ignoring_installers(),
                    Ok(info) => info,
                    Err(err) => {
                        info!(
                            file = %single,
                            error = %format!("{err:#}"),
                            "could not probe single installed file, keeping it as installed"
                        );
                        return Ok(ExecutionOutcome {
                            result: first,
                            installer,
                        });
                    }
                };
                isub.nested_installer_info = Some(probed);
                oc.save(isub)?;
                oc.checkpoint(Checkpoint::NestedInstallerInfoCached)?;
                probed
            }
        };

        if !nested.is_native_installer() {
            info!(file = %single, format = %nested, "single installed file is not an installer");
            return Ok(ExecutionOutcome {
                result: first,
                installer,
            });
        }

        info!(file = %single, format = %nested, "installing nested installer");
        let nested_backend = self.backend_for(&nested)?;
        let nested_path =
            relocate_nested_source(oc.stage_folder(), request.install_folder, single)?;
        let mut nested_source: Box<dyn ByteSource> = Box::new(LocalSource::open(nested_path)?);
        let attempt =
            self.try_install(oc, &*nested_backend, nested_source.as_mut(), nested, request);
        let result = match attempt {
            Err(BackendError::NeedsLocal) => Err(anyhow!(
                "{} backend refused a local nested installer",
                nested_backend.name()
            )),
            other => other.map_err(into_anyhow),
        }?;

        Ok(ExecutionOutcome {
            result,
            installer: nested,
        })
    }

    fn backend_for(&self, format: &FormatInfo) -> Result<std::sync::Arc<dyn InstallBackend>> {
        self.registry
            .for_format(format)
            .ok_or_else(|| anyhow!("no install backend handles {format} packages"))
    }

    fn try_install(
        &self,
        oc: &OperationContext,
        backend: &dyn InstallBackend,
        source: &mut dyn ByteSource,
        format: FormatInfo,
        request: &ExecutionRequest<'_>,
    ) -> Result<InstallResult, BackendError> {
        oc.cancel().check("install")?;
        let total_size = source.size();
        oc.notify(Notification::TaskStarted(TaskStartedNotification {
            reason: TaskReason::Install,
            task_type: request.task_type,
            game: Some(request.target.game.clone()),
            upload: Some(request.target.upload.clone()),
            build: request.target.build.clone(),
            total_size,
        }));
        info!(
            backend = backend.name(),
            source = source.name(),
            size = %indicatif::HumanBytes(total_size),
            "running install backend"
        );

        oc.progress().start(total_size);
        let result = backend.install(InstallParams {
            source,
            format,
            stage_folder: oc.stage_folder(),
            install_folder: request.install_folder,
            receipt_in: request.receipt_in,
            cancel: oc.cancel(),
            progress: oc.progress(),
        });
        oc.progress().end();
        result
    }
}

fn into_anyhow(err: BackendError) -> anyhow::Error {
    match err {
        BackendError::Failed(err) => err,
        other => other.into(),
    }
}

/// Moves the single installed file out of the install folder so the nested
/// installer can write there. Finding it already moved means an earlier
/// attempt got this far.
fn relocate_nested_source(
    stage_folder: &Path,
    install_folder: &Path,
    single: &str,
) -> Result<PathBuf> {
    let base = single.rsplit('/').next().unwrap_or(single);
    let file_name = sanitize_file_name(base).unwrap_or_else(|| "nested-installer".to_string());
    let dest = StagingLayout::new(stage_folder).nested_install_source_path(&file_name);

    if dest.is_file() {
        info!(path = %dest.display(), "nested installer already relocated");
        return Ok(dest);
    }

    let src = InstallFolderLayout::new(install_folder)
        .resolve(single)
        .ok_or_else(|| anyhow!("single installed file '{single}' is outside the install folder"))?;
    if !src.is_file() {
        warn!(path = %src.display(), "single installed file is missing");
        return Err(anyhow!(
            "nested installer {} is neither installed nor staged",
            src.display()
        ));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    move_file_or_copy(&src, &dest)?;
    Ok(dest)
}

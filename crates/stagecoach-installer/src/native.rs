use anyhow::{anyhow, Result};
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tracing::info;

use stagecoach_core::{FormatSubtype, InstallResult};

use crate::backend::{BackendError, InstallBackend, InstallParams};
use crate::command::{run_command, CommandRunner};
use crate::fs_utils::list_files_relative;
use crate::layout::INSTALL_STATE_DIR;

/// Runs a Windows installer (MSI, Inno Setup, NSIS) silently, targeting the
/// install folder, and reports whatever ends up in it.
pub struct NativeInstallerBackend {
    subtype: FormatSubtype,
    runner: Arc<CommandRunner>,
    require_windows_host: bool,
}

impl NativeInstallerBackend {
    pub fn new(subtype: FormatSubtype) -> Self {
        Self {
            subtype,
            runner: Arc::new(run_command),
            require_windows_host: true,
        }
    }

    pub fn with_runner(subtype: FormatSubtype, runner: Arc<CommandRunner>) -> Self {
        Self {
            subtype,
            runner,
            require_windows_host: false,
        }
    }
}

impl InstallBackend for NativeInstallerBackend {
    fn name(&self) -> &str {
        self.subtype.as_str()
    }

    fn install(&self, params: InstallParams<'_>) -> Result<InstallResult, BackendError> {
        let Some(installer_path) = params.source.local_path().map(Path::to_path_buf) else {
            return Err(BackendError::NeedsLocal);
        };
        self.install_local(&installer_path, &params)
            .map_err(BackendError::from_anyhow)
    }
}

impl NativeInstallerBackend {
    fn install_local(&self, installer_path: &Path, params: &InstallParams<'_>) -> Result<InstallResult> {
        if self.require_windows_host && !cfg!(windows) {
            return Err(anyhow!(
                "{} installers are supported only on Windows hosts",
                self.subtype.as_str()
            ));
        }
        fs::create_dir_all(params.install_folder)?;

        let mut command =
            build_native_install_command(self.subtype, installer_path, params.install_folder)?;
        let context_message = format!("failed to run {} installer", self.subtype.as_str());
        params.progress.set_fraction(0.0);
        (self.runner)(&mut command, &context_message, params.cancel).map_err(|err| {
            if error_chain_has_not_found(&err) {
                return err.context(format!(
                    "installer command was not found: {command:?}"
                ));
            }
            err
        })?;
        params.progress.set_fraction(1.0);

        let files = list_files_relative(params.install_folder, &[INSTALL_STATE_DIR])?;
        info!(
            installer = self.subtype.as_str(),
            files = files.len(),
            "native installer finished"
        );
        Ok(InstallResult::new(files))
    }
}

pub(crate) fn build_native_install_command(
    subtype: FormatSubtype,
    installer_path: &Path,
    install_folder: &Path,
) -> Result<Command> {
    let command = match subtype {
        FormatSubtype::Msi => build_msi_install_command(installer_path, install_folder),
        FormatSubtype::Inno => build_inno_install_command(installer_path, install_folder),
        FormatSubtype::Nsis => build_nsis_install_command(installer_path, install_folder),
        other => {
            return Err(anyhow!(
                "'{}' is not a native installer format",
                other.as_str()
            ));
        }
    };
    Ok(command)
}

pub(crate) fn build_msi_install_command(installer_path: &Path, install_folder: &Path) -> Command {
    let mut command = Command::new("msiexec");
    command
        .arg("/i")
        .arg(installer_path)
        .arg("/qn")
        .arg("/norestart")
        .arg(format!("TARGETDIR={}", install_folder.display()))
        .arg(format!("INSTALLDIR={}", install_folder.display()));
    command
}

pub(crate) fn build_inno_install_command(installer_path: &Path, install_folder: &Path) -> Command {
    let mut command = Command::new(installer_path);
    command
        .arg("/VERYSILENT")
        .arg("/SUPPRESSMSGBOXES")
        .arg("/NORESTART")
        .arg(format!("/DIR={}", install_folder.display()));
    command
}

/// NSIS wants `/D=` last and unquoted, even with spaces in the path.
pub(crate) fn build_nsis_install_command(installer_path: &Path, install_folder: &Path) -> Command {
    let mut command = Command::new(installer_path);
    command
        .arg("/S")
        .arg(format!("/D={}", install_folder.display()));
    command
}

fn error_chain_has_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound)
    })
}

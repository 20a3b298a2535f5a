use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use stagecoach_core::{Build, Game, GameCredentials, InstallTarget, Upload};
use stagecoach_installer::Subcontext;

use crate::error::OperationError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Install,
    Uninstall,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallParams {
    pub game: Game,
    pub upload: Upload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,
    pub install_folder: PathBuf,
    #[serde(default)]
    pub credentials: GameCredentials,
    /// Treat anything that is not an archive as a file to copy as-is.
    #[serde(default)]
    pub ignore_installers: bool,
}

impl InstallParams {
    pub fn target(&self) -> InstallTarget {
        InstallTarget {
            game: self.game.clone(),
            upload: self.upload.clone(),
            build: self.build.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UninstallParams {
    pub install_folder: PathBuf,
}

/// Inbound `Start` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    pub id: String,
    pub staging_folder: PathBuf,
    #[serde(default)]
    pub operation: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_params: Option<InstallParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall_params: Option<UninstallParams>,
}

impl StartParams {
    pub fn install(id: &str, staging_folder: impl Into<PathBuf>, params: InstallParams) -> Self {
        Self {
            id: id.to_string(),
            staging_folder: staging_folder.into(),
            operation: OperationKind::Install,
            install_params: Some(params),
            uninstall_params: None,
        }
    }

    pub fn uninstall(
        id: &str,
        staging_folder: impl Into<PathBuf>,
        install_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.to_string(),
            staging_folder: staging_folder.into(),
            operation: OperationKind::Uninstall,
            install_params: None,
            uninstall_params: Some(UninstallParams {
                install_folder: install_folder.into(),
            }),
        }
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        if self.id.trim().is_empty() {
            return Err(OperationError::InvalidParams(
                "operation id must not be empty".to_string(),
            ));
        }
        if self.staging_folder.as_os_str().is_empty() {
            return Err(OperationError::InvalidParams(
                "no staging folder specified".to_string(),
            ));
        }
        match self.operation {
            OperationKind::Install => {
                let params = self.install_params.as_ref().ok_or_else(|| {
                    OperationError::InvalidParams("install operation needs installParams".into())
                })?;
                if params.install_folder.as_os_str().is_empty() {
                    return Err(OperationError::InvalidParams(
                        "no install folder specified".to_string(),
                    ));
                }
            }
            OperationKind::Uninstall => {
                let params = self.uninstall_params.as_ref().ok_or_else(|| {
                    OperationError::InvalidParams(
                        "uninstall operation needs uninstallParams".into(),
                    )
                })?;
                if params.install_folder.as_os_str().is_empty() {
                    return Err(OperationError::InvalidParams(
                        "no install folder specified".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Start parameters as flushed to the staging folder, so a resumed operation
/// can be inspected and checked against the request that created it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetaSubState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StartParams>,
}

impl Subcontext for MetaSubState {
    const NAME: &'static str = "meta";
}

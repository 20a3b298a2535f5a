use serde::{Deserialize, Serialize};

use stagecoach_core::{FormatInfo, InstallResult, Strategy};

use crate::staging::Subcontext;

/// Install progress that must survive a restart. Each field is written once
/// and reused on resume; nothing here is recomputed unless `reset_for`
/// starts over for a different strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallSubState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_session_id: Option<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub is_available_locally: bool,
    #[serde(default)]
    pub installer_info: Option<FormatInfo>,
    #[serde(default)]
    pub nested_installer_info: Option<FormatInfo>,
    #[serde(default)]
    pub first_install_result: Option<InstallResult>,
}

impl Subcontext for InstallSubState {
    const NAME: &'static str = "install";
}

impl InstallSubState {
    /// Drops cached install results when the strategy changed between runs.
    /// The download session and the local copy describe the same upload and
    /// are kept.
    pub fn reset_for(&mut self, strategy: Strategy) -> bool {
        if self.strategy == Some(strategy) {
            return false;
        }
        let had_progress = self.strategy.is_some();
        self.strategy = Some(strategy);
        self.nested_installer_info = None;
        self.first_install_result = None;
        had_progress
    }
}

use anyhow::Result;
use std::path::Path;

use stagecoach_api::PackageApi;
use stagecoach_core::{InstallResult, InstallTarget, Receipt};
use stagecoach_installer::{CancelToken, ProgressBridge};

use crate::strategy::PatchPlan;

pub struct PatchRequest<'a> {
    pub target: &'a InstallTarget,
    pub plan: &'a PatchPlan,
    pub receipt_in: &'a Receipt,
    pub install_folder: &'a Path,
    pub stage_folder: &'a Path,
    pub download_session_id: Option<&'a str>,
    pub download_key: Option<i64>,
    pub api: &'a dyn PackageApi,
    pub cancel: &'a CancelToken,
    pub progress: &'a ProgressBridge,
}

/// Applies an upgrade path to an install folder in place. Returns the full
/// manifest of the upgraded folder. Any failure other than cancellation
/// makes the operation heal instead, so a patcher never needs to leave the
/// folder consistent after an error.
pub trait Patcher: Send + Sync {
    fn apply(&self, request: PatchRequest<'_>) -> Result<InstallResult>;
}

mod config;
mod engine;
mod error;
mod operations;
mod params;
mod patch;
mod perform;
mod strategy;
mod uninstall;

pub use config::{ApiConfig, EngineConfig, InstallConfig, ProgressConfig};
pub use engine::{Engine, InstallOutcome, OperationOutcome};
pub use error::OperationError;
pub use operations::Operations;
pub use params::{InstallParams, MetaSubState, OperationKind, StartParams, UninstallParams};
pub use patch::{PatchRequest, Patcher};
pub use strategy::{
    compare_target, patch_is_cheaper, select_strategy, PatchPlan, Selection, TargetChange,
};

#[cfg(test)]
mod tests;

mod catalog;
mod code;
mod format;
mod notification;
mod receipt;
mod strategy;
mod upgrade;

pub use catalog::{
    Build, Game, GameCredentials, InstallTarget, Upload, UploadStorage, DEFAULT_SERVER,
};
pub use code::ErrorCode;
pub use format::{FormatInfo, FormatKind, FormatSubtype};
pub use notification::{
    InstalledTarget, Notification, ProgressNotification, TaskReason, TaskStartedNotification,
    TaskSucceededNotification, TaskType,
};
pub use receipt::{InstallResult, Receipt};
pub use strategy::Strategy;
pub use upgrade::{UpgradePath, UpgradePathItem};

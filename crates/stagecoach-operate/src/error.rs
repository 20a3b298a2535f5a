use stagecoach_core::{ErrorCode, FormatInfo};
use stagecoach_installer::{cancellation_in, StagingError};

/// Terminal outcome of a failed operation. Callers branch on the variant or
/// on [`OperationError::code`], never on the message.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("item is packaged in a way that isn't supported ({format})")]
    UnsupportedPackaging { format: FormatInfo },
    #[error("operation cancelled during {step}")]
    Cancelled { step: String },
    #[error("operation aborted")]
    Aborted,
    #[error("operation '{id}' is already running")]
    AlreadyRunning { id: String },
    #[error("invalid start parameters: {0}")]
    InvalidParams(String),
    #[error("staging state is inconsistent, discard the staging folder to start over: {source}")]
    StagingInconsistent {
        #[source]
        source: StagingError,
    },
    #[error("{step} failed: {source:#}")]
    Failed {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl OperationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Cancelled { .. } => ErrorCode::OperationCancelled,
            Self::Aborted => ErrorCode::OperationAborted,
            Self::UnsupportedPackaging { .. } => ErrorCode::UnsupportedPackaging,
            Self::AlreadyRunning { .. }
            | Self::InvalidParams(_)
            | Self::StagingInconsistent { .. }
            | Self::Failed { .. } => ErrorCode::OperationFailed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Aborted)
    }

    /// Sorts an error raised while running `step` into the taxonomy:
    /// cancellations and untrustworthy staging state keep their own kinds,
    /// operation errors raised deeper down pass through unchanged.
    pub fn from_step(step: &'static str, err: anyhow::Error) -> Self {
        if let Some(cancelled) = cancellation_in(&err) {
            return Self::Cancelled {
                step: cancelled.step.clone(),
            };
        }
        let err = match err.downcast::<OperationError>() {
            Ok(op) => return op,
            Err(err) => err,
        };
        match err.downcast::<StagingError>() {
            Ok(staging) if staging.is_inconsistency() => Self::StagingInconsistent { source: staging },
            Ok(staging) => Self::Failed {
                step,
                source: staging.into(),
            },
            Err(err) => Self::Failed { step, source: err },
        }
    }
}

impl From<StagingError> for OperationError {
    fn from(err: StagingError) -> Self {
        Self::from_step("staging", err.into())
    }
}

/// Tags a step's failure with the step name on its way into the taxonomy.
pub(crate) trait StepResultExt<T> {
    fn step(self, step: &'static str) -> Result<T, OperationError>;
}

impl<T, E: Into<anyhow::Error>> StepResultExt<T> for Result<T, E> {
    fn step(self, step: &'static str) -> Result<T, OperationError> {
        self.map_err(|err| OperationError::from_step(step, err.into()))
    }
}

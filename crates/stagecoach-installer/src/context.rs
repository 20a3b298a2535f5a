use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use stagecoach_core::Notification;

use crate::cancel::CancelToken;
use crate::progress::{Notifier, ProgressBridge};
use crate::staging::{RecordState, StagingError, StagingStore, Subcontext};

/// Points right after a piece of install state has been flushed. Hooks run
/// there so tests can stop an operation exactly where a crash would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    DownloadSessionCreated,
    InstallerInfoCached,
    SourceAvailableLocally,
    FirstInstallDone,
    NestedInstallerInfoCached,
}

type CheckpointHook = dyn Fn(Checkpoint) -> Result<()> + Send + Sync;

#[derive(Clone, Default)]
pub struct OperationHooks {
    after_checkpoint: Option<Arc<CheckpointHook>>,
}

impl OperationHooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after_checkpoint<F>(hook: F) -> Self
    where
        F: Fn(Checkpoint) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            after_checkpoint: Some(Arc::new(hook)),
        }
    }

    fn fire(&self, checkpoint: Checkpoint) -> Result<()> {
        match &self.after_checkpoint {
            Some(hook) => hook(checkpoint),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for OperationHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHooks")
            .field("after_checkpoint", &self.after_checkpoint.is_some())
            .finish()
    }
}

/// Everything one running operation shares across its steps: durable
/// staging, cancellation, and the notification channel.
pub struct OperationContext {
    store: StagingStore,
    cancel: CancelToken,
    notifier: Arc<dyn Notifier>,
    progress: ProgressBridge,
    hooks: OperationHooks,
}

impl OperationContext {
    pub fn open(
        operation_id: &str,
        staging_folder: &Path,
        cancel: CancelToken,
        notifier: Arc<dyn Notifier>,
        progress_interval: Duration,
        hooks: OperationHooks,
    ) -> Result<Self, StagingError> {
        let store = StagingStore::open(operation_id, staging_folder)?;
        let progress = ProgressBridge::new(Arc::clone(&notifier), progress_interval);
        Ok(Self {
            store,
            cancel,
            notifier,
            progress,
            hooks,
        })
    }

    pub fn operation_id(&self) -> &str {
        self.store.operation_id()
    }

    pub fn stage_folder(&self) -> &Path {
        self.store.layout().root()
    }

    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn progress(&self) -> &ProgressBridge {
        &self.progress
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }

    /// Loads a subcontext, defaulting when it was never saved.
    pub fn load<T: Subcontext>(&self) -> Result<T, StagingError> {
        Ok(self.store.load::<T>()?.unwrap_or_default())
    }

    pub fn save<T: Subcontext>(&self, record: &T) -> Result<(), StagingError> {
        debug!(record = T::NAME, "flushing");
        self.store.save(record)
    }

    pub fn checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        debug!(?checkpoint, "checkpoint");
        self.hooks.fire(checkpoint)
    }

    pub fn retire(self, live: &[&dyn RecordState]) -> Result<(), StagingError> {
        self.store.retire(live)
    }
}

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use stagecoach_core::{FormatInfo, FormatSubtype, InstallResult, Receipt};

use crate::cancel::{cancellation_in, CancelToken, Cancelled};
use crate::progress::ProgressBridge;
use crate::source::ByteSource;
use crate::{ArchiveBackend, NakedBackend, NativeInstallerBackend};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend cannot work from this source as given and needs a fully
    /// local, seekable copy.
    #[error("backend needs a local copy of the install source")]
    NeedsLocal,
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl BackendError {
    /// Keeps cancellations recognizable when they surface through an
    /// `anyhow` chain, e.g. from a killed child process.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match cancellation_in(&err) {
            Some(cancelled) => Self::Cancelled(cancelled.clone()),
            None => Self::Failed(err),
        }
    }
}

pub struct InstallParams<'a> {
    pub source: &'a mut dyn ByteSource,
    pub format: FormatInfo,
    pub stage_folder: &'a Path,
    pub install_folder: &'a Path,
    /// Prior receipt when healing; backends may use it to skip files that
    /// are already correct.
    pub receipt_in: Option<&'a Receipt>,
    pub cancel: &'a CancelToken,
    pub progress: &'a ProgressBridge,
}

/// Installs one kind of package into an install folder.
pub trait InstallBackend: Send + Sync {
    fn name(&self) -> &str;
    fn install(&self, params: InstallParams<'_>) -> Result<InstallResult, BackendError>;
}

/// Backends keyed by installer name (see `FormatInfo::installer_name`).
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn InstallBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend this crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(ArchiveBackend::new()))
            .register(Arc::new(NakedBackend::new()));
        for subtype in [FormatSubtype::Msi, FormatSubtype::Inno, FormatSubtype::Nsis] {
            registry.register(Arc::new(NativeInstallerBackend::new(subtype)));
        }
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn InstallBackend>) -> &mut Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InstallBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn for_format(&self, format: &FormatInfo) -> Option<Arc<dyn InstallBackend>> {
        format.installer_name().and_then(|name| self.get(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use stagecoach_api::{ApiConnector, HttpConnector, HttpSourceOpener};
use stagecoach_core::{Receipt, Strategy};
use stagecoach_installer::{
    BackendRegistry, CancelToken, FormatProber, MagicProber, Notifier, OperationContext,
    OperationHooks, SourceOpener, UninstallResult,
};

use crate::config::EngineConfig;
use crate::error::{OperationError, StepResultExt};
use crate::params::{MetaSubState, OperationKind, StartParams};
use crate::patch::Patcher;
use crate::{perform, uninstall};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub strategy: Strategy,
    /// The folder was upgraded by patching rather than by running a backend.
    pub patched: bool,
    pub receipt: Receipt,
    pub removed_ghosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Installed(InstallOutcome),
    Uninstalled(UninstallResult),
}

/// Collaborators every operation runs against. Built once at startup and
/// shared by all operations.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) connector: Arc<dyn ApiConnector>,
    pub(crate) opener: Arc<dyn SourceOpener>,
    pub(crate) prober: Arc<dyn FormatProber>,
    pub(crate) registry: BackendRegistry,
    pub(crate) patcher: Option<Arc<dyn Patcher>>,
    pub(crate) hooks: OperationHooks,
}

impl Engine {
    /// HTTP collaborators, magic-number probing and the stock backends.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let settings = config.api_settings();
        let opener = HttpSourceOpener::new(&settings)?;
        Ok(Self {
            connector: Arc::new(HttpConnector::new(settings)),
            opener: Arc::new(opener),
            prober: Arc::new(MagicProber::new(config.install.probe_limit_bytes)),
            registry: BackendRegistry::with_defaults(),
            patcher: None,
            hooks: OperationHooks::none(),
            config,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn ApiConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_source_opener(mut self, opener: Arc<dyn SourceOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn FormatProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_patcher(mut self, patcher: Arc<dyn Patcher>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    pub fn with_hooks(mut self, hooks: OperationHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one operation to its terminal state. Staging is retired only on
    /// success; every failure leaves it in place for a resumed run.
    pub fn run(
        &self,
        params: &StartParams,
        cancel: CancelToken,
        notifier: Arc<dyn Notifier>,
    ) -> Result<OperationOutcome, OperationError> {
        params.validate()?;
        info!(
            operation = %params.id,
            kind = ?params.operation,
            stage = %params.staging_folder.display(),
            "starting operation"
        );

        let oc = OperationContext::open(
            &params.id,
            &params.staging_folder,
            cancel,
            notifier,
            self.config.progress_interval(),
            self.hooks.clone(),
        )?;

        let mut meta: MetaSubState = oc.load()?;
        match &meta.params {
            Some(stored) if !same_request(stored, params) => {
                return Err(OperationError::InvalidParams(format!(
                    "staging folder {} was started for a different request",
                    params.staging_folder.display()
                )));
            }
            Some(stored) if stored != params => {
                info!("start parameters changed since the last attempt, refreshing");
                meta.params = Some(params.clone());
                oc.save(&meta).step("prepare")?;
            }
            Some(_) => info!("resuming operation"),
            None => {
                meta.params = Some(params.clone());
                oc.save(&meta).step("prepare")?;
            }
        }

        let outcome = match params.operation {
            OperationKind::Install => {
                let install = params.install_params.as_ref().ok_or_else(|| {
                    OperationError::InvalidParams("install operation needs installParams".into())
                })?;
                perform::install_perform(self, oc, &meta, install).map(OperationOutcome::Installed)
            }
            OperationKind::Uninstall => {
                let target = params.uninstall_params.as_ref().ok_or_else(|| {
                    OperationError::InvalidParams(
                        "uninstall operation needs uninstallParams".into(),
                    )
                })?;
                uninstall::uninstall_perform(oc, &meta, target).map(OperationOutcome::Uninstalled)
            }
        };

        if let Err(err) = &outcome {
            warn!(
                operation = %params.id,
                code = err.code().value(),
                error = %err,
                "operation did not complete, staging kept for resume"
            );
        }
        outcome
    }
}

/// Same operation kind, target and folder. Credentials may be refreshed
/// between attempts.
fn same_request(stored: &StartParams, requested: &StartParams) -> bool {
    if stored.operation != requested.operation {
        return false;
    }
    match (&stored.install_params, &requested.install_params) {
        (Some(a), Some(b)) => {
            if a.install_folder != b.install_folder
                || a.upload.id != b.upload.id
                || a.build.as_ref().map(|build| build.id) != b.build.as_ref().map(|build| build.id)
            {
                return false;
            }
        }
        (None, None) => {}
        _ => return false,
    }
    match (&stored.uninstall_params, &requested.uninstall_params) {
        (Some(a), Some(b)) => a.install_folder == b.install_folder,
        (None, None) => true,
        _ => false,
    }
}

use serde::{Deserialize, Serialize};

/// How an operation brings the install folder to its target.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    None,
    /// Fresh install; the folder holds nothing we need to reconcile with.
    Install,
    /// Reconcile the folder against a prior receipt. Used for reinstalls,
    /// downgrades and upgrades that patching cannot serve.
    Heal,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Install => "install",
            Self::Heal => "heal",
        }
    }
}

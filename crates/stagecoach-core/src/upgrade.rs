use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePathItem {
    pub id: i64,
    #[serde(default)]
    pub user_version: String,
    #[serde(default)]
    pub patch_size: u64,
}

/// Ordered patch steps leading from an installed build to a newer one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePath {
    #[serde(default)]
    pub upgrade_path: Vec<UpgradePathItem>,
}

impl UpgradePath {
    pub fn new(items: Vec<UpgradePathItem>) -> Self {
        Self {
            upgrade_path: items,
        }
    }

    /// Steps that actually need patching. The server may echo the currently
    /// installed build as the first item; it costs nothing to apply.
    pub fn steps_from(&self, current_build_id: i64) -> impl Iterator<Item = &UpgradePathItem> {
        self.upgrade_path
            .iter()
            .filter(move |item| item.id != current_build_id)
    }

    /// Saturates, so an absurd chain never looks cheaper than a full download.
    pub fn total_patch_size(&self, current_build_id: i64) -> u64 {
        self.steps_from(current_build_id)
            .fold(0_u64, |total, item| total.saturating_add(item.patch_size))
    }
}

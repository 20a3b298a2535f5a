use indicatif::HumanBytes;
use tracing::{info, warn};

use stagecoach_api::PackageApi;
use stagecoach_core::{InstallTarget, Receipt, Strategy, UpgradePath};

/// How the requested target relates to what the receipt says is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChange {
    /// Nothing installed, a different upload, or builds we cannot compare.
    Fresh,
    Reinstall { build_id: i64 },
    Downgrade { from: i64, to: i64 },
    Upgrade { from: i64, to: i64 },
}

pub fn compare_target(receipt_in: Option<&Receipt>, target: &InstallTarget) -> TargetChange {
    let Some(receipt) = receipt_in else {
        return TargetChange::Fresh;
    };
    if receipt.upload_id() != Some(target.upload.id) {
        return TargetChange::Fresh;
    }
    let (Some(from), Some(to)) = (receipt.build_id(), target.build.as_ref().map(|b| b.id)) else {
        return TargetChange::Fresh;
    };
    match to.cmp(&from) {
        std::cmp::Ordering::Greater => TargetChange::Upgrade { from, to },
        std::cmp::Ordering::Less => TargetChange::Downgrade { from, to },
        std::cmp::Ordering::Equal => TargetChange::Reinstall { build_id: to },
    }
}

/// An upgrade that patching may serve instead of a heal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    pub from_build_id: i64,
    pub to_build_id: i64,
    pub upgrade_path: UpgradePath,
    pub total_patch_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub strategy: Strategy,
    /// Present when patching is worth trying first. `strategy` is what runs
    /// if patching is unavailable or fails.
    pub patch: Option<PatchPlan>,
}

impl Selection {
    fn plain(strategy: Strategy) -> Self {
        Self {
            strategy,
            patch: None,
        }
    }
}

/// Patching wins only when the chain is no larger than the full package.
pub fn patch_is_cheaper(total_patch_size: u64, full_size: u64) -> bool {
    total_patch_size <= full_size
}

/// Picks a strategy for bringing the install folder to `target`. Only an
/// upgrade queries the server; every failure along that path heals.
pub fn select_strategy(
    receipt_in: Option<&Receipt>,
    target: &InstallTarget,
    download_key: Option<i64>,
    api: &dyn PackageApi,
) -> Selection {
    match compare_target(receipt_in, target) {
        TargetChange::Fresh => Selection::plain(Strategy::Install),
        TargetChange::Reinstall { build_id } => {
            info!(build = build_id, "re-installing build");
            Selection::plain(Strategy::Heal)
        }
        TargetChange::Downgrade { from, to } => {
            info!(from, to, "downgrading build");
            Selection::plain(Strategy::Heal)
        }
        TargetChange::Upgrade { from, to } => {
            info!(from, to, "upgrading build");
            let upgrade_path = match api.find_upgrade(from, target.upload.id, download_key) {
                Ok(path) => path,
                Err(err) => {
                    warn!(
                        error = %format!("{err:#}"),
                        "could not find upgrade path, falling back to heal"
                    );
                    return Selection::plain(Strategy::Heal);
                }
            };

            info!(items = upgrade_path.upgrade_path.len(), "found upgrade path");
            for item in upgrade_path.steps_from(from) {
                info!(build = item.id, size = %HumanBytes(item.patch_size), "upgrade step");
            }
            let total_patch_size = upgrade_path.total_patch_size(from);
            let full_size = target.upload.size;
            let cheaper = patch_is_cheaper(total_patch_size, full_size);
            info!(
                total = %HumanBytes(total_patch_size),
                full = %HumanBytes(full_size),
                comparison = if cheaper { "not larger than" } else { "larger than" },
                "weighed upgrade against full upload"
            );
            if !cheaper {
                info!("healing instead of patching");
                return Selection::plain(Strategy::Heal);
            }

            Selection {
                strategy: Strategy::Heal,
                patch: Some(PatchPlan {
                    from_build_id: from,
                    to_build_id: to,
                    upgrade_path,
                    total_patch_size,
                }),
            }
        }
    }
}

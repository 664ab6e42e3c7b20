use anyhow::{Context, Result};
use burn_core::{
    ActionState, BundleAction, PackageKind, PackageState, RelatedBundle, RelationType,
    RequestState, UserExperience,
};
use tracing::{debug, info};

use crate::calculate::{exe_actions, PackageStates};

/// The request this bundle's action implies for a related bundle.
pub fn default_related_request(
    related: &RelatedBundle,
    bundle_version: u64,
    action: BundleAction,
) -> RequestState {
    match related.relation {
        RelationType::Upgrade
            if action != BundleAction::Layout && bundle_version > related.version =>
        {
            RequestState::Absent
        }
        RelationType::Addon | RelationType::Patch => match action {
            BundleAction::Uninstall => RequestState::Absent,
            BundleAction::Repair => RequestState::Repair,
            _ => RequestState::None,
        },
        _ => RequestState::None,
    }
}

/// Addons and patches are removed before this bundle's own packages.
pub fn runs_before_chain(related: &RelatedBundle, action: BundleAction) -> bool {
    action == BundleAction::Uninstall
        && matches!(related.relation, RelationType::Addon | RelationType::Patch)
}

pub fn plan_related_bundle(
    related: &mut RelatedBundle,
    bundle_version: u64,
    action: BundleAction,
    ux: &dyn UserExperience,
) -> Result<()> {
    related.package.reset_plan();
    let default = default_related_request(related, bundle_version, action);
    let mut requested = default;
    if ux
        .on_plan_related_bundle(&related.bundle_id, &mut requested)
        .is_cancel()
    {
        return Err(burn_core::Cancelled)
            .with_context(|| format!("planning related bundle '{}'", related.bundle_id));
    }
    if requested != default {
        info!(
            bundle = %related.bundle_id,
            relation = related.relation.as_str(),
            default = default.as_str(),
            requested = requested.as_str(),
            "bootstrapper application overrode related bundle request"
        );
    }

    let package = &mut related.package;
    package.default_requested = default;
    package.requested = requested;
    let repairable = matches!(&package.kind, PackageKind::Exe(exe) if exe.repairable);
    let (execute, _) = exe_actions(
        PackageStates {
            current: PackageState::Present,
            rollback_basis: PackageState::Present,
            requested,
            uninstallable: true,
        },
        repairable,
    );
    package.execute = execute;
    package.rollback = ActionState::None;

    debug!(
        bundle = %related.bundle_id,
        relation = related.relation.as_str(),
        requested = requested.as_str(),
        execute = execute.as_str(),
        "planned related bundle"
    );
    Ok(())
}

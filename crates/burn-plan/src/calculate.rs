//! Per-package request and action calculation.

use anyhow::{Context, Result};
use burn_core::{
    evaluate_condition, ActionState, BundleAction, DependencyAction, FeatureAction, FeatureState,
    MsiFeature, MsiPackage, MspPackage, Package, PackageKind, PackageState, PackageType,
    RequestState, UserExperience, Variables,
};
use tracing::{info, warn};

/// The request an action implies for a package before conditions and the
/// application weigh in.
pub fn default_requested(package: &Package, action: BundleAction) -> RequestState {
    if action == BundleAction::Layout {
        return RequestState::Cache;
    }

    match package.current_state {
        PackageState::Superseded => {
            if action == BundleAction::Uninstall
                && package.package_type() == PackageType::Msp
                && package.uninstallable()
            {
                RequestState::Absent
            } else {
                RequestState::None
            }
        }
        PackageState::Obsolete => RequestState::None,
        _ => match action {
            BundleAction::Install => RequestState::Present,
            BundleAction::Repair => RequestState::Repair,
            BundleAction::Uninstall if package.permanent => RequestState::None,
            BundleAction::Uninstall => RequestState::Absent,
            BundleAction::Modify | BundleAction::Layout => RequestState::None,
        },
    }
}

/// An install condition only narrows a Present or Repair request; false
/// forces Absent.
pub fn apply_install_condition(requested: RequestState, condition: Option<bool>) -> RequestState {
    match (requested, condition) {
        (RequestState::Present | RequestState::Repair, Some(false)) => RequestState::Absent,
        _ => requested,
    }
}

/// Evaluates an optional authored condition, treating a missing one as
/// "no opinion".
pub fn evaluate_optional(variables: &Variables, condition: Option<&str>) -> Result<Option<bool>> {
    let Some(condition) = condition else {
        return Ok(None);
    };
    evaluate_condition(variables, condition)
        .map(Some)
        .with_context(|| format!("failed to evaluate condition '{condition}'"))
}

/// Fills `default_requested`, `requested`, execute and rollback actions and
/// dependency actions for one chain package.
pub fn plan_package(
    package: &mut Package,
    variables: &Variables,
    ux: &dyn UserExperience,
    action: BundleAction,
) -> Result<()> {
    package.reset_plan();

    let mut requested = default_requested(package, action);
    if matches!(requested, RequestState::Present | RequestState::Repair) {
        let condition = evaluate_optional(variables, package.install_condition.as_deref())
            .with_context(|| format!("install condition of package '{}'", package.id))?;
        requested = apply_install_condition(requested, condition);
    }
    package.default_requested = requested;

    let default = requested;
    if ux.on_plan_package_begin(&package.id, &mut requested).is_cancel() {
        return Err(burn_core::Cancelled)
            .with_context(|| format!("planning package '{}'", package.id));
    }
    if requested != default {
        info!(
            package = %package.id,
            default = default.as_str(),
            requested = requested.as_str(),
            "bootstrapper application changed package request"
        );
    }
    package.requested = requested;

    let (dependency_execute, dependency_rollback) = dependency_actions(package);
    package.dependency_execute = dependency_execute;
    package.dependency_rollback = dependency_rollback;

    let (execute, rollback) = match package.package_type() {
        PackageType::Exe => {
            let repairable = matches!(&package.kind, PackageKind::Exe(exe) if exe.repairable);
            exe_actions(package_states(package), repairable)
        }
        PackageType::Msi => {
            plan_msi_features(package, variables, ux)?;
            msi_actions(package)
        }
        PackageType::Msp => msp_actions(package),
        PackageType::Msu => msu_actions(package_states(package)),
    };
    package.execute = execute;
    package.rollback = if execute == ActionState::None {
        ActionState::None
    } else {
        rollback
    };

    if package.execute == ActionState::Uninstall && package.other_dependents {
        warn!(
            package = %package.id,
            "package has other dependents; skipping uninstall"
        );
        package.execute = ActionState::None;
        package.rollback = ActionState::None;
    }
    Ok(())
}

/// The inputs the EXE and MSU tables read.
#[derive(Debug, Clone, Copy)]
pub struct PackageStates {
    pub current: PackageState,
    pub rollback_basis: PackageState,
    pub requested: RequestState,
    pub uninstallable: bool,
}

fn package_states(package: &Package) -> PackageStates {
    PackageStates {
        current: package.current_state,
        rollback_basis: package.rollback_basis(),
        requested: package.requested,
        uninstallable: package.uninstallable(),
    }
}

pub fn exe_actions(states: PackageStates, repairable: bool) -> (ActionState, ActionState) {
    let execute = match states.current {
        PackageState::Present => match states.requested {
            RequestState::Repair if repairable => ActionState::Repair,
            RequestState::Absent if states.uninstallable => ActionState::Uninstall,
            _ => ActionState::None,
        },
        PackageState::Absent | PackageState::Cached | PackageState::Unknown => {
            match states.requested {
                RequestState::Present | RequestState::Repair => ActionState::Install,
                _ => ActionState::None,
            }
        }
        PackageState::Obsolete | PackageState::Superseded => ActionState::None,
    };
    (execute, simple_rollback(states))
}

pub fn msu_actions(states: PackageStates) -> (ActionState, ActionState) {
    exe_actions(states, false)
}

fn simple_rollback(states: PackageStates) -> ActionState {
    match (states.rollback_basis, states.requested) {
        (PackageState::Present, RequestState::Absent) => ActionState::Install,
        (
            PackageState::Absent | PackageState::Cached | PackageState::Unknown,
            RequestState::Present | RequestState::Repair,
        ) if states.uninstallable => ActionState::Uninstall,
        _ => ActionState::None,
    }
}

/// Requested state from the first true feature condition, in AddLocal,
/// AddSource, Advertise order.
pub fn requested_feature_state(
    feature: &MsiFeature,
    variables: &Variables,
) -> Result<FeatureState> {
    if !feature.has_conditions() {
        return Ok(FeatureState::Unknown);
    }
    let candidates = [
        (&feature.add_local_condition, FeatureState::Local),
        (&feature.add_source_condition, FeatureState::Source),
        (&feature.advertise_condition, FeatureState::Advertised),
    ];
    for (condition, state) in candidates {
        if evaluate_optional(variables, condition.as_deref())? == Some(true) {
            return Ok(state);
        }
    }
    Ok(FeatureState::Absent)
}

/// Action moving a feature from `from` to `to`. An unchanged state becomes
/// Reinstall when repairing.
pub fn feature_action(from: FeatureState, to: FeatureState, repair: bool) -> FeatureAction {
    let unchanged = if repair {
        FeatureAction::Reinstall
    } else {
        FeatureAction::None
    };
    match to {
        FeatureState::Unknown => FeatureAction::None,
        FeatureState::Absent => match from {
            FeatureState::Advertised | FeatureState::Local | FeatureState::Source => {
                FeatureAction::Remove
            }
            FeatureState::Unknown | FeatureState::Absent => FeatureAction::None,
        },
        FeatureState::Advertised if from == FeatureState::Advertised => unchanged,
        FeatureState::Advertised => FeatureAction::Advertise,
        FeatureState::Local if from == FeatureState::Local => unchanged,
        FeatureState::Local => FeatureAction::AddLocal,
        FeatureState::Source if from == FeatureState::Source => unchanged,
        FeatureState::Source => FeatureAction::AddSource,
    }
}

fn plan_msi_features(
    package: &mut Package,
    variables: &Variables,
    ux: &dyn UserExperience,
) -> Result<()> {
    let requested = package.requested;
    let PackageKind::Msi(msi) = &mut package.kind else {
        return Ok(());
    };
    if !matches!(requested, RequestState::Present | RequestState::Repair) {
        return Ok(());
    }
    let repair = requested == RequestState::Repair;

    for feature in &mut msi.features {
        let mut feature_requested = requested_feature_state(feature, variables)
            .with_context(|| {
                format!("condition of feature '{}' in package '{}'", feature.id, package.id)
            })?;
        if ux
            .on_plan_msi_feature(&package.id, &feature.id, &mut feature_requested)
            .is_cancel()
        {
            return Err(burn_core::Cancelled)
                .with_context(|| format!("planning feature '{}'", feature.id));
        }
        feature.requested = feature_requested;
        feature.execute = feature_action(feature.current, feature_requested, repair);
        feature.rollback = if feature.execute == FeatureAction::None {
            FeatureAction::None
        } else {
            feature_action(
                feature_requested,
                feature.expected.unwrap_or(feature.current),
                false,
            )
        };
    }
    Ok(())
}

fn features_changed(msi: &MsiPackage, rollback: bool) -> bool {
    msi.features.iter().any(|feature| {
        let action = if rollback {
            feature.rollback
        } else {
            feature.execute
        };
        action != FeatureAction::None
    })
}

pub fn msi_actions(package: &Package) -> (ActionState, ActionState) {
    let PackageKind::Msi(msi) = &package.kind else {
        return (ActionState::None, ActionState::None);
    };
    let requested = package.requested;
    let installing = matches!(requested, RequestState::Present | RequestState::Repair);

    let execute = match package.current_state {
        PackageState::Present if installing => {
            let installed = msi.installed_version.unwrap_or(msi.version);
            if msi.version > installed {
                ActionState::MinorUpgrade
            } else if msi.version < installed {
                ActionState::None
            } else if requested == RequestState::Repair {
                ActionState::Recache
            } else if features_changed(msi, false) {
                ActionState::Modify
            } else {
                ActionState::None
            }
        }
        PackageState::Present if requested == RequestState::Absent && package.uninstallable() => {
            ActionState::Uninstall
        }
        PackageState::Absent | PackageState::Cached | PackageState::Unknown if installing => {
            if msi.major_upgrade_detected {
                ActionState::MajorUpgrade
            } else {
                ActionState::Install
            }
        }
        _ => ActionState::None,
    };

    let rollback = match package.rollback_basis() {
        PackageState::Present if installing => {
            if features_changed(msi, true) {
                ActionState::Modify
            } else {
                ActionState::None
            }
        }
        PackageState::Present if requested == RequestState::Absent => ActionState::Install,
        PackageState::Absent | PackageState::Cached | PackageState::Unknown
            if installing && package.uninstallable() =>
        {
            ActionState::Uninstall
        }
        _ => ActionState::None,
    };

    (execute, rollback)
}

/// Computes each target's actions and folds them into a package action.
pub fn msp_actions(package: &mut Package) -> (ActionState, ActionState) {
    let requested = package.requested;
    let uninstallable = package.uninstallable();
    let PackageKind::Msp(msp) = &mut package.kind else {
        return (ActionState::None, ActionState::None);
    };

    for target in &mut msp.targets {
        let (execute, rollback) = match (target.state, requested) {
            (PackageState::Present, RequestState::Repair) => {
                (ActionState::Repair, ActionState::None)
            }
            (PackageState::Present | PackageState::Superseded, RequestState::Absent)
                if uninstallable =>
            {
                (ActionState::Uninstall, ActionState::Install)
            }
            (
                PackageState::Absent | PackageState::Unknown,
                RequestState::Present | RequestState::Repair,
            ) => (
                ActionState::Install,
                if uninstallable {
                    ActionState::Uninstall
                } else {
                    ActionState::None
                },
            ),
            _ => (ActionState::None, ActionState::None),
        };
        target.execute = execute;
        target.rollback = rollback;
    }
    fold_msp_targets(msp)
}

pub fn fold_msp_targets(msp: &MspPackage) -> (ActionState, ActionState) {
    (
        fold_target_actions(msp.targets.iter().map(|target| target.execute)),
        fold_target_actions(msp.targets.iter().map(|target| target.rollback)),
    )
}

/// Installing any target makes the package action Patch.
fn fold_target_actions(actions: impl Iterator<Item = ActionState>) -> ActionState {
    actions.fold(ActionState::None, |folded, action| match (folded, action) {
        (_, ActionState::Install) | (ActionState::Patch, _) => ActionState::Patch,
        (_, ActionState::Uninstall) | (ActionState::Uninstall, _) => ActionState::Uninstall,
        (_, ActionState::Repair) | (ActionState::Repair, _) => ActionState::Repair,
        (current, _) => current,
    })
}

/// Whether this bundle registers or unregisters itself as a dependent of the
/// package's providers, and the inverse for rollback.
pub fn dependency_actions(package: &Package) -> (DependencyAction, DependencyAction) {
    if package.owned_providers().next().is_none() {
        return (DependencyAction::None, DependencyAction::None);
    }
    match package.requested {
        RequestState::Present | RequestState::Repair if !package.bundle_is_dependent => {
            (DependencyAction::Register, DependencyAction::Unregister)
        }
        RequestState::Absent if package.bundle_is_dependent => {
            (DependencyAction::Unregister, DependencyAction::Register)
        }
        _ => (DependencyAction::None, DependencyAction::None),
    }
}

use anyhow::{Context, Result};
use burn_core::{
    evaluate_condition, format_version, Bundle, Cancelled, FeatureState, MsiPackage, Package,
    PackageKind, PackageState, RelatedOperation, RelationType, UserExperience, Variables,
    VARIABLE_BUNDLE_INSTALLED, VARIABLE_REBOOT_PENDING,
};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::products::InstalledProducts;
use crate::registration::{current_boot_id, detect_related_bundles, resume_mode};

/// Fills in the installed state of the bundle, its related bundles and every
/// package, reporting each finding to the application.
pub fn detect(bundle: &mut Bundle, context: &EngineContext, ux: &dyn UserExperience) -> Result<()> {
    if ux.on_detect_begin(bundle.packages.len()).is_cancel() {
        return Err(Cancelled).context("detect begin");
    }

    let result = detect_all(bundle, context, ux);
    ux.on_detect_complete(result.is_ok());
    result
}

fn detect_all(bundle: &mut Bundle, context: &EngineContext, ux: &dyn UserExperience) -> Result<()> {
    detect_registration(bundle, context)?;
    detect_related(bundle, context, ux)?;

    for index in 0..bundle.packages.len() {
        let package = &bundle.packages[index];
        let cached = package_is_cached(bundle, package, context);
        let mut package = bundle.packages[index].clone();
        package.cached = cached;
        detect_package(&mut package, &bundle.variables, context, ux)
            .with_context(|| format!("failed to detect package '{}'", package.id))?;
        detect_dependents(&mut package, &bundle.registration.provider_key, context)?;
        if package.current_state == PackageState::Absent && package.cached {
            package.current_state = PackageState::Cached;
        }
        info!(
            package = %package.id,
            state = package.current_state.as_str(),
            cached = package.cached,
            "detected package"
        );
        ux.on_detect_package_complete(&package.id, package.current_state);
        bundle.packages[index] = package;
    }
    Ok(())
}

fn detect_registration(bundle: &mut Bundle, context: &EngineContext) -> Result<()> {
    let store = context.registrations(bundle.registration.per_machine);
    let record = store.read(&bundle.registration.bundle_id)?;
    let boot_id = current_boot_id();
    let mode = resume_mode(record.as_ref(), &boot_id);
    bundle.registration.resume_mode = mode;
    bundle.registration.installed = record.as_ref().is_some_and(|record| record.installed);
    bundle
        .variables
        .set_built_in(VARIABLE_BUNDLE_INSTALLED, i64::from(bundle.registration.installed));
    bundle.variables.set_built_in(
        VARIABLE_REBOOT_PENDING,
        i64::from(mode == burn_core::ResumeMode::RebootPending),
    );
    debug!(
        bundle = %bundle.registration.bundle_id,
        resume = mode.as_str(),
        installed = bundle.registration.installed,
        "detected registration"
    );
    Ok(())
}

fn detect_related(bundle: &mut Bundle, context: &EngineContext, ux: &dyn UserExperience) -> Result<()> {
    let machine = context.registrations(true);
    let user = context.registrations(false);
    let related = detect_related_bundles(&bundle.registration, &[&machine, &user])?;

    for related_bundle in &related {
        let operation = match related_bundle.relation {
            RelationType::Upgrade if related_bundle.version > bundle.registration.version => {
                RelatedOperation::Downgrade
            }
            RelationType::Upgrade if related_bundle.version < bundle.registration.version => {
                RelatedOperation::MajorUpgrade
            }
            _ => RelatedOperation::None,
        };
        if ux
            .on_detect_related_bundle(
                &related_bundle.bundle_id,
                related_bundle.relation,
                related_bundle.version,
                operation,
            )
            .is_cancel()
        {
            return Err(Cancelled)
                .with_context(|| format!("detecting related bundle '{}'", related_bundle.bundle_id));
        }
    }
    bundle.registration.related_bundles = related;
    Ok(())
}

fn package_is_cached(bundle: &Bundle, package: &Package, context: &EngineContext) -> bool {
    !package.payloads.is_empty()
        && package.payloads.iter().all(|index| {
            bundle.payloads.get(*index).is_some_and(|payload| {
                context
                    .cache
                    .is_payload_cached(package.per_machine, &package.cache_id, payload)
            })
        })
}

pub(crate) fn detect_package(
    package: &mut Package,
    variables: &Variables,
    context: &EngineContext,
    ux: &dyn UserExperience,
) -> Result<()> {
    let products = context.products.as_ref();
    let package_id = package.id.clone();
    match &mut package.kind {
        PackageKind::Exe(exe) => {
            package.current_state = detect_by_condition(variables, exe.detect_condition.as_deref())?;
        }
        PackageKind::Msu(msu) => {
            package.current_state = detect_by_condition(variables, msu.detect_condition.as_deref())?;
        }
        PackageKind::Msi(msi) => {
            package.current_state = detect_msi(&package_id, msi, products, ux)?;
        }
        PackageKind::Msp(msp) => {
            let mut state = PackageState::Absent;
            for target in &mut msp.targets {
                target.state = products.patch_state(&msp.patch_code, &target.product_code)?;
                if let Some(product) = products.product(&target.product_code)? {
                    target.per_machine = product.per_machine;
                }
                state = match (state, target.state) {
                    (_, PackageState::Present) | (PackageState::Present, _) => PackageState::Present,
                    (_, PackageState::Superseded) => PackageState::Superseded,
                    (current, _) => current,
                };
            }
            package.current_state = state;
        }
    }
    Ok(())
}

fn detect_by_condition(variables: &Variables, condition: Option<&str>) -> Result<PackageState> {
    let Some(condition) = condition else {
        return Ok(PackageState::Absent);
    };
    let present = evaluate_condition(variables, condition).map_err(|err| {
        if err.is_syntax() {
            warn!(condition, "bad condition syntax");
        }
        err
    })?;
    Ok(if present {
        PackageState::Present
    } else {
        PackageState::Absent
    })
}

fn detect_msi(
    package_id: &str,
    msi: &mut MsiPackage,
    products: &dyn InstalledProducts,
    ux: &dyn UserExperience,
) -> Result<PackageState> {
    msi.installed_version = None;
    msi.major_upgrade_detected = false;

    let mut state = match products.product(&msi.product_code)? {
        Some(product) => {
            msi.installed_version = Some(product.version);
            let (state, operation) = if product.version > msi.version {
                (PackageState::Superseded, RelatedOperation::Downgrade)
            } else if product.version < msi.version {
                (PackageState::Present, RelatedOperation::MinorUpdate)
            } else {
                (PackageState::Present, RelatedOperation::None)
            };
            if operation != RelatedOperation::None
                && ux
                    .on_detect_related_msi_package(
                        package_id,
                        &product.product_code,
                        product.per_machine,
                        product.version,
                        operation,
                    )
                    .is_cancel()
            {
                return Err(Cancelled).context("detect related MSI package");
            }
            state
        }
        None => PackageState::Absent,
    };

    for related in &msi.related_msis {
        for product in products.related_products(&related.upgrade_code)? {
            if product.product_code.eq_ignore_ascii_case(&msi.product_code)
                || !related.version_in_range(product.version)
            {
                continue;
            }
            let operation = if related.only_detect {
                RelatedOperation::None
            } else if product.version > msi.version {
                if state == PackageState::Absent {
                    state = PackageState::Obsolete;
                }
                RelatedOperation::Downgrade
            } else {
                msi.major_upgrade_detected = true;
                RelatedOperation::MajorUpgrade
            };
            debug!(
                package = package_id,
                related = %product.product_code,
                version = %format_version(product.version),
                ?operation,
                "detected related MSI"
            );
            if ux
                .on_detect_related_msi_package(
                    package_id,
                    &product.product_code,
                    product.per_machine,
                    product.version,
                    operation,
                )
                .is_cancel()
            {
                return Err(Cancelled).context("detect related MSI package");
            }
        }
    }

    let installed = state == PackageState::Present;
    for feature in &mut msi.features {
        feature.current = if installed {
            products.feature_state(&msi.product_code, &feature.id)?
        } else {
            FeatureState::Absent
        };
        if ux
            .on_detect_msi_feature(package_id, &feature.id, feature.current)
            .is_cancel()
        {
            return Err(Cancelled).context("detect MSI feature");
        }
    }
    Ok(state)
}

fn detect_dependents(package: &mut Package, provider_key: &str, context: &EngineContext) -> Result<()> {
    package.bundle_is_dependent = false;
    package.other_dependents = false;
    if package.providers.is_empty() || provider_key.is_empty() {
        return Ok(());
    }
    let store = context.dependencies(package.per_machine);
    for provider in &package.providers {
        let dependents = store.dependents(&provider.key)?;
        if dependents
            .iter()
            .any(|dependent| dependent.eq_ignore_ascii_case(provider_key))
        {
            package.bundle_is_dependent = true;
        }
        if store.has_other_dependents(&provider.key, provider_key)? {
            package.other_dependents = true;
        }
    }
    Ok(())
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn_core::{
    ActionState, Bundle, BundleAction, CacheType, Cancelled, DependencyAction, PackageKind,
    PackageRef, PackageState, PackageType, RequestState, UserExperience,
};
use tracing::{debug, info};

use crate::actions::{
    CacheAction, CleanAction, ExecuteAction, Plan, PlannedPackage, WINDOWS_UPDATE_SERVICE,
};
use crate::calculate::{fold_msp_targets, plan_package};
use crate::related::{plan_related_bundle, runs_before_chain};

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Emit uncache rollback actions for packages whose rollback uninstalls
    /// them.
    pub rollback_cache: bool,
    pub layout_directory: Option<PathBuf>,
}

/// Computes request states and the cache, execute, rollback and clean
/// plans for one bundle action.
pub fn build_plan(
    bundle: &mut Bundle,
    ux: &dyn UserExperience,
    action: BundleAction,
    options: PlanOptions,
) -> Result<Plan> {
    PlanBuilder::new(bundle, ux, action, options).build()
}

pub struct PlanBuilder<'a> {
    bundle: &'a mut Bundle,
    ux: &'a dyn UserExperience,
    action: BundleAction,
    options: PlanOptions,
    plan: Plan,
    next_checkpoint: u32,
    executed_since_checkpoint: bool,
    cache_syncpoints: BTreeMap<usize, u32>,
    waited_syncpoints: BTreeSet<u32>,
    slipstream_cache: BTreeSet<usize>,
    planned_catalogs: BTreeSet<usize>,
    open_boundary: Option<(usize, u32)>,
    update_service_started: bool,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        bundle: &'a mut Bundle,
        ux: &'a dyn UserExperience,
        action: BundleAction,
        options: PlanOptions,
    ) -> Self {
        Self {
            bundle,
            ux,
            action,
            options,
            plan: Plan::default(),
            next_checkpoint: 1,
            executed_since_checkpoint: false,
            cache_syncpoints: BTreeMap::new(),
            waited_syncpoints: BTreeSet::new(),
            slipstream_cache: BTreeSet::new(),
            planned_catalogs: BTreeSet::new(),
            open_boundary: None,
            update_service_started: false,
        }
    }

    pub fn build(mut self) -> Result<Plan> {
        let package_count = self.bundle.packages.len();
        if self.ux.on_plan_begin(package_count).is_cancel() {
            return Err(Cancelled).context("plan begin");
        }
        info!(
            action = self.action.as_str(),
            packages = package_count,
            "planning bundle"
        );

        let result = self.plan_all();
        self.ux.on_plan_complete(result.is_ok());
        result?;
        Ok(self.plan)
    }

    fn plan_all(&mut self) -> Result<()> {
        self.plan.action = self.action;
        self.plan.layout_directory = self.options.layout_directory.clone();

        for index in 0..self.bundle.packages.len() {
            let Bundle {
                packages,
                variables,
                ..
            } = &mut *self.bundle;
            let package = &mut packages[index];
            plan_package(package, variables, self.ux, self.action)
                .with_context(|| format!("failed to plan package '{}'", package.id))?;
        }
        self.apply_slipstream();

        let bundle_version = self.bundle.registration.version;
        for related in &mut self.bundle.registration.related_bundles {
            plan_related_bundle(related, bundle_version, self.action, self.ux)?;
        }

        if self.action == BundleAction::Layout {
            self.plan_layout();
        } else {
            self.plan_related_bundles(true);
            let order = self.processing_order();
            let boundaries = self.effective_boundaries(&order);
            for (index, boundary) in order.into_iter().zip(boundaries) {
                self.plan_chain_package(index, boundary);
            }
            self.enter_boundary(None);
            self.plan_related_bundles(false);
            if self.update_service_started {
                self.plan.execute_actions.push(ExecuteAction::ServiceStop {
                    service: WINDOWS_UPDATE_SERVICE.to_string(),
                });
            }
            self.plan_clean();
        }

        self.finish();
        Ok(())
    }

    /// Packages are uninstalled in reverse chain order.
    fn processing_order(&self) -> Vec<usize> {
        let count = self.bundle.packages.len();
        if self.action == BundleAction::Uninstall {
            (0..count).rev().collect()
        } else {
            (0..count).collect()
        }
    }

    /// A package belongs to the most recent boundary declared at or before
    /// it in chain order, whichever direction the chain is processed in.
    fn effective_boundaries(&self, order: &[usize]) -> Vec<Option<usize>> {
        let mut current = None;
        let membership: Vec<Option<usize>> = self
            .bundle
            .packages
            .iter()
            .map(|package| {
                if let Some(boundary) = package.rollback_boundary {
                    current = Some(boundary);
                }
                current
            })
            .collect();
        order.iter().map(|&index| membership[index]).collect()
    }

    /// Patches applied through an installing MSI's `PATCH` property are not
    /// applied again on their own.
    fn apply_slipstream(&mut self) {
        let installs: Vec<(String, Vec<usize>)> = self
            .bundle
            .packages
            .iter()
            .filter_map(|package| match &package.kind {
                PackageKind::Msi(msi) if is_fresh_install(package.execute) => {
                    Some((msi.product_code.clone(), msi.slipstream_msps.clone()))
                }
                _ => None,
            })
            .collect();

        for (product_code, patches) in installs {
            for patch in patches {
                let Some(package) = self.bundle.packages.get_mut(patch) else {
                    continue;
                };
                let PackageKind::Msp(msp) = &mut package.kind else {
                    continue;
                };
                for target in &mut msp.targets {
                    if target.product_code.eq_ignore_ascii_case(&product_code) {
                        target.execute = ActionState::None;
                        target.rollback = ActionState::None;
                    }
                }
                let (execute, rollback) = fold_msp_targets(msp);
                package.execute = execute;
                package.rollback = rollback;
                self.slipstream_cache.insert(patch);
            }
        }
    }

    fn slipstream_patches(&self, index: usize) -> Vec<usize> {
        let package = &self.bundle.packages[index];
        match &package.kind {
            PackageKind::Msi(msi) if is_fresh_install(package.execute) => msi
                .slipstream_msps
                .iter()
                .copied()
                .filter(|&patch| patch < self.bundle.packages.len())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn plan_chain_package(&mut self, index: usize, boundary: Option<usize>) {
        self.enter_boundary(boundary);

        let patches = self.slipstream_patches(index);
        let mut waits: Vec<u32> = patches
            .iter()
            .filter_map(|&patch| self.ensure_cached(patch))
            .collect();
        let syncpoint = self.ensure_cached(index);
        waits.extend(syncpoint);

        let package = &self.bundle.packages[index];
        let execute = package.execute;
        let rollback = package.rollback;
        let dependency = package.dependency_execute;
        if execute == ActionState::None && dependency == DependencyAction::None {
            return;
        }

        for syncpoint in waits {
            if self.waited_syncpoints.insert(syncpoint) {
                self.plan
                    .execute_actions
                    .push(ExecuteAction::WaitSyncpoint { syncpoint });
            }
        }

        self.ensure_checkpoint();
        if self.options.rollback_cache
            && rollback == ActionState::Uninstall
            && syncpoint.is_some()
        {
            self.plan
                .rollback_actions
                .push(ExecuteAction::UncachePackage { package: index });
            self.push_checkpoint();
        }

        if dependency == DependencyAction::Unregister {
            self.push_dependency(index, DependencyAction::Unregister, DependencyAction::Register);
        }
        if execute != ActionState::None {
            self.push_package_actions(index, patches);
        }
        if dependency == DependencyAction::Register {
            self.push_dependency(index, DependencyAction::Register, DependencyAction::Unregister);
        }
    }

    fn push_dependency(&mut self, index: usize, execute: DependencyAction, rollback: DependencyAction) {
        self.plan.execute_actions.push(ExecuteAction::Dependency {
            package: index,
            action: execute,
        });
        self.plan.rollback_actions.push(ExecuteAction::Dependency {
            package: index,
            action: rollback,
        });
        self.executed_since_checkpoint = true;
    }

    fn push_package_actions(&mut self, index: usize, patches: Vec<usize>) {
        let package = &self.bundle.packages[index];
        let execute = package.execute;
        let rollback = package.rollback;
        let mut execute_actions = Vec::new();
        let mut rollback_actions = Vec::new();

        match &package.kind {
            PackageKind::Exe(_) => {
                execute_actions.push(ExecuteAction::ExePackage {
                    package: PackageRef::Chain(index),
                    action: execute,
                });
                if rollback != ActionState::None {
                    rollback_actions.push(ExecuteAction::ExePackage {
                        package: PackageRef::Chain(index),
                        action: rollback,
                    });
                }
            }
            PackageKind::Msi(msi) => {
                execute_actions.push(ExecuteAction::MsiPackage {
                    package: index,
                    action: execute,
                    features: msi.features.iter().map(|feature| feature.execute).collect(),
                    slipstream_patches: patches,
                });
                if rollback != ActionState::None {
                    rollback_actions.push(ExecuteAction::MsiPackage {
                        package: index,
                        action: rollback,
                        features: msi.features.iter().map(|feature| feature.rollback).collect(),
                        slipstream_patches: Vec::new(),
                    });
                }
            }
            PackageKind::Msp(msp) => {
                for target in &msp.targets {
                    if target.execute != ActionState::None {
                        execute_actions.push(ExecuteAction::MspTarget {
                            package: index,
                            product_code: target.product_code.clone(),
                            per_machine: target.per_machine,
                            action: target.execute,
                        });
                    }
                    if target.rollback != ActionState::None {
                        rollback_actions.push(ExecuteAction::MspTarget {
                            package: index,
                            product_code: target.product_code.clone(),
                            per_machine: target.per_machine,
                            action: target.rollback,
                        });
                    }
                }
            }
            PackageKind::Msu(_) => {
                if !self.update_service_started {
                    execute_actions.push(ExecuteAction::ServiceStart {
                        service: WINDOWS_UPDATE_SERVICE.to_string(),
                    });
                    self.update_service_started = true;
                }
                execute_actions.push(ExecuteAction::MsuPackage {
                    package: index,
                    action: execute,
                });
                if rollback != ActionState::None {
                    rollback_actions.push(ExecuteAction::MsuPackage {
                        package: index,
                        action: rollback,
                    });
                }
            }
        }

        self.plan.execute_actions.extend(execute_actions);
        self.plan.rollback_actions.extend(rollback_actions);
        self.plan.execute_package_count += 1;
        self.executed_since_checkpoint = true;
    }

    fn plan_related_bundles(&mut self, before_chain: bool) {
        for index in 0..self.bundle.registration.related_bundles.len() {
            let related = &self.bundle.registration.related_bundles[index];
            if runs_before_chain(related, self.action) != before_chain {
                continue;
            }
            let execute = related.package.execute;
            if execute == ActionState::None {
                continue;
            }
            self.ensure_checkpoint();
            self.plan.execute_actions.push(ExecuteAction::ExePackage {
                package: PackageRef::Related(index),
                action: execute,
            });
            self.plan.execute_package_count += 1;
            self.executed_since_checkpoint = true;
        }
    }

    fn enter_boundary(&mut self, boundary: Option<usize>) {
        let current = self.open_boundary.map(|(boundary, _)| boundary);
        if boundary == current {
            return;
        }

        if let Some((_, syncpoint)) = self.open_boundary.take() {
            self.plan
                .cache_actions
                .push(CacheAction::SignalSyncpoint { syncpoint });
        }
        self.ensure_checkpoint();

        if let Some(boundary) = boundary {
            self.plan
                .execute_actions
                .push(ExecuteAction::RollbackBoundary { boundary });
            self.plan
                .rollback_actions
                .push(ExecuteAction::RollbackBoundary { boundary });
            let syncpoint = self.next_syncpoint();
            self.plan
                .execute_actions
                .push(ExecuteAction::WaitSyncpoint { syncpoint });
            self.waited_syncpoints.insert(syncpoint);
            self.open_boundary = Some((boundary, syncpoint));
        }
    }

    fn ensure_checkpoint(&mut self) {
        if self.executed_since_checkpoint {
            self.push_checkpoint();
        }
    }

    fn push_checkpoint(&mut self) {
        let id = self.next_checkpoint_id();
        self.plan
            .execute_actions
            .push(ExecuteAction::Checkpoint { id });
        self.plan
            .rollback_actions
            .push(ExecuteAction::Checkpoint { id });
        self.executed_since_checkpoint = false;
    }

    fn next_checkpoint_id(&mut self) -> u32 {
        let id = self.next_checkpoint;
        self.next_checkpoint += 1;
        id
    }

    fn next_syncpoint(&mut self) -> u32 {
        let syncpoint = self.plan.syncpoint_count;
        self.plan.syncpoint_count += 1;
        syncpoint
    }

    fn needs_cache(&self, index: usize) -> bool {
        let package = &self.bundle.packages[index];
        if package.cached {
            return false;
        }
        package.requested == RequestState::Cache
            || !matches!(package.execute, ActionState::None | ActionState::Uninstall)
            || (package.execute == ActionState::Uninstall
                && package.package_type() == PackageType::Exe)
            || self.slipstream_cache.contains(&index)
    }

    /// Emits the cache block for a package once, returning the syncpoint its
    /// execution waits on.
    fn ensure_cached(&mut self, index: usize) -> Option<u32> {
        if let Some(&syncpoint) = self.cache_syncpoints.get(&index) {
            return Some(syncpoint);
        }
        if !self.needs_cache(index) {
            return None;
        }

        let package = &self.bundle.packages[index];
        let payloads = package.payloads.clone();
        let size = package.size;
        self.plan_catalogs(&payloads);

        let id = self.next_checkpoint_id();
        self.plan.cache_actions.push(CacheAction::Checkpoint { id });
        self.plan
            .rollback_actions
            .push(ExecuteAction::Checkpoint { id });
        self.plan.cache_actions.push(CacheAction::PackageStart {
            package: index,
            payload_count: payloads.len(),
            size,
        });
        for payload in payloads {
            self.plan_payload(index, payload, false);
        }
        self.plan
            .cache_actions
            .push(CacheAction::PackageStop { package: index });
        let syncpoint = self.next_syncpoint();
        self.plan
            .cache_actions
            .push(CacheAction::SignalSyncpoint { syncpoint });
        self.plan.cache_size += size;
        self.cache_syncpoints.insert(index, syncpoint);
        Some(syncpoint)
    }

    fn plan_catalogs(&mut self, payloads: &[usize]) {
        for &payload in payloads {
            let Some(catalog) = self
                .bundle
                .payloads
                .get(payload)
                .and_then(|payload| payload.verification.catalog)
            else {
                continue;
            };
            if self.planned_catalogs.insert(catalog) {
                self.plan
                    .cache_actions
                    .push(CacheAction::AcquireCatalog { catalog });
            }
        }
    }

    fn is_acquired(&self, payload: usize) -> bool {
        self.plan.cache_actions.iter().any(|action| match action {
            CacheAction::AcquirePayload { payload: other } => *other == payload,
            CacheAction::ExtractContainer { payloads, .. } => payloads.contains(&payload),
            _ => false,
        })
    }

    /// Schedules acquisition of `payload` once per plan. Every consumer of a
    /// payload acquired earlier copies it, so none of them moves the shared
    /// file away from the others.
    fn plan_payload(&mut self, package: usize, payload: usize, layout: bool) {
        if self.is_acquired(payload) {
            for action in &mut self.plan.cache_actions {
                match action {
                    CacheAction::CachePayload {
                        payload: other,
                        move_,
                        ..
                    }
                    | CacheAction::LayoutPayload {
                        payload: other,
                        move_,
                        ..
                    } if *other == payload => *move_ = false,
                    _ => {}
                }
            }
            self.push_payload_consumer(package, payload, layout, false);
            debug_assert_eq!(
                self.plan
                    .cache_actions
                    .iter()
                    .filter(|action| match action {
                        CacheAction::AcquirePayload { payload: other } => *other == payload,
                        CacheAction::ExtractContainer { payloads, .. } => {
                            payloads.contains(&payload)
                        }
                        _ => false,
                    })
                    .count(),
                1,
                "shared payload acquired more than once"
            );
            return;
        }

        match self.bundle.payloads[payload].container {
            Some(container) => {
                let existing = self.plan.cache_actions.iter_mut().find_map(|action| match action {
                    CacheAction::ExtractContainer {
                        container: other,
                        payloads,
                    } if *other == container => Some(payloads),
                    _ => None,
                });
                if let Some(payloads) = existing {
                    payloads.push(payload);
                } else {
                    let primary = self
                        .bundle
                        .containers
                        .get(container)
                        .is_some_and(|container| container.primary);
                    if !primary {
                        self.plan
                            .cache_actions
                            .push(CacheAction::AcquireContainer { container });
                    }
                    self.plan.cache_actions.push(CacheAction::ExtractContainer {
                        container,
                        payloads: vec![payload],
                    });
                }
            }
            None => self
                .plan
                .cache_actions
                .push(CacheAction::AcquirePayload { payload }),
        }
        self.push_payload_consumer(package, payload, layout, true);
    }

    fn push_payload_consumer(&mut self, package: usize, payload: usize, layout: bool, move_: bool) {
        let action = if layout {
            CacheAction::LayoutPayload {
                package,
                payload,
                move_,
            }
        } else {
            CacheAction::CachePayload {
                package,
                payload,
                move_,
            }
        };
        self.plan.cache_actions.push(action);
    }

    fn plan_layout(&mut self) {
        self.plan.cache_actions.push(CacheAction::LayoutBundle {
            executable_name: self.bundle.registration.executable_name.clone(),
        });
        for index in 0..self.bundle.packages.len() {
            let package = &self.bundle.packages[index];
            if package.requested != RequestState::Cache {
                continue;
            }
            let payloads = package.payloads.clone();
            let size = package.size;
            self.plan_catalogs(&payloads);
            self.plan.cache_actions.push(CacheAction::PackageStart {
                package: index,
                payload_count: payloads.len(),
                size,
            });
            for payload in payloads {
                self.plan_payload(index, payload, true);
            }
            self.plan
                .cache_actions
                .push(CacheAction::PackageStop { package: index });
            self.plan.cache_size += size;
        }
    }

    fn plan_clean(&mut self) {
        for (index, package) in self.bundle.packages.iter().enumerate() {
            if package.cache_type == CacheType::Always {
                continue;
            }
            let cached = package.cached || self.cache_syncpoints.contains_key(&index);
            let clean = package.execute == ActionState::Uninstall
                || (package.requested == RequestState::Absent
                    && package.cached
                    && !package.other_dependents)
                || (package.cache_type == CacheType::No
                    && matches!(
                        package.requested,
                        RequestState::Present | RequestState::Repair
                    )
                    && cached);
            if clean {
                self.plan.clean_actions.push(CleanAction { package: index });
            }
        }
    }

    fn finish(&mut self) {
        let packages = &self.bundle.packages;
        let registration = &self.bundle.registration;

        self.plan.per_machine = self.action != BundleAction::Layout
            && (registration.per_machine
                || packages.iter().enumerate().any(|(index, package)| {
                    package.per_machine
                        && (package.execute != ActionState::None
                            || package.dependency_execute != DependencyAction::None
                            || self.cache_syncpoints.contains_key(&index))
                })
                || registration.related_bundles.iter().any(|related| {
                    related.package.per_machine && related.package.execute != ActionState::None
                }));

        self.plan.keep_registration = match self.action {
            BundleAction::Layout => registration.installed,
            BundleAction::Uninstall => packages.iter().any(|package| {
                package.current_state == PackageState::Present
                    && package.execute != ActionState::Uninstall
                    && !package.permanent
                    && !package.other_dependents
            }),
            BundleAction::Install | BundleAction::Modify | BundleAction::Repair => true,
        };

        for (index, package) in packages.iter().enumerate() {
            info!(
                package = %package.id,
                current = package.current_state.as_str(),
                default = package.default_requested.as_str(),
                requested = package.requested.as_str(),
                execute = package.execute.as_str(),
                rollback = package.rollback.as_str(),
                dependency = ?package.dependency_execute,
                "planned package"
            );
            self.ux.on_plan_package_complete(
                &package.id,
                package.requested,
                package.execute,
                package.rollback,
            );
            self.plan.packages.push(PlannedPackage {
                id: package.id.clone(),
                package_type: package.package_type(),
                current: package.current_state,
                requested: package.requested,
                execute: package.execute,
                rollback: package.rollback,
                dependency: package.dependency_execute,
                cache: self.cache_syncpoints.contains_key(&index),
            });
        }

        debug!(
            cache_actions = self.plan.cache_actions.len(),
            execute_actions = self.plan.execute_actions.len(),
            rollback_actions = self.plan.rollback_actions.len(),
            per_machine = self.plan.per_machine,
            "plan complete"
        );
    }
}

fn is_fresh_install(action: ActionState) -> bool {
    matches!(action, ActionState::Install | ActionState::MajorUpgrade)
}

//! Runs a plan: the cache plan on a worker thread, the execute plan on the
//! calling thread, joined by syncpoints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{anyhow, Context, Result};
use burn_cache::{acquire_from_source, extract_container};
use burn_core::{
    ActionState, Bundle, Cancelled, DependencyAction, ErrorKind, ErrorReport, Package,
    PackageKind, PackageRef, Packaging, Payload, Restart, UiResult, UserExperience, Verification,
};
use burn_plan::{CacheAction, ExecuteAction, Plan};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::error_code;
use crate::host::{CacheHost, ExecuteHost};
use crate::msi::default_log_path;
use crate::request::{
    CachePayloadRequest, CleanRequest, DependencyRequest, ExeRequest, ExecuteRequest, MsiRequest,
    MspRequest, MsuRequest,
};
use crate::sink::{UxSink, UI_HINT_RETRY_CANCEL};
use crate::syncpoint::Syncpoints;

/// Where execute-plan work runs, by package scope.
pub struct ExecuteHosts<'h> {
    pub user: &'h mut dyn ExecuteHost,
    pub machine: &'h mut dyn ExecuteHost,
}

impl ExecuteHosts<'_> {
    fn get(&mut self, per_machine: bool) -> &mut dyn ExecuteHost {
        if per_machine {
            &mut *self.machine
        } else {
            &mut *self.user
        }
    }
}

/// Where payloads are committed, by package scope.
pub struct CacheHosts<'h> {
    pub user: &'h mut dyn CacheHost,
    pub machine: &'h mut dyn CacheHost,
}

#[derive(Debug, Default)]
pub struct ApplyResult {
    pub restart: Restart,
    /// Some part of the execute plan was rolled back.
    pub rolled_back: bool,
    pub error: Option<anyhow::Error>,
}

impl ApplyResult {
    pub fn status(&self) -> u32 {
        self.error.as_ref().map_or(0, error_code)
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Applies `plan`. Failures are reported in the result after rollback has
/// run; the clean plan only runs after success.
pub fn apply(
    bundle: &Bundle,
    plan: &Plan,
    context: &EngineContext,
    ux: &dyn UserExperience,
    mut execute_hosts: ExecuteHosts<'_>,
    cache_hosts: CacheHosts<'_>,
) -> ApplyResult {
    if ux.on_apply_begin().is_cancel() {
        return ApplyResult {
            error: Some(anyhow::Error::new(Cancelled).context("apply begin")),
            ..ApplyResult::default()
        };
    }
    info!(
        action = plan.action.as_str(),
        cache_actions = plan.cache_actions.len(),
        execute_actions = plan.execute_actions.len(),
        "applying plan"
    );

    let syncpoints = Syncpoints::new(plan.syncpoint_count);
    let stop = AtomicBool::new(false);
    let cache_failed = AtomicBool::new(false);

    let (cache_result, mut result) = thread::scope(|scope| {
        let worker = CacheWorker {
            bundle,
            plan,
            context,
            ux,
            syncpoints: &syncpoints,
            stop: &stop,
            failed: &cache_failed,
            hosts: cache_hosts,
            acquired: HashMap::new(),
            containers: HashMap::new(),
            completed_bytes: 0,
            current_package: None,
        };
        let handle = match thread::Builder::new()
            .name("burn-cache".to_string())
            .spawn_scoped(scope, move || worker.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                let err = anyhow::Error::new(err).context("failed to start the cache thread");
                return (Err(err), ApplyResult::default());
            }
        };

        let result = ExecutePass {
            bundle,
            plan,
            context,
            ux,
            syncpoints: &syncpoints,
            hosts: &mut execute_hosts,
            restart: Restart::None,
            rolled_back: false,
        }
        .run();
        if result.error.is_some() {
            stop.store(true, Ordering::SeqCst);
        }
        let cache_result = handle
            .join()
            .unwrap_or_else(|_| Err(anyhow!("cache thread panicked")));
        (cache_result, result)
    });

    if let Err(err) = cache_result {
        if result.error.is_none() || cache_failed.load(Ordering::SeqCst) {
            result.error = Some(err);
        } else {
            debug!("cache thread stopped after execute failure: {err:#}");
        }
    }

    if result.succeeded() {
        clean(bundle, plan, &mut execute_hosts);
    }

    let status = result.status();
    info!(restart = ?result.restart, "apply complete with status 0x{status:08x}");
    ux.on_apply_complete(status, result.restart);
    result
}

/// Removes packages the clean plan lists. Failures only warn: the install
/// itself already succeeded.
fn clean(bundle: &Bundle, plan: &Plan, hosts: &mut ExecuteHosts<'_>) {
    for action in &plan.clean_actions {
        let Some(package) = bundle.packages.get(action.package) else {
            continue;
        };
        let request = CleanRequest {
            package_id: package.id.clone(),
            per_machine: package.per_machine,
            cache_id: package.cache_id.clone(),
        };
        if let Err(err) = hosts.get(package.per_machine).clean(&request) {
            warn!(package = %package.id, "failed to clean package from cache: {err:#}");
        }
    }
}

struct CacheWorker<'a, 'h> {
    bundle: &'a Bundle,
    plan: &'a Plan,
    context: &'a EngineContext,
    ux: &'a dyn UserExperience,
    syncpoints: &'a Syncpoints,
    stop: &'a AtomicBool,
    failed: &'a AtomicBool,
    hosts: CacheHosts<'h>,
    /// Unverified copies by payload index.
    acquired: HashMap<usize, PathBuf>,
    /// Local container files by container index.
    containers: HashMap<usize, PathBuf>,
    completed_bytes: u64,
    current_package: Option<usize>,
}

impl<'a> CacheWorker<'a, '_> {
    fn run(mut self) -> Result<()> {
        let result = self.run_actions();
        match &result {
            Ok(()) => self.syncpoints.fail_pending("cache plan ended without signaling"),
            Err(err) => {
                if !self.stop.load(Ordering::SeqCst) {
                    self.failed.store(true, Ordering::SeqCst);
                }
                if let Some(package) = self.current_package.take() {
                    self.ux
                        .on_cache_package_complete(&self.bundle.packages[package].id, false);
                }
                self.syncpoints.fail_pending(&format!("{err:#}"));
            }
        }
        result
    }

    fn run_actions(&mut self) -> Result<()> {
        let plan = self.plan;
        for action in &plan.cache_actions {
            loop {
                if self.stop.load(Ordering::SeqCst) {
                    return Err(Cancelled).context("cache plan stopped");
                }
                let err = match self.run_action(action) {
                    Ok(()) => break,
                    Err(err) => err,
                };
                if err.downcast_ref::<Cancelled>().is_some() {
                    return Err(err);
                }

                let message = format!("{err:#}");
                let package_id = self
                    .current_package
                    .map(|package| self.bundle.packages[package].id.as_str());
                let answer = self.ux.on_error(&ErrorReport {
                    kind: ErrorKind::Cache,
                    package_id,
                    code: error_code(&err),
                    message: &message,
                    ui_hint: UI_HINT_RETRY_CANCEL,
                });
                if answer != UiResult::Retry {
                    return Err(err);
                }
                warn!("retrying cache action: {message}");
            }
        }
        Ok(())
    }

    fn run_action(&mut self, action: &CacheAction) -> Result<()> {
        match action {
            CacheAction::Checkpoint { id } => debug!(checkpoint = id, "cache checkpoint"),
            CacheAction::PackageStart {
                package,
                payload_count,
                ..
            } => {
                let id = &self.package(*package)?.id;
                if self.ux.on_cache_package_begin(id, *payload_count).is_cancel() {
                    return Err(Cancelled).with_context(|| format!("caching of '{id}' cancelled"));
                }
                self.current_package = Some(*package);
            }
            CacheAction::PackageStop { package } => {
                self.ux
                    .on_cache_package_complete(&self.package(*package)?.id, true);
                self.current_package = None;
            }
            CacheAction::AcquireCatalog { catalog } => self.acquire_catalog(*catalog)?,
            CacheAction::AcquireContainer { container } => self.acquire_container(*container)?,
            CacheAction::ExtractContainer {
                container,
                payloads,
            } => self.extract(*container, payloads)?,
            CacheAction::AcquirePayload { payload } => {
                self.acquire_payload(*payload)?;
            }
            CacheAction::CachePayload {
                package,
                payload,
                move_,
            } => self.commit_payload(*package, *payload, *move_, None)?,
            CacheAction::LayoutBundle { executable_name } => {
                let directory = self.layout_directory()?;
                let destination = self.context.cache.layout_bundle(
                    &directory,
                    &self.context.config.bundle_executable,
                    executable_name,
                )?;
                info!(destination = %destination.display(), "laid out bundle");
            }
            CacheAction::LayoutPayload {
                package,
                payload,
                move_,
            } => {
                let directory = self.layout_directory()?;
                self.commit_payload(*package, *payload, *move_, Some(directory))?;
            }
            CacheAction::SignalSyncpoint { syncpoint } => {
                debug!(syncpoint, "signaling syncpoint");
                self.syncpoints.signal(*syncpoint);
            }
        }
        Ok(())
    }

    fn package(&self, index: usize) -> Result<&'a Package> {
        self.bundle
            .packages
            .get(index)
            .with_context(|| format!("plan references unknown package {index}"))
    }

    fn payload(&self, index: usize) -> Result<&'a Payload> {
        self.bundle
            .payloads
            .get(index)
            .with_context(|| format!("plan references unknown payload {index}"))
    }

    fn layout_directory(&self) -> Result<PathBuf> {
        self.plan
            .layout_directory
            .clone()
            .context("layout action without a layout directory")
    }

    fn acquire_catalog(&mut self, catalog: usize) -> Result<()> {
        let bundle = self.bundle;
        let entry = bundle
            .catalogs
            .get(catalog)
            .with_context(|| format!("plan references unknown catalog {catalog}"))?;
        let path = match self.acquired.get(&entry.payload) {
            Some(path) => path.clone(),
            None => {
                if let Some(container) = self.payload(entry.payload)?.container {
                    self.extract(container, &[entry.payload])?;
                    self.acquired
                        .get(&entry.payload)
                        .cloned()
                        .context("catalog was not extracted")?
                } else {
                    self.acquire_payload(entry.payload)?
                }
            }
        };
        let payload = self.payload(entry.payload)?;
        self.context.cache.verify_payload(&path, payload)?;
        self.context.cache.verifier().set_catalog_path(catalog, &path);
        debug!(catalog = %entry.id, path = %path.display(), "acquired catalog");
        Ok(())
    }

    /// Downloads or copies a detached container next to the unverified
    /// payloads and checks its hash.
    fn acquire_container(&mut self, index: usize) -> Result<()> {
        let bundle = self.bundle;
        let container = bundle
            .containers
            .get(index)
            .with_context(|| format!("plan references unknown container {index}"))?;
        let layout = self.context.cache.layout();
        let destination = layout.unverified_container_path(&container.id, container.hash.as_deref());
        let as_payload = Payload {
            key: container.id.clone(),
            file_path: container.file_path.clone(),
            size: container.size,
            verification: Verification {
                hash: container.hash.clone(),
                ..Verification::default()
            },
            packaging: if container.download_url.is_some() {
                Packaging::Download
            } else {
                Packaging::External
            },
            container: None,
            source_path: Some(container.file_path.clone()),
            download_url: container.download_url.clone(),
            cached: false,
        };
        self.transfer(&as_payload, &destination)
            .with_context(|| format!("failed to acquire container '{}'", container.id))?;
        self.context.cache.verify_payload(&destination, &as_payload)?;
        self.containers.insert(index, destination);
        Ok(())
    }

    fn extract(&mut self, index: usize, payloads: &[usize]) -> Result<()> {
        let bundle = self.bundle;
        let container = bundle
            .containers
            .get(index)
            .with_context(|| format!("plan references unknown container {index}"))?;
        let path = match self.containers.get(&index) {
            Some(path) => path.clone(),
            None if container.primary => self
                .context
                .config
                .source_directory
                .join(&container.file_path),
            None => return Err(anyhow!("container '{}' was not acquired", container.id)),
        };

        let layout = self.context.cache.layout();
        let mut requests = Vec::with_capacity(payloads.len());
        for &payload_index in payloads {
            let payload = self.payload(payload_index)?;
            let destination =
                layout.unverified_payload_path(&payload.key, payload.verification.hash.as_deref());
            requests.push((payload.file_path.clone(), destination));
        }
        self.context.cache.retry().run("extract container", || {
            extract_container(&path, &requests)
        })?;
        for (&payload, (_, destination)) in payloads.iter().zip(requests) {
            self.acquired.insert(payload, destination);
        }
        debug!(container = %container.id, payloads = payloads.len(), "extracted container");
        Ok(())
    }

    fn acquire_payload(&mut self, index: usize) -> Result<PathBuf> {
        let payload = self.payload(index)?;
        let destination = self
            .context
            .cache
            .layout()
            .unverified_payload_path(&payload.key, payload.verification.hash.as_deref());
        self.transfer(payload, &destination)
            .with_context(|| format!("failed to acquire payload '{}'", payload.key))?;
        self.acquired.insert(index, destination.clone());
        Ok(destination)
    }

    /// Brings an external or downloadable file to `destination`, retrying
    /// transient failures.
    fn transfer(&self, payload: &Payload, destination: &Path) -> Result<()> {
        let retry = self.context.cache.retry();
        match payload.packaging {
            Packaging::External => {
                let relative = payload.source_path.as_deref().unwrap_or(&payload.file_path);
                let source = self.context.config.source_directory.join(relative);
                retry.run("copy payload", || acquire_from_source(&source, destination))?;
            }
            Packaging::Download => {
                let url = payload
                    .download_url
                    .as_deref()
                    .with_context(|| format!("payload '{}' has no download URL", payload.key))?;
                let cancelled = AtomicBool::new(false);
                let base = self.completed_bytes;
                let total = self.plan.cache_size.max(base + payload.size);
                retry.run("download payload", || {
                    let mut progress = |received: u64, _: Option<u64>| {
                        if self.ux.on_cache_progress(base + received, total).is_cancel() {
                            cancelled.store(true, Ordering::SeqCst);
                        }
                    };
                    self.context
                        .downloader
                        .download(url, destination, &mut progress)
                })?;
                if cancelled.load(Ordering::SeqCst) {
                    return Err(Cancelled).context("download cancelled");
                }
            }
            Packaging::Embedded => {
                return Err(anyhow!(
                    "embedded payload '{}' has no container",
                    payload.key
                ))
            }
        }
        Ok(())
    }

    fn commit_payload(
        &mut self,
        package_index: usize,
        payload_index: usize,
        move_file: bool,
        layout_directory: Option<PathBuf>,
    ) -> Result<()> {
        let package = self.package(package_index)?;
        let payload = self.payload(payload_index)?;
        let unverified = self
            .acquired
            .get(&payload_index)
            .cloned()
            .with_context(|| format!("payload '{}' was not acquired", payload.key))?;
        let catalog_path = payload
            .verification
            .catalog
            .and_then(|catalog| self.bundle.catalogs.get(catalog))
            .and_then(|catalog| self.acquired.get(&catalog.payload))
            .cloned();

        let layout = layout_directory.is_some();
        let request = CachePayloadRequest {
            package_id: package.id.clone(),
            per_machine: package.per_machine,
            cache_id: package.cache_id.clone(),
            payload_key: payload.key.clone(),
            file_path: payload.file_path.clone(),
            size: payload.size,
            verification: payload.verification.clone(),
            catalog_path,
            unverified,
            move_file,
            layout_directory,
        };
        let size = payload.size;
        let host = if package.per_machine && !layout {
            &mut *self.hosts.machine
        } else {
            &mut *self.hosts.user
        };
        host.cache_payload(&request)?;

        self.completed_bytes += size;
        let total = self.plan.cache_size.max(self.completed_bytes);
        if self
            .ux
            .on_cache_progress(self.completed_bytes, total)
            .is_cancel()
        {
            return Err(Cancelled).context("caching cancelled");
        }
        Ok(())
    }
}

/// Runs the execute plan, rolling back on failure.
struct ExecutePass<'a, 'h> {
    bundle: &'a Bundle,
    plan: &'a Plan,
    context: &'a EngineContext,
    ux: &'a dyn UserExperience,
    syncpoints: &'a Syncpoints,
    hosts: &'a mut ExecuteHosts<'h>,
    restart: Restart,
    rolled_back: bool,
}

impl<'a> ExecutePass<'a, '_> {
    fn run(mut self) -> ApplyResult {
        let error = self.run_actions().err();
        ApplyResult {
            restart: self.restart,
            rolled_back: self.rolled_back,
            error,
        }
    }

    fn run_actions(&mut self) -> Result<()> {
        let plan = self.plan;
        let actions = &plan.execute_actions;
        let mut index = 0;
        while index < actions.len() {
            let err = match self.run_action(&actions[index], false) {
                Ok(()) => {
                    if self.restart == Restart::Initiated {
                        info!("restart initiated; skipping the rest of the execute plan");
                        return Ok(());
                    }
                    index += 1;
                    continue;
                }
                Err(err) => err,
            };

            warn!(action = index, "execute plan failed: {err:#}");
            self.rollback(index);
            let waited_on_cache = matches!(actions[index], ExecuteAction::WaitSyncpoint { .. });
            if err.downcast_ref::<Cancelled>().is_some() || waited_on_cache {
                return Err(err);
            }

            let boundary_vital = plan
                .boundary_at(index)
                .and_then(|boundary| self.bundle.rollback_boundaries.get(boundary))
                .map_or(true, |boundary| boundary.vital);
            if boundary_vital && self.package_vital(&actions[index]) {
                return Err(err);
            }
            warn!(action = index, "continuing past non-vital failure: {err:#}");
            match plan.next_boundary_after(index) {
                Some(next) => {
                    info!(next, "continuing with the next rollback boundary");
                    index = next;
                }
                None => {
                    info!("non-vital failure rolled back at the end of the plan");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Whether a failure of `action` stops apply. Only package actions can
    /// be non-vital.
    fn package_vital(&self, action: &ExecuteAction) -> bool {
        let package = match action {
            ExecuteAction::ExePackage { package, .. } => self.package_ref(*package),
            ExecuteAction::MsiPackage { package, .. }
            | ExecuteAction::MspTarget { package, .. }
            | ExecuteAction::MsuPackage { package, .. } => self.chain_package(*package),
            _ => return true,
        };
        package.map_or(true, |package| package.vital)
    }

    /// Walks the rollback plan backward from the checkpoint following the
    /// failed action to the enclosing boundary.
    fn rollback(&mut self, failed: usize) {
        self.rolled_back = true;
        let plan = self.plan;
        let start = plan.rollback_start(failed);
        info!(failed, start, "rolling back");
        for action in plan.rollback_actions[..start].iter().rev() {
            match action {
                ExecuteAction::RollbackBoundary { boundary } => {
                    debug!(boundary, "rollback reached boundary");
                    break;
                }
                ExecuteAction::Checkpoint { .. } | ExecuteAction::WaitSyncpoint { .. } => {}
                action => {
                    if let Err(err) = self.run_action(action, true) {
                        warn!("rollback action failed: {err:#}");
                    }
                }
            }
        }
    }

    fn run_action(&mut self, action: &ExecuteAction, rollback: bool) -> Result<()> {
        match action {
            ExecuteAction::Checkpoint { id } => debug!(checkpoint = id, "execute checkpoint"),
            ExecuteAction::WaitSyncpoint { syncpoint } => {
                debug!(syncpoint, "waiting for cache");
                self.syncpoints.wait(*syncpoint)?;
            }
            ExecuteAction::RollbackBoundary { boundary } => {
                debug!(boundary, "entering rollback boundary");
            }
            ExecuteAction::UncachePackage { package } => {
                let package = self.chain_package(*package)?;
                let request = CleanRequest {
                    package_id: package.id.clone(),
                    per_machine: package.per_machine,
                    cache_id: package.cache_id.clone(),
                };
                self.hosts.get(package.per_machine).clean(&request)?;
            }
            ExecuteAction::Dependency { package, action } => {
                self.run_dependency(*package, *action)?;
            }
            ExecuteAction::ServiceStart { service } => {
                self.hosts.machine.service(service, true)?;
            }
            ExecuteAction::ServiceStop { service } => {
                self.hosts.machine.service(service, false)?;
            }
            ExecuteAction::ExePackage { package, action } => {
                let request = self.exe_request(*package, *action)?;
                let per_machine = self.package_ref(*package)?.per_machine;
                self.run_package(&request, per_machine, rollback)?;
            }
            ExecuteAction::MsiPackage {
                package,
                action,
                features,
                slipstream_patches,
            } => {
                let request =
                    self.msi_request(*package, *action, features, slipstream_patches, rollback)?;
                let target = self.chain_package(*package)?;
                self.run_package(&request, target.per_machine, rollback)?;
            }
            ExecuteAction::MspTarget {
                package,
                product_code,
                per_machine,
                action,
            } => {
                let request = self.msp_request(*package, product_code, *action, rollback)?;
                self.run_package(&request, *per_machine, rollback)?;
            }
            ExecuteAction::MsuPackage { package, action } => {
                let request = self.msu_request(*package, *action, rollback)?;
                let target = self.chain_package(*package)?;
                self.run_package(&request, target.per_machine, rollback)?;
            }
        }
        Ok(())
    }

    fn run_package(
        &mut self,
        request: &ExecuteRequest,
        per_machine: bool,
        rollback: bool,
    ) -> Result<()> {
        let package_id = request.package_id();
        if self.ux.on_execute_package_begin(package_id, !rollback).is_cancel() && !rollback {
            return Err(Cancelled).with_context(|| format!("package '{package_id}' cancelled"));
        }
        info!(package = package_id, rollback, per_machine, "executing package");

        let mut sink = UxSink::new(self.ux, package_id);
        let result = self.hosts.get(per_machine).execute(request, &mut sink);
        let (status, restart) = match &result {
            Ok(restart) => (0, *restart),
            Err(err) => (error_code(err), Restart::None),
        };
        self.ux
            .on_execute_package_complete(package_id, status, restart);
        self.restart = self.restart.merge(restart);

        result.map(|_| ())
    }

    fn run_dependency(&mut self, index: usize, action: DependencyAction) -> Result<()> {
        let package = self.chain_package(index)?;
        let request = DependencyRequest {
            package_id: package.id.clone(),
            per_machine: package.per_machine,
            action,
            dependent: self.bundle.registration.provider_key.clone(),
            providers: package.providers.clone(),
        };
        self.hosts.get(package.per_machine).dependency(&request)
    }

    fn chain_package(&self, index: usize) -> Result<&'a Package> {
        self.bundle
            .packages
            .get(index)
            .with_context(|| format!("plan references unknown package {index}"))
    }

    fn package_ref(&self, reference: PackageRef) -> Result<&'a Package> {
        self.bundle
            .package(reference)
            .with_context(|| format!("plan references unknown package {reference:?}"))
    }

    /// Completed cache path of a package's first payload.
    fn first_payload_path(&self, package: &Package) -> Result<Option<PathBuf>> {
        let Some(payload) = package
            .payloads
            .first()
            .and_then(|&index| self.bundle.payloads.get(index))
        else {
            return Ok(None);
        };
        let path = self.context.cache.layout().completed_payload_path(
            package.per_machine,
            &package.cache_id,
            &payload.file_path,
        )?;
        Ok(Some(path))
    }

    fn log_path(&self, package_id: &str, rollback: bool) -> Option<PathBuf> {
        let name = if rollback {
            format!("{package_id}_rollback")
        } else {
            package_id.to_string()
        };
        Some(default_log_path(self.context.config.log_directory(), &name))
    }

    fn exe_request(&self, reference: PackageRef, action: ActionState) -> Result<ExecuteRequest> {
        let package = self.package_ref(reference)?;
        let PackageKind::Exe(exe) = &package.kind else {
            return Err(anyhow!("package '{}' is not an EXE package", package.id));
        };
        let executable = match reference {
            PackageRef::Chain(_) => self.first_payload_path(package)?,
            PackageRef::Related(index) => self
                .bundle
                .registration
                .related_bundles
                .get(index)
                .and_then(|related| related.executable.clone()),
        }
        .with_context(|| format!("package '{}' has no executable", package.id))?;

        let template: &str = match action {
            ActionState::Uninstall => exe.uninstall_arguments.as_deref().unwrap_or_default(),
            ActionState::Repair => exe
                .repair_arguments
                .as_deref()
                .unwrap_or(&exe.install_arguments),
            _ => &exe.install_arguments,
        };
        let variables = &self.bundle.variables;
        Ok(ExecuteRequest::Exe(ExeRequest {
            package_id: package.id.clone(),
            executable,
            arguments: variables.format(template),
            log_arguments: variables.format_for_log(template),
            burn_protocol: exe.protocol == burn_core::ExeProtocol::Burn,
            exit_codes: exe.exit_codes.clone(),
        }))
    }

    fn msi_request(
        &self,
        index: usize,
        action: ActionState,
        features: &[burn_core::FeatureAction],
        slipstream_patches: &[usize],
        rollback: bool,
    ) -> Result<ExecuteRequest> {
        let package = self.chain_package(index)?;
        let PackageKind::Msi(msi) = &package.kind else {
            return Err(anyhow!("package '{}' is not an MSI package", package.id));
        };
        let variables = &self.bundle.variables;
        let properties = msi
            .properties
            .iter()
            .map(|property| {
                let value = match (&property.rollback_value, rollback) {
                    (Some(value), true) => value,
                    _ => &property.value,
                };
                (property.id.clone(), variables.format(value))
            })
            .collect();
        let features = msi
            .features
            .iter()
            .zip(features)
            .map(|(feature, action)| (feature.id.clone(), *action))
            .collect();
        let mut patches = Vec::new();
        for &patch in slipstream_patches {
            let patch = self.chain_package(patch)?;
            if let Some(path) = self.first_payload_path(patch)? {
                patches.push(path);
            }
        }

        Ok(ExecuteRequest::Msi(MsiRequest {
            package_id: package.id.clone(),
            package_path: self.first_payload_path(package)?,
            product_code: msi.product_code.clone(),
            action,
            properties,
            features,
            patches,
            log_path: self.log_path(&package.id, rollback),
        }))
    }

    fn msp_request(
        &self,
        index: usize,
        product_code: &str,
        action: ActionState,
        rollback: bool,
    ) -> Result<ExecuteRequest> {
        let package = self.chain_package(index)?;
        let PackageKind::Msp(msp) = &package.kind else {
            return Err(anyhow!("package '{}' is not an MSP package", package.id));
        };
        Ok(ExecuteRequest::Msp(MspRequest {
            package_id: package.id.clone(),
            patch_path: self.first_payload_path(package)?,
            patch_code: msp.patch_code.clone(),
            product_code: product_code.to_string(),
            action,
            log_path: self.log_path(&format!("{}_{product_code}", package.id), rollback),
        }))
    }

    fn msu_request(&self, index: usize, action: ActionState, rollback: bool) -> Result<ExecuteRequest> {
        let package = self.chain_package(index)?;
        let PackageKind::Msu(msu) = &package.kind else {
            return Err(anyhow!("package '{}' is not an MSU package", package.id));
        };
        Ok(ExecuteRequest::Msu(MsuRequest {
            package_id: package.id.clone(),
            msu_path: self.first_payload_path(package)?,
            kb: msu.kb.clone(),
            action,
            log_path: self.log_path(&package.id, rollback),
        }))
    }
}

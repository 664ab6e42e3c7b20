use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burn_core::{Cancelled, ErrorKind, Registration, Restart, UiResult};
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::embedded::run_embedded;
use crate::error::error_code;
use crate::exe::{exe_outcome, execute_exe_with_runner};
use crate::msi::execute_msi_with_runner;
use crate::msp::execute_msp_with_runner;
use crate::msu::execute_msu_with_runner;
use crate::process::{run_process, ProcessLauncher, SystemLauncher};
use crate::registration::{
    current_boot_id, detect_related_bundles, RegistrationRecord, SessionEnd,
};
use crate::request::{
    CachePayloadRequest, CleanRequest, DependencyRequest, ExecuteRequest, RelatedBundlesQuery,
    SaveStateRequest, SessionBeginRequest, SessionEndRequest, SessionRequest,
};
use crate::sink::{ExecuteSink, UI_HINT_RETRY_CANCEL};

pub type CommandRunner = dyn Fn(&mut Command, &str) -> Result<u32> + Send + Sync;

/// Runs package installers in the current process.
#[derive(Clone)]
pub struct PackageExecutor {
    launcher: Arc<dyn ProcessLauncher>,
    runner: Arc<CommandRunner>,
    embedded_timeout: Duration,
}

impl PackageExecutor {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, embedded_timeout: Duration) -> Self {
        Self {
            launcher,
            runner: Arc::new(run_process),
            embedded_timeout,
        }
    }

    pub fn for_host(embedded_timeout: Duration) -> Self {
        Self::new(Arc::new(SystemLauncher), embedded_timeout)
    }

    pub fn with_runner(mut self, runner: Arc<CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Runs a package, letting the application retry or ignore a failure.
    pub fn execute(&self, request: &ExecuteRequest, sink: &mut dyn ExecuteSink) -> Result<Restart> {
        let package_id = request.package_id();
        loop {
            if sink.progress(0, 0)?.is_cancel() {
                return Err(Cancelled).with_context(|| format!("package '{package_id}' cancelled"));
            }

            let err = match self.execute_once(request, sink) {
                Ok(restart) => {
                    sink.progress(100, 100)?;
                    return Ok(restart);
                }
                Err(err) => err,
            };
            if err.downcast_ref::<Cancelled>().is_some() {
                return Err(err);
            }

            let code = error_code(&err);
            let message = format!("{err:#}");
            match sink.error(error_kind(request), code, UI_HINT_RETRY_CANCEL, &message)? {
                UiResult::Retry => {
                    warn!(package = package_id, "retrying failed package: {message}");
                }
                UiResult::Ignore => {
                    warn!(package = package_id, "ignoring failed package: {message}");
                    return Ok(Restart::None);
                }
                _ => return Err(err),
            }
        }
    }

    fn execute_once(&self, request: &ExecuteRequest, sink: &mut dyn ExecuteSink) -> Result<Restart> {
        let run = |command: &mut Command, context: &str| (self.runner)(command, context);
        match request {
            ExecuteRequest::Exe(exe) if exe.burn_protocol => {
                let exit_code =
                    run_embedded(exe, self.launcher.as_ref(), sink, self.embedded_timeout)?;
                exe_outcome(exe, exit_code)
            }
            ExecuteRequest::Exe(exe) => execute_exe_with_runner(exe, run),
            ExecuteRequest::Msi(msi) => execute_msi_with_runner(msi, sink, run),
            ExecuteRequest::Msp(msp) => execute_msp_with_runner(msp, run),
            ExecuteRequest::Msu(msu) => execute_msu_with_runner(msu, run),
        }
    }
}

impl std::fmt::Debug for PackageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageExecutor")
            .field("embedded_timeout", &self.embedded_timeout)
            .finish_non_exhaustive()
    }
}

pub fn error_kind(request: &ExecuteRequest) -> ErrorKind {
    match request {
        ExecuteRequest::Exe(_) => ErrorKind::ExePackage,
        ExecuteRequest::Msi(_) | ExecuteRequest::Msp(_) => ErrorKind::MsiPackage,
        ExecuteRequest::Msu(_) => ErrorKind::Windows,
    }
}

/// Verifies a payload and commits it to the cache or the layout directory.
pub fn cache_payload(context: &EngineContext, request: &CachePayloadRequest) -> Result<PathBuf> {
    if let (Some(catalog), Some(path)) = (request.verification.catalog, &request.catalog_path) {
        context.cache.verifier().set_catalog_path(catalog, path);
    }
    let payload = request.payload();
    match &request.layout_directory {
        Some(directory) => {
            context
                .cache
                .layout_payload(directory, &payload, &request.unverified, request.move_file)
        }
        None => context.cache.complete_payload(
            request.per_machine,
            &request.cache_id,
            &payload,
            &request.unverified,
            request.move_file,
        ),
    }
    .with_context(|| {
        format!(
            "failed to cache payload '{}' for package '{}'",
            request.payload_key, request.package_id
        )
    })
}

pub fn apply_dependency(context: &EngineContext, request: &DependencyRequest) -> Result<()> {
    context
        .dependencies(request.per_machine)
        .apply(request.action, &request.providers, &request.dependent)
        .with_context(|| {
            format!(
                "failed to apply dependency action for package '{}'",
                request.package_id
            )
        })
}

pub fn clean_package(context: &EngineContext, request: &CleanRequest) -> Result<()> {
    info!(package = %request.package_id, "removing package from cache");
    context
        .cache
        .remove_package(request.per_machine, &request.cache_id)
}

/// Writes the Active registration, caching the bundle executable first so
/// the registration can point at it.
pub fn begin_session(context: &EngineContext, request: &SessionBeginRequest) -> Result<RegistrationRecord> {
    let mut record = RegistrationRecord::parse(&request.receipt)?;
    if let Some(executable) = &request.executable {
        let cached = context.cache.cache_bundle(
            record.per_machine,
            &record.bundle_id,
            executable,
            &request.executable_name,
        )?;
        record.cached_executable = Some(cached);
    }
    context.registrations(record.per_machine).session_begin(record)
}

pub fn resume_session(context: &EngineContext, request: &SessionRequest) -> Result<()> {
    context
        .registrations(request.per_machine)
        .session_resume(&request.bundle_id)?;
    Ok(())
}

/// Finishes the registration. An unregistered bundle also leaves the cache.
pub fn end_session(context: &EngineContext, request: &SessionEndRequest) -> Result<()> {
    let end = SessionEnd {
        keep_registration: request.keep_registration,
        reboot_boot_id: request.reboot_pending.then(current_boot_id),
    };
    context
        .registrations(request.per_machine)
        .session_end(&request.bundle_id, end)?;
    if !request.keep_registration {
        context
            .cache
            .remove_bundle(request.per_machine, &request.bundle_id)?;
    }
    Ok(())
}

pub fn save_state(context: &EngineContext, request: &SaveStateRequest) -> Result<()> {
    context
        .registrations(request.per_machine)
        .save_state(&request.bundle_id, &request.state)
}

/// Counts related bundles registered per machine.
pub fn count_related_bundles(context: &EngineContext, query: &RelatedBundlesQuery) -> Result<usize> {
    let registration = Registration {
        bundle_id: query.bundle_id.clone(),
        upgrade_codes: query.upgrade_codes.clone(),
        addon_codes: query.addon_codes.clone(),
        patch_codes: query.patch_codes.clone(),
        detect_codes: query.detect_codes.clone(),
        ..Registration::default()
    };
    let store = context.registrations(true);
    Ok(detect_related_bundles(&registration, &[&store])?.len())
}

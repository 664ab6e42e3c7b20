use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn_core::{
    BufferReader, BufferWriter, Bundle, BundleAction, Cancelled, ErrorKind, ErrorReport,
    Restart, ResumeMode, UiResult, UserExperience, VARIABLE_BUNDLE_ACTION,
    VARIABLE_BUNDLE_ELEVATED,
};
use burn_plan::{build_plan, Plan, PlanOptions};
use tracing::{debug, info, warn};

use crate::apply::{apply, ApplyResult, CacheHosts, ExecuteHosts};
use crate::context::EngineContext;
use crate::detect::detect;
use crate::elevated::run_elevated;
use crate::elevation::ElevatedSession;
use crate::error::{error_code, ElevationError};
use crate::executor::PackageExecutor;
use crate::host::{CacheHost, ExecuteHost, LocalHost};
use crate::process::{ProcessLauncher, SystemLauncher};
use crate::registration::RegistrationRecord;
use crate::request::{
    RelatedBundlesQuery, SaveStateRequest, SessionBeginRequest, SessionEndRequest, SessionRequest,
};
use crate::restart::exit_code_for;
use crate::sink::UI_HINT_RETRY_CANCEL;

/// What one engine run did.
#[derive(Debug)]
pub struct RunOutcome {
    pub plan: Plan,
    pub apply: ApplyResult,
    /// The code the process should exit with.
    pub exit_code: u32,
}

/// Detect, plan and apply for one bundle, in this process or with an
/// elevated helper for per-machine work.
pub struct Engine {
    context: Arc<EngineContext>,
    executor: PackageExecutor,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Engine {
    pub fn new(
        context: EngineContext,
        executor: PackageExecutor,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            context: Arc::new(context),
            executor,
            launcher,
        }
    }

    pub fn for_host(context: EngineContext) -> Self {
        let timeout = context.config.elevation_timeout;
        Self::new(
            context,
            PackageExecutor::for_host(timeout),
            Arc::new(SystemLauncher),
        )
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Detects installed state and restores persisted variables of an
    /// interrupted session.
    pub fn detect(&self, bundle: &mut Bundle, ux: &dyn UserExperience) -> Result<()> {
        match self.context.cache.process_pending_removals(false) {
            Ok(0) => {}
            Ok(remaining) => debug!(remaining, "cache directories still pending removal"),
            Err(err) => warn!("failed to process pending cache removals: {err:#}"),
        }

        detect(bundle, &self.context, ux)?;

        if matches!(
            bundle.registration.resume_mode,
            ResumeMode::Active | ResumeMode::Suspend
        ) {
            self.restore_state(bundle)?;
        }
        Ok(())
    }

    fn restore_state(&self, bundle: &mut Bundle) -> Result<()> {
        let registration = &bundle.registration;
        let state = self
            .context
            .registrations(registration.per_machine)
            .load_state(&registration.bundle_id)?;
        let Some(state) = state else {
            return Ok(());
        };
        bundle
            .variables
            .deserialize(&mut BufferReader::new(&state))
            .context("failed to restore persisted variables")?;
        info!(bundle = %registration.bundle_id, "restored persisted variables");
        Ok(())
    }

    pub fn plan(
        &self,
        bundle: &mut Bundle,
        ux: &dyn UserExperience,
        action: BundleAction,
        layout_directory: Option<PathBuf>,
    ) -> Result<Plan> {
        bundle
            .variables
            .set_built_in(VARIABLE_BUNDLE_ACTION, action.code());
        let options = PlanOptions {
            rollback_cache: self.context.config.rollback_cache,
            layout_directory,
        };
        build_plan(bundle, ux, action, options)
    }

    /// Applies a plan, elevating first when it has per-machine work.
    pub fn apply(&self, bundle: &mut Bundle, plan: &Plan, ux: &dyn UserExperience) -> ApplyResult {
        let mut session = None;
        if plan.per_machine {
            match self.elevate(ux) {
                Ok(elevated) => {
                    bundle.variables.set_built_in(VARIABLE_BUNDLE_ELEVATED, 1_i64);
                    session = Some(elevated);
                }
                Err(err) => {
                    let result = ApplyResult {
                        error: Some(err),
                        ..ApplyResult::default()
                    };
                    ux.on_apply_complete(result.status(), result.restart);
                    return result;
                }
            }
        }

        let result = self.apply_with_session(bundle, plan, ux, session.as_mut());

        if let Some(session) = session {
            let code = exit_code_for(result.status(), result.restart);
            match session.terminate(code) {
                Ok(exit_code) => debug!(exit_code, "elevated engine terminated"),
                Err(err) => warn!("failed to shut down the elevated engine: {err:#}"),
            }
        }
        result
    }

    /// Detect, plan and apply in one go.
    pub fn run(
        &self,
        bundle: &mut Bundle,
        ux: &dyn UserExperience,
        action: BundleAction,
        layout_directory: Option<PathBuf>,
    ) -> Result<RunOutcome> {
        self.detect(bundle, ux)?;
        let plan = self.plan(bundle, ux, action, layout_directory)?;
        let apply = self.apply(bundle, &plan, ux);
        let exit_code = exit_code_for(apply.status(), apply.restart);
        Ok(RunOutcome {
            plan,
            apply,
            exit_code,
        })
    }

    /// Serves an unelevated parent as the elevated engine.
    pub fn run_elevated(self, pipe_name: &str, token: &str) -> Result<u32> {
        run_elevated(self.context, self.executor, pipe_name, token)
    }

    /// Launches the elevated engine, letting the application retry a
    /// declined or timed out prompt.
    fn elevate(&self, ux: &dyn UserExperience) -> Result<ElevatedSession> {
        loop {
            if ux.on_elevate().is_cancel() {
                return Err(Cancelled).context("elevation cancelled");
            }
            let config = &self.context.config;
            let err = match ElevatedSession::launch(
                self.launcher.as_ref(),
                &config.bundle_executable,
                config.elevation_timeout,
            ) {
                Ok(session) => return Ok(session),
                Err(err) => err,
            };
            if err.downcast_ref::<ElevationError>().is_none() {
                return Err(err);
            }

            let message = format!("{err:#}");
            let answer = ux.on_error(&ErrorReport {
                kind: ErrorKind::Elevation,
                package_id: None,
                code: error_code(&err),
                message: &message,
                ui_hint: UI_HINT_RETRY_CANCEL,
            });
            if answer != UiResult::Retry {
                return Err(err);
            }
            warn!("retrying elevation: {message}");
        }
    }

    fn apply_with_session(
        &self,
        bundle: &Bundle,
        plan: &Plan,
        ux: &dyn UserExperience,
        session: Option<&mut ElevatedSession>,
    ) -> ApplyResult {
        let local = LocalHost::new(&self.context, &self.executor);
        let mut user_host = local;
        let mut user_cache = local;
        let mut local_machine = local;
        let mut local_machine_cache = local;

        let (machine, machine_cache): (&mut dyn ExecuteHost, &mut dyn CacheHost) = match session {
            Some(session) => {
                let (control, cache) = session.channels();
                if let Err(err) = cache.cleanup() {
                    warn!("elevated cache cleanup failed: {err:#}");
                }
                (control as &mut dyn ExecuteHost, cache as &mut dyn CacheHost)
            }
            None => (&mut local_machine, &mut local_machine_cache),
        };
        let mut hosts = ExecuteHosts {
            user: &mut user_host,
            machine,
        };

        let registered = plan.action != BundleAction::Layout;
        if registered {
            if let Err(err) = self.begin_session(bundle, &mut hosts) {
                let result = ApplyResult {
                    error: Some(err.context("failed to begin the registration session")),
                    ..ApplyResult::default()
                };
                ux.on_apply_complete(result.status(), result.restart);
                return result;
            }
            if plan.per_machine {
                self.check_related_bundles(bundle, &mut hosts);
            }
        }

        let mut result = apply(
            bundle,
            plan,
            &self.context,
            ux,
            ExecuteHosts {
                user: &mut *hosts.user,
                machine: &mut *hosts.machine,
            },
            CacheHosts {
                user: &mut user_cache,
                machine: machine_cache,
            },
        );

        if registered {
            if let Err(err) = self.end_session(bundle, plan, &result, &mut hosts) {
                warn!("failed to end the registration session: {err:#}");
                if result.error.is_none() {
                    result.error = Some(err);
                }
            }
        }
        result
    }

    fn begin_session(&self, bundle: &Bundle, hosts: &mut ExecuteHosts<'_>) -> Result<()> {
        let registration = &bundle.registration;
        let host = scoped(hosts, registration.per_machine);
        if matches!(
            registration.resume_mode,
            ResumeMode::Active | ResumeMode::Suspend
        ) {
            host.session_resume(&SessionRequest {
                bundle_id: registration.bundle_id.clone(),
                per_machine: registration.per_machine,
            })?;
        } else {
            let record = RegistrationRecord::from_registration(registration, None);
            let executable = &self.context.config.bundle_executable;
            host.session_begin(&SessionBeginRequest {
                receipt: record.to_receipt(),
                executable: (!executable.as_os_str().is_empty()).then(|| executable.clone()),
                executable_name: registration.executable_name.clone(),
            })?;
        }

        let mut state = BufferWriter::new();
        bundle.variables.serialize(&mut state);
        host.save_state(&SaveStateRequest {
            bundle_id: registration.bundle_id.clone(),
            per_machine: registration.per_machine,
            state: state.into_bytes(),
        })
    }

    /// Compares the elevated engine's view of per-machine related bundles
    /// with what detect found.
    fn check_related_bundles(&self, bundle: &Bundle, hosts: &mut ExecuteHosts<'_>) {
        let registration = &bundle.registration;
        let query = RelatedBundlesQuery {
            bundle_id: registration.bundle_id.clone(),
            upgrade_codes: registration.upgrade_codes.clone(),
            addon_codes: registration.addon_codes.clone(),
            patch_codes: registration.patch_codes.clone(),
            detect_codes: registration.detect_codes.clone(),
        };
        let detected = registration
            .related_bundles
            .iter()
            .filter(|related| related.package.per_machine)
            .count();
        match hosts.machine.related_bundle_count(&query) {
            Ok(count) if count == detected => debug!(count, "related bundles confirmed"),
            Ok(count) => warn!(
                elevated = count,
                detected, "elevated engine sees a different set of related bundles"
            ),
            Err(err) => warn!("failed to query related bundles: {err:#}"),
        }
    }

    fn end_session(
        &self,
        bundle: &Bundle,
        plan: &Plan,
        result: &ApplyResult,
        hosts: &mut ExecuteHosts<'_>,
    ) -> Result<()> {
        let registration = &bundle.registration;
        let keep_registration = if result.succeeded() {
            plan.keep_registration
        } else {
            registration.installed
        };
        let request = SessionEndRequest {
            bundle_id: registration.bundle_id.clone(),
            per_machine: registration.per_machine,
            keep_registration,
            reboot_pending: result.restart != Restart::None,
        };
        info!(
            bundle = %registration.bundle_id,
            keep_registration,
            reboot_pending = request.reboot_pending,
            "ending registration session"
        );
        scoped(hosts, registration.per_machine).session_end(&request)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("context", &self.context)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

fn scoped<'s>(hosts: &'s mut ExecuteHosts<'_>, per_machine: bool) -> &'s mut dyn ExecuteHost {
    if per_machine {
        &mut *hosts.machine
    } else {
        &mut *hosts.user
    }
}

//! Bundles that run other bundles.
//!
//! The parent launches a Burn-protocol EXE package with
//! `-burn.embedded <pipe> <token>`; the child connects back and relays its
//! progress and errors, and the parent answers with its own application's
//! choices.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use burn_core::{
    ActionState, ErrorKind, ErrorReport, FeatureState, PackageState, RelatedOperation,
    RelationType, RequestState, Restart, UiResult, UserExperience,
};
use burn_pipe::{
    connect, generate_secret, ids, present_token, verify_token, PipeConnection, PipeError,
    PipeListener, PipeMessage, PipeStream,
};
use tracing::{debug, info, warn};

use crate::process::{accept_from_child, split_command_line, ChildConnectError, ProcessLauncher};
use crate::request::{ExeRequest, ProgressMessage, TextMessage};
use crate::sink::ExecuteSink;

pub const EMBEDDED_SWITCH: &str = "-burn.embedded";

/// Runs an embedded bundle to completion and returns its exit code. A child
/// that exits without connecting is reported by its exit code alone.
pub fn run_embedded(
    request: &ExeRequest,
    launcher: &dyn ProcessLauncher,
    sink: &mut dyn ExecuteSink,
    timeout: Duration,
) -> Result<u32> {
    let listener = PipeListener::bind().context("failed to create embedded pipe")?;
    let secret = generate_secret();
    let mut arguments = split_command_line(&request.arguments);
    arguments.push(EMBEDDED_SWITCH.to_string());
    arguments.push(listener.name().to_string());
    arguments.push(secret.clone());

    info!(
        package = %request.package_id,
        executable = %request.executable.display(),
        arguments = %request.log_arguments,
        "launching embedded bundle"
    );
    let mut child = launcher.launch(&request.executable, &arguments, false)?;
    let mut stream = match accept_from_child(&listener, child.as_mut(), timeout) {
        Ok(stream) => stream,
        Err(ChildConnectError::Exited(code)) => {
            warn!(package = %request.package_id, code, "embedded bundle exited without connecting");
            return Ok(code);
        }
        Err(ChildConnectError::Pipe(err)) => {
            let _ = child.kill();
            return Err(err).context("embedded bundle did not connect");
        }
        Err(ChildConnectError::Poll(err)) => {
            let _ = child.kill();
            return Err(err);
        }
    };
    if let Err(err) = verify_token(&mut stream, &secret) {
        let _ = child.kill();
        return Err(err).context("embedded bundle failed the handshake");
    }

    let mut connection = PipeConnection::new(stream, "embedded");
    let pumped = connection.pump_messages(|_, message| relay_embedded(message, &mut *sink));
    drop(connection);
    if let Err(err) = pumped {
        let _ = child.kill();
        return Err(err).context("embedded bundle pipe failed");
    }

    match child.wait_timeout(timeout)? {
        Some(code) => Ok(code),
        None => {
            let _ = child.kill();
            Err(anyhow!(
                "embedded bundle '{}' did not exit after closing its pipe",
                request.package_id
            ))
        }
    }
}

fn relay_embedded(message: PipeMessage, sink: &mut dyn ExecuteSink) -> Result<u32> {
    match message.id {
        ids::EMBEDDED_PROGRESS => {
            let progress = ProgressMessage::decode(&message.data)?;
            Ok(sink.progress(progress.progress, progress.overall)?.code())
        }
        ids::EMBEDDED_ERROR => {
            let error = TextMessage::decode(&message.data)?;
            Ok(sink
                .error(ErrorKind::ExePackage, error.code, error.ui_hint, &error.text)?
                .code())
        }
        id => Err(PipeError::UnexpectedMessage { id }.into()),
    }
}

/// The child's end of the embedded pipe.
#[derive(Debug)]
pub struct EmbeddedReporter {
    connection: Mutex<PipeConnection<PipeStream>>,
}

impl EmbeddedReporter {
    pub fn connect(pipe_name: &str, token: &str) -> Result<Self> {
        let mut stream = connect(pipe_name)
            .with_context(|| format!("failed to connect to parent bundle at {pipe_name}"))?;
        present_token(&mut stream, token).context("parent bundle rejected the connection")?;
        debug!(pipe = pipe_name, "connected to parent bundle");
        Ok(Self {
            connection: Mutex::new(PipeConnection::new(stream, "embedded")),
        })
    }

    pub fn progress(&self, progress: u32, overall: u32) -> Result<UiResult> {
        let data = ProgressMessage { progress, overall }.encode();
        self.send(ids::EMBEDDED_PROGRESS, &data)
    }

    pub fn error(&self, report: &ErrorReport<'_>) -> Result<UiResult> {
        let data = TextMessage {
            code: report.code,
            ui_hint: report.ui_hint,
            text: report.message.to_string(),
        }
        .encode();
        self.send(ids::EMBEDDED_ERROR, &data)
    }

    fn send(&self, id: u32, data: &[u8]) -> Result<UiResult> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| anyhow!("embedded pipe lock poisoned"))?;
        let code = connection.send_message(id, data, burn_pipe::reject_nested)?;
        Ok(UiResult::from_code(code))
    }
}

/// Wraps the application of an embedded bundle so the parent sees its
/// progress and gets the first say on its errors.
pub struct EmbeddedUx<'a> {
    inner: &'a dyn UserExperience,
    reporter: EmbeddedReporter,
}

impl<'a> EmbeddedUx<'a> {
    pub fn new(inner: &'a dyn UserExperience, reporter: EmbeddedReporter) -> Self {
        Self { inner, reporter }
    }

    fn parent_answer(&self, answer: Result<UiResult>) -> Option<UiResult> {
        match answer {
            Ok(UiResult::NoAction) => None,
            Ok(result) => Some(result),
            Err(err) => {
                warn!("failed to reach parent bundle: {err:#}");
                None
            }
        }
    }
}

impl UserExperience for EmbeddedUx<'_> {
    fn on_detect_begin(&self, package_count: usize) -> UiResult {
        self.inner.on_detect_begin(package_count)
    }

    fn on_detect_related_bundle(
        &self,
        bundle_id: &str,
        relation: RelationType,
        version: u64,
        operation: RelatedOperation,
    ) -> UiResult {
        self.inner
            .on_detect_related_bundle(bundle_id, relation, version, operation)
    }

    fn on_detect_related_msi_package(
        &self,
        package_id: &str,
        product_code: &str,
        per_machine: bool,
        version: u64,
        operation: RelatedOperation,
    ) -> UiResult {
        self.inner.on_detect_related_msi_package(
            package_id,
            product_code,
            per_machine,
            version,
            operation,
        )
    }

    fn on_detect_msi_feature(&self, package_id: &str, feature_id: &str, state: FeatureState) -> UiResult {
        self.inner.on_detect_msi_feature(package_id, feature_id, state)
    }

    fn on_detect_package_complete(&self, package_id: &str, state: PackageState) {
        self.inner.on_detect_package_complete(package_id, state)
    }

    fn on_detect_complete(&self, succeeded: bool) {
        self.inner.on_detect_complete(succeeded)
    }

    fn on_plan_begin(&self, package_count: usize) -> UiResult {
        self.inner.on_plan_begin(package_count)
    }

    fn on_plan_related_bundle(&self, bundle_id: &str, requested: &mut RequestState) -> UiResult {
        self.inner.on_plan_related_bundle(bundle_id, requested)
    }

    fn on_plan_package_begin(&self, package_id: &str, requested: &mut RequestState) -> UiResult {
        self.inner.on_plan_package_begin(package_id, requested)
    }

    fn on_plan_msi_feature(
        &self,
        package_id: &str,
        feature_id: &str,
        requested: &mut FeatureState,
    ) -> UiResult {
        self.inner.on_plan_msi_feature(package_id, feature_id, requested)
    }

    fn on_plan_package_complete(
        &self,
        package_id: &str,
        requested: RequestState,
        execute: ActionState,
        rollback: ActionState,
    ) {
        self.inner
            .on_plan_package_complete(package_id, requested, execute, rollback)
    }

    fn on_plan_complete(&self, succeeded: bool) {
        self.inner.on_plan_complete(succeeded)
    }

    fn on_apply_begin(&self) -> UiResult {
        self.inner.on_apply_begin()
    }

    fn on_elevate(&self) -> UiResult {
        self.inner.on_elevate()
    }

    fn on_cache_package_begin(&self, package_id: &str, payload_count: usize) -> UiResult {
        self.inner.on_cache_package_begin(package_id, payload_count)
    }

    fn on_cache_package_complete(&self, package_id: &str, succeeded: bool) {
        self.inner.on_cache_package_complete(package_id, succeeded)
    }

    fn on_cache_progress(&self, completed_bytes: u64, total_bytes: u64) -> UiResult {
        self.inner.on_cache_progress(completed_bytes, total_bytes)
    }

    fn on_execute_package_begin(&self, package_id: &str, execute: bool) -> UiResult {
        self.inner.on_execute_package_begin(package_id, execute)
    }

    fn on_execute_progress(&self, package_id: &str, progress: u32, overall: u32) -> UiResult {
        match self.parent_answer(self.reporter.progress(progress, overall)) {
            Some(UiResult::Cancel) => UiResult::Cancel,
            _ => self.inner.on_execute_progress(package_id, progress, overall),
        }
    }

    fn on_execute_msi_message(
        &self,
        package_id: &str,
        message_type: u32,
        ui_hint: u32,
        message: &str,
    ) -> UiResult {
        self.inner
            .on_execute_msi_message(package_id, message_type, ui_hint, message)
    }

    fn on_execute_msi_files_in_use(&self, package_id: &str, files: &[String]) -> UiResult {
        self.inner.on_execute_msi_files_in_use(package_id, files)
    }

    fn on_execute_package_complete(&self, package_id: &str, status: u32, restart: Restart) -> UiResult {
        self.inner
            .on_execute_package_complete(package_id, status, restart)
    }

    fn on_error(&self, report: &ErrorReport<'_>) -> UiResult {
        self.parent_answer(self.reporter.error(report))
            .unwrap_or_else(|| self.inner.on_error(report))
    }

    fn on_apply_complete(&self, status: u32, restart: Restart) -> UiResult {
        self.inner.on_apply_complete(status, restart)
    }
}

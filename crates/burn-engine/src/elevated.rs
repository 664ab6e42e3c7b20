//! The elevated engine process.
//!
//! Connects back to the unelevated parent twice: first the control channel,
//! then the cache channel. The cache channel is pumped on its own thread so
//! payloads can be committed while packages execute.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use burn_core::{ErrorKind, UiResult};
use burn_pipe::{
    connect, ids, present_token, reject_nested, PipeConnection, PipeError, PipeMessage,
    PipeStream, E_FAIL, S_OK,
};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::error_code;
use crate::executor::{
    apply_dependency, begin_session, cache_payload, clean_package, count_related_bundles,
    end_session, resume_session, save_state, PackageExecutor,
};
use crate::request::{
    decode_string, encode_strings, CachePayloadRequest, CleanRequest, DependencyRequest,
    ExecuteRequest, ProgressMessage, RelatedBundlesQuery, SaveStateRequest,
    SessionBeginRequest, SessionEndRequest, SessionRequest, TextMessage,
};
use crate::services::{start_service, stop_service};
use crate::sink::ExecuteSink;

/// Serves the parent until it sends TERMINATE and returns the code the
/// process should exit with.
pub fn run_elevated(
    context: Arc<EngineContext>,
    executor: PackageExecutor,
    pipe_name: &str,
    token: &str,
) -> Result<u32> {
    let control = connect_channel(pipe_name, token)?;
    let cache = connect_channel(pipe_name, token)?;
    info!(pipe = pipe_name, "elevated engine connected to parent");

    let (sender, receiver) = mpsc::channel();
    let cache_context = Arc::clone(&context);
    thread::Builder::new()
        .name("burn-cache".to_string())
        .spawn(move || {
            let mut connection = PipeConnection::new(cache, "cache");
            let result = connection.pump_messages(|connection, message| {
                Ok(handle_cache(&cache_context, connection, message))
            });
            let _ = sender.send(result);
        })
        .context("failed to start the cache channel thread")?;

    let mut connection = PipeConnection::new(control, "control");
    let terminated = connection.pump_messages(|connection, message| {
        Ok(handle_control(&context, &executor, connection, message))
    })?;
    let exit_code = match terminated {
        Some(code) => code,
        None => {
            warn!("parent closed the control channel without TERMINATE");
            E_FAIL
        }
    };

    match receiver.recv_timeout(context.config.cache_join_timeout) {
        Ok(Ok(Some(cache_code))) => {
            if cache_code != exit_code {
                warn!(cache_code, exit_code, "channels terminated with different codes");
            }
            debug_assert_eq!(cache_code, exit_code, "channels terminated with different codes");
        }
        Ok(Ok(None)) => debug!("cache channel closed without TERMINATE"),
        Ok(Err(err)) => warn!("cache channel failed: {err:#}"),
        Err(_) => warn!("cache channel did not finish in time"),
    }
    debug!(exit_code, "elevated engine finished");
    Ok(exit_code)
}

fn connect_channel(pipe_name: &str, token: &str) -> Result<PipeStream> {
    let mut stream = connect(pipe_name)
        .with_context(|| format!("failed to connect to parent engine at {pipe_name}"))?;
    present_token(&mut stream, token).context("parent engine rejected the connection")?;
    Ok(stream)
}

/// Runs one control command. Failures become the COMPLETE code and are
/// also logged back to the parent.
fn handle_control(
    context: &EngineContext,
    executor: &PackageExecutor,
    connection: &mut PipeConnection<PipeStream>,
    message: PipeMessage,
) -> u32 {
    let id = message.id;
    debug!(message = ids::name(id), "elevated command");
    let result = dispatch_control(context, executor, connection, message);
    match result {
        Ok(code) => code,
        Err(err) => {
            let _ = connection.send_log(&format!("{} failed: {err:#}", ids::name(id)));
            error_code(&err)
        }
    }
}

fn dispatch_control(
    context: &EngineContext,
    executor: &PackageExecutor,
    connection: &mut PipeConnection<PipeStream>,
    message: PipeMessage,
) -> Result<u32> {
    match message.id {
        ids::ELEVATION_SESSION_BEGIN => {
            begin_session(context, &SessionBeginRequest::decode(&message.data)?)?;
        }
        ids::ELEVATION_SESSION_RESUME => {
            resume_session(context, &SessionRequest::decode(&message.data)?)?;
        }
        ids::ELEVATION_SESSION_END => {
            end_session(context, &SessionEndRequest::decode(&message.data)?)?;
        }
        ids::ELEVATION_SAVE_STATE => {
            save_state(context, &SaveStateRequest::decode(&message.data)?)?;
        }
        ids::ELEVATION_DETECT_RELATED_BUNDLES => {
            let query = RelatedBundlesQuery::decode(&message.data)?;
            let count = count_related_bundles(context, &query)?;
            return Ok(u32::try_from(count).unwrap_or(u32::MAX >> 1));
        }
        ids::ELEVATION_EXECUTE_EXE_PACKAGE
        | ids::ELEVATION_EXECUTE_MSI_PACKAGE
        | ids::ELEVATION_EXECUTE_MSP_PACKAGE
        | ids::ELEVATION_EXECUTE_MSU_PACKAGE => {
            let request = ExecuteRequest::decode(message.id, &message.data)?;
            let mut sink = PipeSink { connection };
            let restart = executor.execute(&request, &mut sink)?;
            return Ok(restart.code());
        }
        ids::ELEVATION_EXECUTE_DEPENDENCY => {
            apply_dependency(context, &DependencyRequest::decode(&message.data)?)?;
        }
        ids::ELEVATION_CLEAN_PACKAGE => {
            clean_package(context, &CleanRequest::decode(&message.data)?)?;
        }
        ids::ELEVATION_SERVICE_START => start_service(&decode_string(&message.data)?)?,
        ids::ELEVATION_SERVICE_STOP => stop_service(&decode_string(&message.data)?)?,
        id => return Err(PipeError::UnexpectedMessage { id }.into()),
    }
    Ok(S_OK)
}

fn handle_cache(
    context: &EngineContext,
    connection: &mut PipeConnection<PipeStream>,
    message: PipeMessage,
) -> u32 {
    let id = message.id;
    let result = match id {
        ids::ELEVATION_CACHE_PAYLOAD => CachePayloadRequest::decode(&message.data)
            .map_err(anyhow::Error::from)
            .and_then(|request| cache_payload(context, &request))
            .map(|path| debug!(path = %path.display(), "payload cached")),
        ids::ELEVATION_CACHE_CLEANUP => {
            context.cache.reset_root_secured();
            context
                .cache
                .process_pending_removals(true)
                .map(|remaining| debug!(remaining, "processed pending cache removals"))
        }
        id => Err(PipeError::UnexpectedMessage { id }.into()),
    };
    match result {
        Ok(()) => S_OK,
        Err(err) => {
            let _ = connection.send_log(&format!("{} failed: {err:#}", ids::name(id)));
            error_code(&err)
        }
    }
}

/// Forwards what a package reports to the parent, which asks its UX.
struct PipeSink<'a> {
    connection: &'a mut PipeConnection<PipeStream>,
}

impl PipeSink<'_> {
    fn send(&mut self, id: u32, data: &[u8]) -> Result<UiResult> {
        let code = self.connection.send_message(id, data, reject_nested)?;
        Ok(UiResult::from_code(code))
    }
}

impl ExecuteSink for PipeSink<'_> {
    fn progress(&mut self, progress: u32, overall: u32) -> Result<UiResult> {
        self.send(
            ids::EXECUTE_PROGRESS,
            &ProgressMessage { progress, overall }.encode(),
        )
    }

    fn error(&mut self, _kind: ErrorKind, code: u32, ui_hint: u32, message: &str) -> Result<UiResult> {
        let data = TextMessage {
            code,
            ui_hint,
            text: message.to_string(),
        }
        .encode();
        self.send(ids::EXECUTE_ERROR, &data)
    }

    fn msi_message(&mut self, message_type: u32, ui_hint: u32, message: &str) -> Result<UiResult> {
        let data = TextMessage {
            code: message_type,
            ui_hint,
            text: message.to_string(),
        }
        .encode();
        self.send(ids::EXECUTE_MSI_MESSAGE, &data)
    }

    fn files_in_use(&mut self, files: &[String]) -> Result<UiResult> {
        self.send(ids::EXECUTE_FILES_IN_USE, &encode_strings(files))
    }
}

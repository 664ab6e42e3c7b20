//! The unelevated side of the elevated engine process.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use burn_core::Restart;
use burn_pipe::{
    check_code, error_from_code, generate_secret, ids, reject_nested, succeeded, verify_token,
    PipeConnection, PipeError, PipeListener, PipeMessage, PipeStream,
};
use tracing::{debug, info, warn};

use crate::error::ElevationError;
use crate::executor::error_kind;
use crate::host::{CacheHost, ExecuteHost};
use crate::process::{accept_from_child, ChildConnectError, ChildProcess, ProcessLauncher};
use crate::request::{
    decode_strings, CachePayloadRequest, CleanRequest, DependencyRequest, ExecuteRequest,
    ProgressMessage, RelatedBundlesQuery, SaveStateRequest, SessionBeginRequest,
    SessionEndRequest, SessionRequest, TextMessage, encode_string,
};
use crate::sink::ExecuteSink;

pub const ELEVATED_SWITCH: &str = "-burn.elevated";

/// A running elevated child and its two channels.
pub struct ElevatedSession {
    child: Box<dyn ChildProcess>,
    control: ElevatedControl,
    cache: ElevatedCache,
    timeout: Duration,
}

impl ElevatedSession {
    /// Launches `executable` elevated and waits for it to connect both
    /// channels. A child that exits first was declined.
    pub fn launch(
        launcher: &dyn ProcessLauncher,
        executable: &Path,
        timeout: Duration,
    ) -> Result<Self> {
        let listener = PipeListener::bind().context("failed to create elevation pipe")?;
        let secret = generate_secret();
        let arguments = vec![
            "-q".to_string(),
            ELEVATED_SWITCH.to_string(),
            listener.name().to_string(),
            secret.clone(),
        ];
        info!(executable = %executable.display(), "launching elevated engine");
        let mut child = launcher.launch(executable, &arguments, true)?;

        let control = match accept_channel(&listener, child.as_mut(), &secret, timeout) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = child.kill();
                return Err(err);
            }
        };
        let cache = match accept_channel(&listener, child.as_mut(), &secret, timeout) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = child.kill();
                return Err(err);
            }
        };
        debug!(pipe = listener.name(), "elevated engine connected");

        Ok(Self {
            child,
            control: ElevatedControl {
                connection: PipeConnection::new(control, "control"),
            },
            cache: ElevatedCache {
                connection: PipeConnection::new(cache, "cache"),
            },
            timeout,
        })
    }

    pub fn control(&mut self) -> &mut ElevatedControl {
        &mut self.control
    }

    /// Both channels at once, for running the cache channel on another
    /// thread while executing on this one.
    pub fn channels(&mut self) -> (&mut ElevatedControl, &mut ElevatedCache) {
        (&mut self.control, &mut self.cache)
    }

    /// Sends TERMINATE on both channels and waits for the child to exit.
    pub fn terminate(mut self, code: u32) -> Result<u32> {
        if let Err(err) = self.cache.connection.terminate(code) {
            warn!("failed to terminate cache channel: {err}");
        }
        self.control
            .connection
            .terminate(code)
            .context("failed to terminate elevated engine")?;
        match self.child.wait_timeout(self.timeout)? {
            Some(exit_code) => {
                debug!(exit_code, "elevated engine exited");
                Ok(exit_code)
            }
            None => {
                let _ = self.child.kill();
                Err(anyhow!("elevated engine did not exit after TERMINATE"))
            }
        }
    }
}

impl std::fmt::Debug for ElevatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevatedSession")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn accept_channel(
    listener: &PipeListener,
    child: &mut dyn ChildProcess,
    secret: &str,
    timeout: Duration,
) -> Result<PipeStream> {
    let mut stream = match accept_from_child(listener, child, timeout) {
        Ok(stream) => stream,
        Err(ChildConnectError::Exited(code)) => {
            return Err(ElevationError::Declined {
                exit_code: Some(code),
            }
            .into())
        }
        Err(ChildConnectError::Pipe(PipeError::Timeout(_))) => {
            return Err(ElevationError::Timeout.into())
        }
        Err(ChildConnectError::Pipe(err)) => {
            return Err(err).context("failed to accept elevated connection")
        }
        Err(ChildConnectError::Poll(err)) => return Err(err),
    };
    verify_token(&mut stream, secret)
        .map_err(|err| anyhow::Error::new(err).context(ElevationError::Rejected))?;
    Ok(stream)
}

/// The control channel: sessions, package execution and dependencies.
#[derive(Debug)]
pub struct ElevatedControl {
    connection: PipeConnection<PipeStream>,
}

impl ElevatedControl {
    fn send(&mut self, id: u32, data: &[u8]) -> Result<()> {
        let code = self.connection.send_message(id, data, reject_nested)?;
        check_code(code, ids::name(id))
    }
}

impl ExecuteHost for ElevatedControl {
    fn execute(&mut self, request: &ExecuteRequest, sink: &mut dyn ExecuteSink) -> Result<Restart> {
        let kind = error_kind(request);
        let code = self.connection.send_message(
            request.message_id(),
            &request.encode(),
            |_, message| relay_execute_message(message, kind, &mut *sink),
        )?;
        if succeeded(code) {
            Ok(Restart::from_code(code).unwrap_or(Restart::None))
        } else {
            Err(error_from_code(code, "elevated package execution"))
                .with_context(|| format!("package '{}'", request.package_id()))
        }
    }

    fn dependency(&mut self, request: &DependencyRequest) -> Result<()> {
        self.send(ids::ELEVATION_EXECUTE_DEPENDENCY, &request.encode())
    }

    fn clean(&mut self, request: &CleanRequest) -> Result<()> {
        self.send(ids::ELEVATION_CLEAN_PACKAGE, &request.encode())
    }

    fn service(&mut self, name: &str, start: bool) -> Result<()> {
        let id = if start {
            ids::ELEVATION_SERVICE_START
        } else {
            ids::ELEVATION_SERVICE_STOP
        };
        self.send(id, &encode_string(name))
    }

    fn session_begin(&mut self, request: &SessionBeginRequest) -> Result<()> {
        self.send(ids::ELEVATION_SESSION_BEGIN, &request.encode())
    }

    fn session_resume(&mut self, request: &SessionRequest) -> Result<()> {
        self.send(ids::ELEVATION_SESSION_RESUME, &request.encode())
    }

    fn session_end(&mut self, request: &SessionEndRequest) -> Result<()> {
        self.send(ids::ELEVATION_SESSION_END, &request.encode())
    }

    fn save_state(&mut self, request: &SaveStateRequest) -> Result<()> {
        self.send(ids::ELEVATION_SAVE_STATE, &request.encode())
    }

    fn related_bundle_count(&mut self, query: &RelatedBundlesQuery) -> Result<usize> {
        let id = ids::ELEVATION_DETECT_RELATED_BUNDLES;
        let code = self
            .connection
            .send_message(id, &query.encode(), reject_nested)?;
        check_code(code, ids::name(id))?;
        Ok(code as usize)
    }
}

fn relay_execute_message(
    message: PipeMessage,
    kind: burn_core::ErrorKind,
    sink: &mut dyn ExecuteSink,
) -> Result<u32> {
    let result = match message.id {
        ids::EXECUTE_PROGRESS => {
            let progress = ProgressMessage::decode(&message.data)?;
            sink.progress(progress.progress, progress.overall)?
        }
        ids::EXECUTE_ERROR => {
            let error = TextMessage::decode(&message.data)?;
            sink.error(kind, error.code, error.ui_hint, &error.text)?
        }
        ids::EXECUTE_MSI_MESSAGE => {
            let text = TextMessage::decode(&message.data)?;
            sink.msi_message(text.code, text.ui_hint, &text.text)?
        }
        ids::EXECUTE_FILES_IN_USE => sink.files_in_use(&decode_strings(&message.data)?)?,
        id => return Err(PipeError::UnexpectedMessage { id }.into()),
    };
    Ok(result.code())
}

/// The cache channel, serviced independently of the control channel.
#[derive(Debug)]
pub struct ElevatedCache {
    connection: PipeConnection<PipeStream>,
}

impl ElevatedCache {
    /// Deletes per-machine cache directories an earlier run left behind.
    pub fn cleanup(&mut self) -> Result<()> {
        let id = ids::ELEVATION_CACHE_CLEANUP;
        let code = self.connection.send_message(id, &[], reject_nested)?;
        check_code(code, ids::name(id))
    }
}

impl CacheHost for ElevatedCache {
    fn cache_payload(&mut self, request: &CachePayloadRequest) -> Result<()> {
        let id = ids::ELEVATION_CACHE_PAYLOAD;
        let code = self
            .connection
            .send_message(id, &request.encode(), reject_nested)?;
        check_code(code, ids::name(id))
            .with_context(|| format!("failed to cache payload '{}'", request.payload_key))
    }
}

use burn_core::BufferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElevationError {
    #[error("elevation was declined or the elevated process exited with {exit_code:?} before connecting")]
    Declined { exit_code: Option<u32> },
    #[error("timed out waiting for the elevated process to connect")]
    Timeout,
    #[error("elevated process rejected the connection")]
    Rejected,
}

/// A request or relay message that does not decode.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request buffer")]
    Buffer(#[from] BufferError),
    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u32 },
    #[error("message 0x{0:08x} does not carry a package request")]
    UnknownMessage(u32),
}

/// An installer ran and reported failure.
#[derive(Debug, Error)]
#[error("package '{package_id}' failed with exit code {exit_code}")]
pub struct PackageFailed {
    pub package_id: String,
    pub exit_code: u32,
}

/// The HRESULT-shaped code reported for a failure, on the pipe and as the
/// process exit code.
pub fn error_code(err: &anyhow::Error) -> u32 {
    for cause in err.chain() {
        if let Some(failed) = cause.downcast_ref::<PackageFailed>() {
            return burn_pipe::hresult_from_win32(failed.exit_code);
        }
        if let Some(verification) = cause.downcast_ref::<burn_security::VerificationError>() {
            return verification.code();
        }
        match cause.downcast_ref::<ElevationError>() {
            Some(ElevationError::Timeout) => {
                return burn_pipe::hresult_from_win32(burn_pipe::ERROR_TIMEOUT)
            }
            Some(_) => return burn_pipe::hresult_from_win32(burn_pipe::ERROR_CANCELLED),
            None => {}
        }
    }
    burn_pipe::code_from_error(err)
}

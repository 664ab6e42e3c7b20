use burn_core::BufferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("pipe I/O failed")]
    Io(#[from] std::io::Error),
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("pipe closed by the other side")]
    Closed,
    #[error("connection rejected by the parent process")]
    HandshakeRejected,
    #[error("connection token does not match")]
    TokenMismatch,
    #[error("protocol version {remote} does not match local version {local}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("malformed message payload")]
    Buffer(#[from] BufferError),
    #[error("unexpected message 0x{id:08x}")]
    UnexpectedMessage { id: u32 },
    #[error("remote operation failed with 0x{code:08x}")]
    Remote { code: u32 },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

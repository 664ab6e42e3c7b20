mod codes;
mod connection;
mod error;
mod handshake;
pub mod ids;
mod message;
mod transport;

pub use codes::{
    check_code, code_from_error, error_from_code, hresult_from_win32, is_user_exit, succeeded,
    E_FAIL, ERROR_CANCELLED, ERROR_INSTALL_FAILURE, ERROR_INSTALL_USEREXIT,
    ERROR_SUCCESS_REBOOT_INITIATED, ERROR_SUCCESS_REBOOT_REQUIRED, ERROR_TIMEOUT, S_OK,
};
pub use connection::{reject_nested, PipeConnection};
pub use error::PipeError;
pub use handshake::{present_token, verify_token, PROTOCOL_VERSION};
pub use message::{
    is_reserved_id, read_message, write_message, PipeMessage, MAX_MESSAGE_SIZE, MESSAGE_COMPLETE,
    MESSAGE_LOG, MESSAGE_TERMINATE,
};
pub use transport::{connect, generate_pipe_name, generate_secret, PipeListener, PipeStream};

//! Result codes exchanged across the pipe.
//!
//! Codes are HRESULT-shaped `u32` values. Win32 error numbers are wrapped with
//! [`hresult_from_win32`] before they cross a process boundary, except for the
//! restart codes that packages and the engine report as plain exit codes.

use burn_core::Cancelled;

use crate::error::PipeError;

pub const S_OK: u32 = 0;
pub const E_FAIL: u32 = 0x8000_4005;

pub const ERROR_INSTALL_USEREXIT: u32 = 1602;
pub const ERROR_INSTALL_FAILURE: u32 = 1603;
pub const ERROR_CANCELLED: u32 = 1223;
pub const ERROR_TIMEOUT: u32 = 1460;
pub const ERROR_SUCCESS_REBOOT_INITIATED: u32 = 1641;
pub const ERROR_SUCCESS_REBOOT_REQUIRED: u32 = 3010;

const FACILITY_WIN32: u32 = 7;

pub fn hresult_from_win32(code: u32) -> u32 {
    if code == 0 || code & 0x8000_0000 != 0 {
        code
    } else {
        (code & 0x0000_FFFF) | (FACILITY_WIN32 << 16) | 0x8000_0000
    }
}

pub fn succeeded(code: u32) -> bool {
    code & 0x8000_0000 == 0
}

pub fn is_user_exit(code: u32) -> bool {
    code == hresult_from_win32(ERROR_INSTALL_USEREXIT) || code == hresult_from_win32(ERROR_CANCELLED)
}

/// Maps an error chain to the code reported on COMPLETE or TERMINATE.
pub fn code_from_error(err: &anyhow::Error) -> u32 {
    for cause in err.chain() {
        if cause.downcast_ref::<Cancelled>().is_some() {
            return hresult_from_win32(ERROR_INSTALL_USEREXIT);
        }
        if let Some(PipeError::Remote { code }) = cause.downcast_ref::<PipeError>() {
            return *code;
        }
        if let Some(PipeError::Timeout(_)) = cause.downcast_ref::<PipeError>() {
            return hresult_from_win32(ERROR_TIMEOUT);
        }
    }
    E_FAIL
}

/// Turns a failing code received from the other side back into an error.
pub fn error_from_code(code: u32, operation: &str) -> anyhow::Error {
    if is_user_exit(code) {
        anyhow::Error::new(Cancelled).context(format!("{operation} was cancelled"))
    } else {
        anyhow::Error::new(PipeError::Remote { code }).context(format!("{operation} failed"))
    }
}

/// `Ok(())` for a success code, the mapped error otherwise.
pub fn check_code(code: u32, operation: &str) -> anyhow::Result<()> {
    if succeeded(code) {
        Ok(())
    } else {
        Err(error_from_code(code, operation))
    }
}

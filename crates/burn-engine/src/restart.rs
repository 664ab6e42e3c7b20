use burn_core::Restart;
use burn_pipe::{ERROR_SUCCESS_REBOOT_INITIATED, ERROR_SUCCESS_REBOOT_REQUIRED};

/// Splits an installer exit code into the restart it asks for and the error
/// that remains. The two restart codes are successes.
pub fn restart_from_exit_code(code: u32) -> (Restart, u32) {
    match code {
        ERROR_SUCCESS_REBOOT_REQUIRED => (Restart::Required, 0),
        ERROR_SUCCESS_REBOOT_INITIATED => (Restart::Initiated, 0),
        other => (Restart::None, other),
    }
}

/// The process exit code that reports a finished apply.
pub fn exit_code_for(status: u32, restart: Restart) -> u32 {
    if status != 0 {
        return status;
    }
    match restart {
        Restart::None => 0,
        Restart::Required => ERROR_SUCCESS_REBOOT_REQUIRED,
        Restart::Initiated => ERROR_SUCCESS_REBOOT_INITIATED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_codes_clear_the_error() {
        assert_eq!(restart_from_exit_code(3010), (Restart::Required, 0));
        assert_eq!(restart_from_exit_code(1641), (Restart::Initiated, 0));
        assert_eq!(restart_from_exit_code(0), (Restart::None, 0));
        assert_eq!(restart_from_exit_code(1603), (Restart::None, 1603));
    }

    #[test]
    fn failures_win_over_restart() {
        assert_eq!(exit_code_for(0, Restart::Required), 3010);
        assert_eq!(exit_code_for(0, Restart::Initiated), 1641);
        assert_eq!(exit_code_for(0x8000_4005, Restart::Required), 0x8000_4005);
    }
}

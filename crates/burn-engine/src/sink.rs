use anyhow::Result;
use burn_core::{ErrorKind, ErrorReport, UiResult, UserExperience};

/// Installer message type for errors, in the high byte like Windows
/// Installer's `INSTALLMESSAGE_ERROR`.
pub const INSTALL_MESSAGE_ERROR: u32 = 0x0100_0000;
pub const INSTALL_MESSAGE_WARNING: u32 = 0x0200_0000;

/// `MB_RETRYCANCEL`, offered when a failed package may be retried.
pub const UI_HINT_RETRY_CANCEL: u32 = 0x0000_0005;

/// Receives what a running package reports and answers with the
/// application's choice. Implemented directly over the UX and, in the
/// elevated process, over the pipe back to the parent.
pub trait ExecuteSink {
    fn progress(&mut self, progress: u32, overall: u32) -> Result<UiResult>;

    fn error(&mut self, kind: ErrorKind, code: u32, ui_hint: u32, message: &str) -> Result<UiResult>;

    fn msi_message(&mut self, message_type: u32, ui_hint: u32, message: &str) -> Result<UiResult>;

    fn files_in_use(&mut self, files: &[String]) -> Result<UiResult>;
}

pub struct UxSink<'a> {
    ux: &'a dyn UserExperience,
    package_id: &'a str,
}

impl<'a> UxSink<'a> {
    pub fn new(ux: &'a dyn UserExperience, package_id: &'a str) -> Self {
        Self { ux, package_id }
    }
}

impl ExecuteSink for UxSink<'_> {
    fn progress(&mut self, progress: u32, overall: u32) -> Result<UiResult> {
        Ok(self
            .ux
            .on_execute_progress(self.package_id, progress, overall))
    }

    fn error(&mut self, kind: ErrorKind, code: u32, ui_hint: u32, message: &str) -> Result<UiResult> {
        Ok(self.ux.on_error(&ErrorReport {
            kind,
            package_id: Some(self.package_id),
            code,
            message,
            ui_hint,
        }))
    }

    fn msi_message(&mut self, message_type: u32, ui_hint: u32, message: &str) -> Result<UiResult> {
        Ok(self
            .ux
            .on_execute_msi_message(self.package_id, message_type, ui_hint, message))
    }

    fn files_in_use(&mut self, files: &[String]) -> Result<UiResult> {
        Ok(self.ux.on_execute_msi_files_in_use(self.package_id, files))
    }
}

use std::process::Command;

use anyhow::{Context, Result};
use burn_core::{classify_exit_code, ExitCodeKind, Restart};
use tracing::info;

use crate::error::PackageFailed;
use crate::request::ExeRequest;

pub fn build_exe_command(request: &ExeRequest) -> Command {
    let mut command = Command::new(&request.executable);
    if let Some(directory) = request
        .executable
        .parent()
        .filter(|directory| !directory.as_os_str().is_empty())
    {
        command.current_dir(directory);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.raw_arg(&request.arguments);
    }
    #[cfg(not(windows))]
    {
        command.args(crate::process::split_command_line(&request.arguments));
    }
    command
}

pub(crate) fn execute_exe_with_runner<RunCommand>(
    request: &ExeRequest,
    mut run: RunCommand,
) -> Result<Restart>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<u32>,
{
    info!(
        package = %request.package_id,
        executable = %request.executable.display(),
        arguments = %request.log_arguments,
        "running EXE package"
    );
    let mut command = build_exe_command(request);
    let exit_code = run(&mut command, "failed to run EXE package")
        .with_context(|| format!("package '{}'", request.package_id))?;
    exe_outcome(request, exit_code)
}

/// Applies the package's exit code table.
pub fn exe_outcome(request: &ExeRequest, exit_code: u32) -> Result<Restart> {
    let outcome = classify_exit_code(&request.exit_codes, exit_code);
    info!(package = %request.package_id, exit_code, ?outcome, "EXE package finished");
    match outcome {
        ExitCodeKind::Success => Ok(Restart::None),
        ExitCodeKind::ScheduleReboot => Ok(Restart::Required),
        ExitCodeKind::ForceReboot => Ok(Restart::Initiated),
        ExitCodeKind::Error => Err(PackageFailed {
            package_id: request.package_id.clone(),
            exit_code,
        }
        .into()),
    }
}

use std::process::Command;

use anyhow::{anyhow, Result};
use burn_core::{ActionState, Restart};
use tracing::info;

use crate::msi::installer_outcome;
use crate::request::MsuRequest;

/// `WU_S_ALREADY_INSTALLED`.
const ALREADY_INSTALLED: u32 = 0x0024_0006;
/// `WU_E_NOT_APPLICABLE`: the update does not apply to this machine.
const NOT_APPLICABLE: u32 = 0x8024_0017;

pub fn msu_arguments(request: &MsuRequest) -> Result<Vec<String>> {
    let mut arguments = Vec::new();
    match request.action {
        ActionState::Install => {
            let path = request
                .msu_path
                .as_deref()
                .ok_or_else(|| anyhow!("update '{}' has no cached MSU", request.package_id))?;
            arguments.push(path.display().to_string());
        }
        ActionState::Uninstall => {
            let kb = request
                .kb
                .as_deref()
                .ok_or_else(|| anyhow!("update '{}' cannot be removed without a KB", request.package_id))?;
            arguments.push("/uninstall".to_string());
            arguments.push(format!("/kb:{}", kb.trim_start_matches("KB")));
        }
        other => {
            return Err(anyhow!(
                "update '{}' has no operation for action '{}'",
                request.package_id,
                other.as_str()
            ))
        }
    }
    arguments.push("/quiet".to_string());
    arguments.push("/norestart".to_string());
    if let Some(log_path) = &request.log_path {
        arguments.push(format!("/log:{}", log_path.display()));
    }
    Ok(arguments)
}

pub(crate) fn execute_msu_with_runner<RunCommand>(
    request: &MsuRequest,
    mut run: RunCommand,
) -> Result<Restart>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<u32>,
{
    let arguments = msu_arguments(request)?;
    info!(
        package = %request.package_id,
        action = request.action.as_str(),
        "running MSU package"
    );
    let mut command = Command::new("wusa.exe");
    command.args(&arguments);
    let exit_code = match run(&mut command, "failed to run wusa")? {
        ALREADY_INSTALLED | NOT_APPLICABLE => 0,
        code => code,
    };
    installer_outcome(&request.package_id, exit_code)
}

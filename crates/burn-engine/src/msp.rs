use std::process::Command;

use anyhow::{anyhow, Result};
use burn_core::{ActionState, Restart};
use tracing::info;

use crate::msi::installer_outcome;
use crate::request::MspRequest;

/// Patches are applied to, repaired in, or removed from one target product
/// at a time.
pub fn msp_arguments(request: &MspRequest) -> Result<Vec<String>> {
    let mut arguments = vec!["/i".to_string(), request.product_code.clone()];
    match request.action {
        ActionState::Install | ActionState::Patch | ActionState::Modify => {
            arguments.push(format!("PATCH={}", patch_path(request)?));
        }
        ActionState::Repair => {
            arguments.push(format!("PATCH={}", patch_path(request)?));
            arguments.push("REINSTALL=ALL".to_string());
            arguments.push("REINSTALLMODE=omus".to_string());
        }
        ActionState::Uninstall => {
            arguments.push(format!("MSIPATCHREMOVE={}", request.patch_code));
        }
        other => {
            return Err(anyhow!(
                "patch '{}' has no operation for action '{}'",
                request.package_id,
                other.as_str()
            ))
        }
    }
    arguments.push("/quiet".to_string());
    arguments.push("/norestart".to_string());
    if let Some(log_path) = &request.log_path {
        arguments.push("/l*v".to_string());
        arguments.push(log_path.display().to_string());
    }
    arguments.push("REBOOT=ReallySuppress".to_string());
    Ok(arguments)
}

fn patch_path(request: &MspRequest) -> Result<String> {
    request
        .patch_path
        .as_deref()
        .map(|path| path.display().to_string())
        .ok_or_else(|| anyhow!("patch '{}' has no cached MSP", request.package_id))
}

pub(crate) fn execute_msp_with_runner<RunCommand>(
    request: &MspRequest,
    mut run: RunCommand,
) -> Result<Restart>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<u32>,
{
    let arguments = msp_arguments(request)?;
    info!(
        package = %request.package_id,
        product = %request.product_code,
        action = request.action.as_str(),
        "running MSP package"
    );
    let mut command = Command::new("msiexec");
    command.args(&arguments);
    let exit_code = run(&mut command, "failed to run msiexec for patch")?;
    installer_outcome(&request.package_id, exit_code)
}

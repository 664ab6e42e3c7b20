use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Result};
use burn_core::{ActionState, Cancelled, FeatureAction, Restart};
use burn_pipe::{ERROR_INSTALL_USEREXIT, ERROR_SUCCESS_REBOOT_INITIATED};
use tracing::{debug, info};

use crate::error::PackageFailed;
use crate::request::MsiRequest;
use crate::restart::restart_from_exit_code;
use crate::sink::{ExecuteSink, INSTALL_MESSAGE_ERROR, INSTALL_MESSAGE_WARNING};

const MSIEXEC: &str = "msiexec";

/// msiexec arguments for the request's action.
pub fn msi_arguments(request: &MsiRequest) -> Result<Vec<String>> {
    let mut arguments = Vec::new();
    match request.action {
        ActionState::Uninstall => {
            arguments.push("/x".to_string());
            arguments.push(request.product_code.clone());
        }
        ActionState::None | ActionState::Recache => {
            return Err(anyhow!(
                "package '{}' has no MSI operation for action '{}'",
                request.package_id,
                request.action.as_str()
            ))
        }
        action => {
            arguments.push("/i".to_string());
            arguments.push(source_text(request)?);
            match action {
                ActionState::MinorUpgrade => {
                    arguments.push("REINSTALL=ALL".to_string());
                    arguments.push("REINSTALLMODE=vomus".to_string());
                }
                ActionState::Repair => {
                    arguments.push("REINSTALL=ALL".to_string());
                    arguments.push("REINSTALLMODE=cemus".to_string());
                }
                _ => {}
            }
            arguments.extend(feature_properties(&request.features));
            if !request.patches.is_empty() {
                let patches = request
                    .patches
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>();
                arguments.push(format!("PATCH={}", patches.join(";")));
            }
        }
    }

    arguments.push("/quiet".to_string());
    arguments.push("/norestart".to_string());
    if let Some(log_path) = &request.log_path {
        arguments.push("/l*v".to_string());
        arguments.push(log_path.display().to_string());
    }
    for (name, value) in &request.properties {
        arguments.push(format!("{name}={value}"));
    }
    arguments.push("REBOOT=ReallySuppress".to_string());
    Ok(arguments)
}

fn source_text(request: &MsiRequest) -> Result<String> {
    request
        .package_path
        .as_deref()
        .map(|path| path.display().to_string())
        .ok_or_else(|| anyhow!("package '{}' has no cached MSI", request.package_id))
}

/// `ADDLOCAL=`, `REMOVE=` and friends from per-feature actions, in a fixed
/// order. Features with no action are left out.
pub fn feature_properties(features: &[(String, FeatureAction)]) -> Vec<String> {
    let groups = [
        (FeatureAction::AddLocal, "ADDLOCAL"),
        (FeatureAction::AddSource, "ADDSOURCE"),
        (FeatureAction::Advertise, "ADVERTISE"),
        (FeatureAction::Reinstall, "REINSTALL"),
        (FeatureAction::Remove, "REMOVE"),
    ];
    groups
        .iter()
        .filter_map(|(action, property)| {
            let names = features
                .iter()
                .filter(|(_, feature_action)| feature_action == action)
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>();
            (!names.is_empty()).then(|| format!("{property}={}", names.join(",")))
        })
        .collect()
}

pub(crate) fn execute_msi_with_runner<RunCommand>(
    request: &MsiRequest,
    sink: &mut dyn ExecuteSink,
    mut run: RunCommand,
) -> Result<Restart>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<u32>,
{
    let arguments = msi_arguments(request)?;
    info!(
        package = %request.package_id,
        action = request.action.as_str(),
        "running MSI package"
    );
    let mut command = Command::new(MSIEXEC);
    command.args(&arguments);
    let exit_code = run(&mut command, "failed to run msiexec")?;
    relay_log(request.log_path.as_deref(), exit_code, sink)?;
    installer_outcome(&request.package_id, exit_code)
}

/// Shared result handling for msiexec-driven packages.
pub(crate) fn installer_outcome(package_id: &str, exit_code: u32) -> Result<Restart> {
    let (restart, remaining) = restart_from_exit_code(exit_code);
    debug!(package = package_id, exit_code, ?restart, "installer finished");
    if remaining == 0 {
        return Ok(restart);
    }
    let failed = PackageFailed {
        package_id: package_id.to_string(),
        exit_code: remaining,
    };
    if remaining == ERROR_INSTALL_USEREXIT {
        return Err(anyhow::Error::new(failed).context(Cancelled));
    }
    Err(failed.into())
}

/// Sends what the verbose installer log recorded to the application:
/// files held in use, then error and warning lines of a failed run.
fn relay_log(log_path: Option<&Path>, exit_code: u32, sink: &mut dyn ExecuteSink) -> Result<()> {
    let Some(raw) = log_path.and_then(|path| std::fs::read(path).ok()) else {
        return Ok(());
    };
    let summary = scan_installer_log(&decode_log(&raw));
    if !summary.files_in_use.is_empty() {
        sink.files_in_use(&summary.files_in_use)?;
    }
    if exit_code != 0 && exit_code != ERROR_SUCCESS_REBOOT_INITIATED {
        for (message_type, text) in &summary.messages {
            sink.msi_message(*message_type, 0, text)?;
        }
    }
    Ok(())
}

/// Verbose installer logs are UTF-16LE with a byte order mark.
fn decode_log(raw: &[u8]) -> String {
    if raw.starts_with(&[0xFF, 0xFE]) {
        let units = raw[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(raw).into_owned()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallerLogSummary {
    pub files_in_use: Vec<String>,
    /// Message type and text of each error or warning line.
    pub messages: Vec<(u32, String)>,
}

pub fn scan_installer_log(log: &str) -> InstallerLogSummary {
    let mut summary = InstallerLogSummary::default();
    for line in log.lines() {
        if let Some(file) = held_in_use(line) {
            if !summary.files_in_use.contains(&file) {
                summary.files_in_use.push(file);
            }
            continue;
        }
        if let Some(text) = numbered_message(line, "Error ") {
            summary.messages.push((INSTALL_MESSAGE_ERROR, text));
        } else if let Some(text) = numbered_message(line, "Warning ") {
            summary.messages.push((INSTALL_MESSAGE_WARNING, text));
        }
    }
    summary
}

/// `The file <path> is being held in use ...`.
fn held_in_use(line: &str) -> Option<String> {
    let end = line.find(" is being held in use")?;
    let start = line[..end].rfind("The file ")? + "The file ".len();
    let file = line[start..end].trim();
    (!file.is_empty()).then(|| file.to_string())
}

/// `Error 1722. ...` anywhere in the line.
fn numbered_message(line: &str, prefix: &str) -> Option<String> {
    let start = line.find(prefix)?;
    let rest = &line[start + prefix.len()..];
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    (digits > 0 && rest[digits..].starts_with('.')).then(|| line[start..].trim().to_string())
}

pub(crate) fn default_log_path(log_directory: &Path, package_id: &str) -> PathBuf {
    log_directory.join(format!("{package_id}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: ActionState) -> MsiRequest {
        MsiRequest {
            package_id: "app".to_string(),
            package_path: Some(PathBuf::from("/cache/app/app.msi")),
            product_code: "{11111111-2222-3333-4444-555555555555}".to_string(),
            action,
            properties: vec![("INSTALLDIR".to_string(), "C:\\App Dir".to_string())],
            features: vec![
                ("Core".to_string(), FeatureAction::AddLocal),
                ("Docs".to_string(), FeatureAction::Remove),
                ("Tools".to_string(), FeatureAction::AddLocal),
                ("Extra".to_string(), FeatureAction::None),
            ],
            patches: vec![PathBuf::from("/cache/fix/fix.msp")],
            log_path: None,
        }
    }

    #[test]
    fn install_arguments_carry_features_patches_and_properties() {
        let arguments = msi_arguments(&request(ActionState::Install)).expect("install arguments");
        assert_eq!(
            arguments,
            vec![
                "/i",
                "/cache/app/app.msi",
                "ADDLOCAL=Core,Tools",
                "REMOVE=Docs",
                "PATCH=/cache/fix/fix.msp",
                "/quiet",
                "/norestart",
                "INSTALLDIR=C:\\App Dir",
                "REBOOT=ReallySuppress",
            ]
        );
    }

    #[test]
    fn uninstall_uses_product_code_and_ignores_features() {
        let arguments =
            msi_arguments(&request(ActionState::Uninstall)).expect("uninstall arguments");
        assert_eq!(arguments[0], "/x");
        assert_eq!(arguments[1], "{11111111-2222-3333-4444-555555555555}");
        assert!(!arguments.iter().any(|argument| argument.starts_with("ADDLOCAL")));
    }

    #[test]
    fn minor_upgrade_and_repair_reinstall_everything() {
        let minor = msi_arguments(&request(ActionState::MinorUpgrade)).expect("minor upgrade");
        assert!(minor.contains(&"REINSTALLMODE=vomus".to_string()));
        let repair = msi_arguments(&request(ActionState::Repair)).expect("repair");
        assert!(repair.contains(&"REINSTALLMODE=cemus".to_string()));
        assert!(msi_arguments(&request(ActionState::None)).is_err());
    }

    #[test]
    fn restart_codes_are_successes_and_user_exit_is_cancel() {
        assert_eq!(installer_outcome("app", 3010).expect("restart"), Restart::Required);
        let err = installer_outcome("app", 1602).expect_err("user exit");
        assert!(err.downcast_ref::<Cancelled>().is_some());
        let err = installer_outcome("app", 1603).expect_err("failure");
        let failed = err.downcast_ref::<PackageFailed>().expect("package failure");
        assert_eq!(failed.exit_code, 1603);
    }

    #[test]
    fn scans_files_in_use_and_errors_from_log() {
        let log = "MSI (s) (A4:B8): Info 1603.The file C:\\App\\app.exe is being held in use by the following process: Name: app\n\
                   MSI (s) (A4:B8): Product: App -- Error 1722. There is a problem with this package.\n\
                   Action ended: InstallFinalize. Return value 3.\n\
                   Warning 1946. Property could not be set.\n";
        let summary = scan_installer_log(log);
        assert_eq!(summary.files_in_use, vec!["C:\\App\\app.exe".to_string()]);
        assert_eq!(summary.messages.len(), 2);
        assert_eq!(summary.messages[0].0, INSTALL_MESSAGE_ERROR);
        assert!(summary.messages[0].1.starts_with("Error 1722."));
        assert_eq!(summary.messages[1].0, INSTALL_MESSAGE_WARNING);
    }

    #[test]
    fn decodes_utf16_logs() {
        let mut raw = vec![0xFF, 0xFE];
        for unit in "Error 1.x".encode_utf16() {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_log(&raw), "Error 1.x");
    }
}

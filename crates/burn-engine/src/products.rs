use std::process::Command;

use anyhow::{anyhow, Context, Result};
use burn_core::{parse_version_string, FeatureState, PackageState};

/// A product registered with Windows Installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProduct {
    pub product_code: String,
    pub version: u64,
    pub per_machine: bool,
}

/// Read-only view of the Windows Installer product database.
pub trait InstalledProducts: Send + Sync {
    fn product(&self, product_code: &str) -> Result<Option<InstalledProduct>>;
    fn related_products(&self, upgrade_code: &str) -> Result<Vec<InstalledProduct>>;
    fn feature_state(&self, product_code: &str, feature: &str) -> Result<FeatureState>;
    fn patch_state(&self, patch_code: &str, product_code: &str) -> Result<PackageState>;
}

const PRODUCT_SCRIPT: &str = r#"$ErrorActionPreference = 'Stop'
$i = New-Object -ComObject WindowsInstaller.Installer
$code = $env:BURN_PRODUCT_CODE
if ($i.ProductState($code) -ne 5) { exit 0 }
"$code|$($i.ProductInfo($code, 'VersionString'))|$($i.ProductInfo($code, 'AssignmentType'))""#;

const RELATED_SCRIPT: &str = r#"$ErrorActionPreference = 'Stop'
$i = New-Object -ComObject WindowsInstaller.Installer
foreach ($code in $i.RelatedProducts($env:BURN_UPGRADE_CODE)) {
  "$code|$($i.ProductInfo($code, 'VersionString'))|$($i.ProductInfo($code, 'AssignmentType'))"
}"#;

const FEATURE_SCRIPT: &str = r#"$ErrorActionPreference = 'Stop'
$i = New-Object -ComObject WindowsInstaller.Installer
$i.FeatureState($env:BURN_PRODUCT_CODE, $env:BURN_FEATURE)"#;

const PATCH_SCRIPT: &str = r#"$i = New-Object -ComObject WindowsInstaller.Installer
foreach ($context in 4, 2, 1) {
  try { $i.PatchInfoEx($env:BURN_PATCH_CODE, $env:BURN_PRODUCT_CODE, '', $context, 'State'); exit 0 } catch { }
}"#;

/// Queries Windows Installer through its automation interface. On other
/// hosts nothing is ever installed.
#[derive(Debug, Clone)]
pub struct WindowsInstallerProducts {
    program: String,
}

impl Default for WindowsInstallerProducts {
    fn default() -> Self {
        Self {
            program: "powershell".to_string(),
        }
    }
}

impl WindowsInstallerProducts {
    fn run(&self, script: &str, env: &[(&str, &str)]) -> Result<String> {
        let mut command = Command::new(&self.program);
        command
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(script);
        for (name, value) in env {
            command.env(name, value);
        }
        let output = command
            .output()
            .with_context(|| format!("failed to start {}", self.program))?;
        if !output.status.success() {
            return Err(anyhow!(
                "Windows Installer query failed: status={} stderr='{}'",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl InstalledProducts for WindowsInstallerProducts {
    fn product(&self, product_code: &str) -> Result<Option<InstalledProduct>> {
        if !cfg!(windows) {
            return Ok(None);
        }
        let stdout = self.run(PRODUCT_SCRIPT, &[("BURN_PRODUCT_CODE", product_code)])?;
        Ok(parse_product_lines(&stdout)?.into_iter().next())
    }

    fn related_products(&self, upgrade_code: &str) -> Result<Vec<InstalledProduct>> {
        if !cfg!(windows) {
            return Ok(Vec::new());
        }
        let stdout = self.run(RELATED_SCRIPT, &[("BURN_UPGRADE_CODE", upgrade_code)])?;
        parse_product_lines(&stdout)
    }

    fn feature_state(&self, product_code: &str, feature: &str) -> Result<FeatureState> {
        if !cfg!(windows) {
            return Ok(FeatureState::Absent);
        }
        let stdout = self.run(
            FEATURE_SCRIPT,
            &[("BURN_PRODUCT_CODE", product_code), ("BURN_FEATURE", feature)],
        )?;
        Ok(feature_state_from_install_state(stdout.trim().parse().unwrap_or(-1)))
    }

    fn patch_state(&self, patch_code: &str, product_code: &str) -> Result<PackageState> {
        if !cfg!(windows) {
            return Ok(PackageState::Absent);
        }
        let stdout = self.run(
            PATCH_SCRIPT,
            &[("BURN_PATCH_CODE", patch_code), ("BURN_PRODUCT_CODE", product_code)],
        )?;
        Ok(patch_state_from_msi_state(stdout.trim().parse().unwrap_or(0)))
    }
}

/// Parses `code|version|assignment` lines; assignment 1 is per-machine.
pub(crate) fn parse_product_lines(stdout: &str) -> Result<Vec<InstalledProduct>> {
    let mut products = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut fields = line.split('|');
        let (Some(code), Some(version), Some(assignment)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(anyhow!("malformed product line '{line}'"));
        };
        let version = parse_version_string(version)
            .with_context(|| format!("invalid version in product line '{line}'"))?;
        products.push(InstalledProduct {
            product_code: code.to_string(),
            version,
            per_machine: assignment.trim() == "1",
        });
    }
    Ok(products)
}

/// Maps an `INSTALLSTATE_*` value.
pub(crate) fn feature_state_from_install_state(state: i32) -> FeatureState {
    match state {
        1 => FeatureState::Advertised,
        2 => FeatureState::Absent,
        3 => FeatureState::Local,
        4 => FeatureState::Source,
        _ => FeatureState::Unknown,
    }
}

/// Maps an `MSIPATCHSTATE_*` value.
pub(crate) fn patch_state_from_msi_state(state: i32) -> PackageState {
    match state {
        1 => PackageState::Present,
        2 => PackageState::Superseded,
        4 => PackageState::Obsolete,
        _ => PackageState::Absent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_product_lines_with_assignment() {
        let products = parse_product_lines("{A}|1.2.3|1\r\n\r\n{B}|2.0|0\n").expect("lines parse");
        assert_eq!(
            products,
            vec![
                InstalledProduct {
                    product_code: "{A}".to_string(),
                    version: burn_core::pack_version(&[1, 2, 3]),
                    per_machine: true,
                },
                InstalledProduct {
                    product_code: "{B}".to_string(),
                    version: burn_core::pack_version(&[2]),
                    per_machine: false,
                },
            ]
        );
        assert!(parse_product_lines("{A}|1.0").is_err());
    }

    #[test]
    fn maps_installer_states() {
        assert_eq!(feature_state_from_install_state(3), FeatureState::Local);
        assert_eq!(feature_state_from_install_state(-1), FeatureState::Unknown);
        assert_eq!(patch_state_from_msi_state(2), PackageState::Superseded);
        assert_eq!(patch_state_from_msi_state(0), PackageState::Absent);
    }
}

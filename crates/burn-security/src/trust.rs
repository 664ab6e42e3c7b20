use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::certificate::CertificateInfo;
use crate::error::VerificationError;

/// Platform signature checks.
pub trait TrustProvider: Send + Sync {
    /// Verifies the Authenticode signature of `path` and returns its signing
    /// chain, leaf first.
    fn authenticode_chain(&self, path: &Path) -> Result<Vec<CertificateInfo>, VerificationError>;

    /// Verifies that the signed `catalog` lists `path` with a matching digest.
    fn verify_catalog_member(&self, catalog: &Path, path: &Path) -> Result<(), VerificationError>;
}

const AUTHENTICODE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$s = Get-AuthenticodeSignature -LiteralPath $env:BURN_VERIFY_PATH
if ($s.Status -ne 'Valid') { [Console]::Error.WriteLine($s.StatusMessage); exit 2 }
$c = New-Object System.Security.Cryptography.X509Certificates.X509Chain
[void]$c.Build($s.SignerCertificate)
foreach ($e in $c.ChainElements) { [BitConverter]::ToString($e.Certificate.RawData).Replace('-', '') }
"#;

const CATALOG_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$s = Get-AuthenticodeSignature -LiteralPath $env:BURN_CATALOG_PATH
if ($s.Status -ne 'Valid') { [Console]::Error.WriteLine($s.StatusMessage); exit 2 }
$r = Test-FileCatalog -CatalogFilePath $env:BURN_CATALOG_PATH -Path $env:BURN_VERIFY_PATH
if ($r -ne 'Valid') { [Console]::Error.WriteLine("catalog validation: $r"); exit 3 }
"#;

/// Asks Windows PowerShell to check signatures.
#[derive(Debug, Clone)]
pub struct PowerShellTrustProvider {
    program: String,
}

impl Default for PowerShellTrustProvider {
    fn default() -> Self {
        Self {
            program: "powershell".to_string(),
        }
    }
}

impl PowerShellTrustProvider {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run_script(
        &self,
        script: &str,
        path: &Path,
        catalog: Option<&Path>,
    ) -> Result<String, String> {
        let mut command = Command::new(&self.program);
        command
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .env("BURN_VERIFY_PATH", path);
        if let Some(catalog) = catalog {
            command.env("BURN_CATALOG_PATH", catalog);
        }
        debug!(program = %self.program, path = %path.display(), "checking signature");
        let output = command
            .output()
            .map_err(|err| format!("failed to start {}: {err}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("status={} stderr='{}'", output.status, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TrustProvider for PowerShellTrustProvider {
    fn authenticode_chain(&self, path: &Path) -> Result<Vec<CertificateInfo>, VerificationError> {
        let stdout = self
            .run_script(AUTHENTICODE_SCRIPT, path, None)
            .map_err(|reason| VerificationError::Unsigned {
                path: path.to_path_buf(),
                reason,
            })?;
        parse_chain_output(&stdout)
    }

    fn verify_catalog_member(&self, catalog: &Path, path: &Path) -> Result<(), VerificationError> {
        self.run_script(CATALOG_SCRIPT, path, Some(catalog))
            .map(|_| ())
            .map_err(|reason| VerificationError::Catalog {
                path: path.to_path_buf(),
                catalog: catalog.to_path_buf(),
                reason,
            })
    }
}

/// One hex-encoded DER certificate per line.
pub(crate) fn parse_chain_output(stdout: &str) -> Result<Vec<CertificateInfo>, VerificationError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let der = hex::decode(line).map_err(|err| {
                VerificationError::InvalidCertificate(format!("chain element is not hex: {err}"))
            })?;
            CertificateInfo::from_der(&der)
        })
        .collect()
}

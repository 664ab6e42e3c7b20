use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

// Well-known SIDs, so the grants do not depend on the system language.
const ADMINISTRATORS: &str = "*S-1-5-32-544";
const LOCAL_SYSTEM: &str = "*S-1-5-18";
const USERS: &str = "*S-1-5-32-545";
const EVERYONE: &str = "*S-1-1-0";

/// Locks the per-machine cache root down: full control for Administrators and
/// SYSTEM, read and execute for everyone else, owned by Administrators.
pub fn secure_cache_root(root: &Path) -> Result<()> {
    if cfg!(windows) {
        secure_cache_root_with_runner(root, run_command)
    } else {
        set_unix_mode(root, 0o755)
    }
}

pub(crate) fn secure_cache_root_with_runner<RunCommand>(
    root: &Path,
    mut run: RunCommand,
) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<()>,
{
    let mut grant = Command::new("icacls");
    grant
        .arg(root)
        .arg("/inheritance:r")
        .arg("/grant:r")
        .arg(format!("{ADMINISTRATORS}:(OI)(CI)F"))
        .arg(format!("{LOCAL_SYSTEM}:(OI)(CI)F"))
        .arg(format!("{USERS}:(OI)(CI)RX"))
        .arg(format!("{EVERYONE}:(OI)(CI)RX"));
    run(
        &mut grant,
        &format!("failed to secure package cache root {}", root.display()),
    )?;

    let mut owner = Command::new("icacls");
    owner.arg(root).arg("/setowner").arg(ADMINISTRATORS);
    run(
        &mut owner,
        &format!("failed to set owner of package cache root {}", root.display()),
    )
}

/// Drops explicit permissions on a freshly committed file so it inherits from
/// the secured cache directory.
pub fn reset_inherited_acl(path: &Path) -> Result<()> {
    if cfg!(windows) {
        reset_inherited_acl_with_runner(path, run_command)
    } else {
        set_unix_mode(path, 0o644)
    }
}

pub(crate) fn reset_inherited_acl_with_runner<RunCommand>(
    path: &Path,
    mut run: RunCommand,
) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<()>,
{
    let mut command = Command::new("icacls");
    command.arg(path).arg("/reset");
    run(
        &mut command,
        &format!("failed to reset permissions on {}", path.display()),
    )
}

fn set_unix_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .permissions();
        permissions.set_mode(mode);
        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("failed to set mode {mode:o} on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn command_line(command: &Command) -> Vec<String> {
        std::iter::once(command.get_program())
            .chain(command.get_args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn secure_root_grants_admins_and_system_then_sets_owner() {
        let mut seen = Vec::new();
        secure_cache_root_with_runner(&PathBuf::from(r"C:\ProgramData\Package Cache"), |command, _| {
            seen.push(command_line(command));
            Ok(())
        })
        .expect("runner succeeds");

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0][0], "icacls");
        assert!(seen[0].contains(&"/inheritance:r".to_string()));
        assert!(seen[0].contains(&"*S-1-5-32-544:(OI)(CI)F".to_string()));
        assert!(seen[0].contains(&"*S-1-5-18:(OI)(CI)F".to_string()));
        assert!(seen[0].contains(&"*S-1-1-0:(OI)(CI)RX".to_string()));
        assert_eq!(seen[1][2..], ["/setowner".to_string(), "*S-1-5-32-544".to_string()]);
    }

    #[test]
    fn secure_root_surfaces_runner_failures() {
        let err = secure_cache_root_with_runner(&PathBuf::from("root"), |_, context| {
            Err(anyhow!("{context}: access denied"))
        })
        .expect_err("failure propagates");
        assert!(err.to_string().contains("failed to secure package cache root"));
    }

    #[test]
    fn reset_acl_uses_icacls_reset() {
        let mut seen = Vec::new();
        reset_inherited_acl_with_runner(&PathBuf::from("file.msi"), |command, _| {
            seen.push(command_line(command));
            Ok(())
        })
        .expect("runner succeeds");
        assert_eq!(seen, vec![vec!["icacls", "file.msi", "/reset"]]);
    }
}

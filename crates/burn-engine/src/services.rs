use std::process::Command;

use anyhow::Result;
use tracing::{debug, info};

use crate::process::run_process;

/// `ERROR_SERVICE_ALREADY_RUNNING`.
const ALREADY_RUNNING: u32 = 1056;
/// `ERROR_SERVICE_NOT_ACTIVE`.
const NOT_ACTIVE: u32 = 1062;

pub fn start_service(name: &str) -> Result<()> {
    if !cfg!(windows) {
        debug!(service = name, "no service control on this host");
        return Ok(());
    }
    start_service_with_runner(name, run_process)
}

pub fn stop_service(name: &str) -> Result<()> {
    if !cfg!(windows) {
        debug!(service = name, "no service control on this host");
        return Ok(());
    }
    stop_service_with_runner(name, run_process)
}

pub(crate) fn start_service_with_runner<RunCommand>(name: &str, run: RunCommand) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<u32>,
{
    control_service(name, "start", ALREADY_RUNNING, run)
}

pub(crate) fn stop_service_with_runner<RunCommand>(name: &str, run: RunCommand) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<u32>,
{
    control_service(name, "stop", NOT_ACTIVE, run)
}

fn control_service<RunCommand>(
    name: &str,
    verb: &str,
    already: u32,
    mut run: RunCommand,
) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<u32>,
{
    let mut command = Command::new("sc.exe");
    command.arg(verb).arg(name);
    let code = run(&mut command, &format!("failed to {verb} service '{name}'"))?;
    match code {
        0 => info!(service = name, verb, "service control succeeded"),
        code if code == already => debug!(service = name, verb, "service already in state"),
        code => anyhow::bail!("failed to {verb} service '{name}': sc.exe exited with {code}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_in_state_is_success() {
        let mut seen = Vec::new();
        start_service_with_runner("wuauserv", |command, _context| {
            seen.push(
                command
                    .get_args()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect::<Vec<_>>(),
            );
            Ok(ALREADY_RUNNING)
        })
        .expect("already running is fine");
        assert_eq!(seen, vec![vec!["start".to_string(), "wuauserv".to_string()]]);

        stop_service_with_runner("wuauserv", |_command, _context| Ok(NOT_ACTIVE))
            .expect("already stopped is fine");
        let err = stop_service_with_runner("wuauserv", |_command, _context| Ok(5))
            .expect_err("access denied fails");
        assert!(err.to_string().contains("exited with 5"));
    }
}

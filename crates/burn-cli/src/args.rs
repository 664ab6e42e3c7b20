use std::ffi::OsString;
use std::path::PathBuf;

use burn_core::BundleAction;
use clap::{ArgGroup, Parser};

/// Switches a bundle accepts with a `-`, `/` or `--` prefix. Anything else
/// passes through untouched so paths like `/tmp/setup.log` survive.
const RESERVED_SWITCHES: &[&str] = &[
    "burn.elevated",
    "burn.embedded",
    "q",
    "quiet",
    "s",
    "silent",
    "passive",
    "install",
    "repair",
    "uninstall",
    "modify",
    "layout",
    "l",
    "log",
    "norestart",
    "plan-only",
    "manifest",
    "help",
    "version",
];

#[derive(Parser, Debug)]
#[command(name = "burn")]
#[command(about = "Bundle bootstrapper engine", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("action").args(["install", "repair", "uninstall", "modify", "layout"])))]
#[command(group(ArgGroup::new("display").args(["quiet", "passive"])))]
#[command(group(ArgGroup::new("mode").args(["burn_elevated", "burn_embedded", "plan_only"])))]
pub(crate) struct Cli {
    /// Serve an unelevated parent as its elevated engine.
    #[arg(long = "burn.elevated", num_args = 2, value_names = ["PIPE", "TOKEN"], hide = true)]
    pub burn_elevated: Option<Vec<String>>,
    /// Run as a bundle embedded in a parent bundle.
    #[arg(long = "burn.embedded", num_args = 2, value_names = ["PIPE", "TOKEN"], hide = true)]
    pub burn_embedded: Option<Vec<String>>,
    #[arg(long, visible_aliases = ["q", "silent", "s"])]
    pub quiet: bool,
    #[arg(long)]
    pub passive: bool,
    #[arg(long)]
    pub install: bool,
    #[arg(long)]
    pub repair: bool,
    #[arg(long)]
    pub uninstall: bool,
    #[arg(long)]
    pub modify: bool,
    /// Copy the bundle and its payloads to DIR (default: current directory).
    #[arg(long, num_args = 0..=1, value_name = "DIR")]
    pub layout: Option<Option<PathBuf>>,
    /// Append the engine log to FILE instead of stderr.
    #[arg(long, visible_alias = "l", value_name = "FILE")]
    pub log: Option<PathBuf>,
    /// Report a required restart without asking for it.
    #[arg(long)]
    pub norestart: bool,
    /// Print the computed plan as JSON and exit without applying it.
    #[arg(long = "plan-only")]
    pub plan_only: bool,
    /// Bundle manifest (default: bundle.toml next to the executable).
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Display {
    Quiet,
    Passive,
    Full,
}

/// Which engine role this process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunMode {
    Normal,
    Elevated { pipe: String, token: String },
    Embedded { pipe: String, token: String },
}

impl Cli {
    pub(crate) fn parse_normalized() -> Self {
        Self::parse_from(normalize_args(std::env::args_os()))
    }

    pub(crate) fn action(&self) -> BundleAction {
        if self.uninstall {
            BundleAction::Uninstall
        } else if self.repair {
            BundleAction::Repair
        } else if self.modify {
            BundleAction::Modify
        } else if self.layout.is_some() {
            BundleAction::Layout
        } else {
            BundleAction::Install
        }
    }

    pub(crate) fn display(&self) -> Display {
        if self.quiet {
            Display::Quiet
        } else if self.passive {
            Display::Passive
        } else {
            Display::Full
        }
    }

    pub(crate) fn mode(&self) -> RunMode {
        if let Some((pipe, token)) = self.burn_elevated.as_deref().and_then(pipe_and_token) {
            return RunMode::Elevated { pipe, token };
        }
        if let Some((pipe, token)) = self.burn_embedded.as_deref().and_then(pipe_and_token) {
            return RunMode::Embedded { pipe, token };
        }
        RunMode::Normal
    }

    /// The explicit layout directory, if `-layout` named one.
    pub(crate) fn layout_directory(&self) -> Option<PathBuf> {
        self.layout.clone().flatten()
    }
}

fn pipe_and_token(values: &[String]) -> Option<(String, String)> {
    match values {
        [pipe, token] => Some((pipe.clone(), token.clone())),
        _ => None,
    }
}

/// Rewrites `-switch` and `/switch` spellings of the reserved switches to
/// clap's `--switch`. Switch names are matched case-insensitively.
pub(crate) fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut args = args.into_iter().map(Into::into);
    let mut normalized = Vec::new();
    if let Some(program) = args.next() {
        normalized.push(program);
    }
    normalized.extend(args.map(|arg| normalize_switch(&arg).unwrap_or(arg)));
    normalized
}

fn normalize_switch(arg: &OsString) -> Option<OsString> {
    let text = arg.to_str()?;
    let name = text
        .strip_prefix("--")
        .or_else(|| text.strip_prefix('-'))
        .or_else(|| text.strip_prefix('/'))?;
    let (name, value) = match name.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (name, None),
    };
    let name = name.to_ascii_lowercase();
    let name = if name == "?" { "help".to_string() } else { name };
    if !RESERVED_SWITCHES.contains(&name.as_str()) {
        return None;
    }
    Some(match value {
        Some(value) => OsString::from(format!("--{name}={value}")),
        None => OsString::from(format!("--{name}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(args: &[&str]) -> Vec<String> {
        normalize_args(args.iter().copied())
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn slash_and_dash_switches_become_long_options() {
        assert_eq!(
            normalized(&["setup.exe", "/Quiet", "-norestart", "--repair", "/?"]),
            vec!["setup.exe", "--quiet", "--norestart", "--repair", "--help"]
        );
    }

    #[test]
    fn values_and_unknown_arguments_pass_through() {
        assert_eq!(
            normalized(&["setup.exe", "-log", "/tmp/setup.log", "/layout=/srv/out", "-x"]),
            vec!["setup.exe", "--log", "/tmp/setup.log", "--layout=/srv/out", "-x"]
        );
    }

    #[test]
    fn program_name_is_never_rewritten() {
        assert_eq!(normalized(&["/quiet"]), vec!["/quiet"]);
    }
}

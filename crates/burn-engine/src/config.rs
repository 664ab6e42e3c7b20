use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use burn_cache::{CacheLayout, RetryPolicy};

pub const MACHINE_ROOT_ENV: &str = "BURN_MACHINE_ROOT";
pub const USER_ROOT_ENV: &str = "BURN_USER_ROOT";

/// Everything about the host the engine needs to know, resolved once at
/// startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub machine_root: PathBuf,
    pub user_root: PathBuf,
    pub working_root: PathBuf,
    /// The running bundle executable, cached at session begin.
    pub bundle_executable: PathBuf,
    /// Directory external payloads and attached containers are read from.
    pub source_directory: PathBuf,
    pub retry: RetryPolicy,
    pub elevation_timeout: Duration,
    pub cache_join_timeout: Duration,
    pub rollback_cache: bool,
}

impl EngineConfig {
    pub fn new(machine_root: impl Into<PathBuf>, user_root: impl Into<PathBuf>) -> Self {
        let working_root = std::env::temp_dir().join(format!("burn-{}", std::process::id()));
        Self {
            machine_root: machine_root.into(),
            user_root: user_root.into(),
            working_root,
            bundle_executable: PathBuf::new(),
            source_directory: PathBuf::from("."),
            retry: RetryPolicy::default(),
            elevation_timeout: Duration::from_secs(300),
            cache_join_timeout: Duration::from_secs(60),
            rollback_cache: false,
        }
    }

    /// Resolves roots from `BURN_MACHINE_ROOT` / `BURN_USER_ROOT`, falling
    /// back to the platform's shared and per-user data directories.
    pub fn from_env() -> Result<Self> {
        let machine_root = match std::env::var_os(MACHINE_ROOT_ENV) {
            Some(root) => PathBuf::from(root),
            None => default_machine_root()?,
        };
        let user_root = match std::env::var_os(USER_ROOT_ENV) {
            Some(root) => PathBuf::from(root),
            None => default_user_root()?,
        };
        let mut config = Self::new(machine_root, user_root);
        if let Ok(executable) = std::env::current_exe() {
            if let Some(parent) = executable.parent() {
                config.source_directory = parent.to_path_buf();
            }
            config.bundle_executable = executable;
        }
        Ok(config)
    }

    pub fn with_bundle_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.bundle_executable = executable.into();
        self
    }

    pub fn with_source_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.source_directory = directory.into();
        self
    }

    pub fn with_working_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.working_root = root.into();
        self
    }

    pub fn cache_layout(&self) -> CacheLayout {
        CacheLayout::new(&self.machine_root, &self.user_root, &self.working_root)
    }

    pub fn registration_root(&self, per_machine: bool) -> PathBuf {
        self.scope_root(per_machine).join("Registration")
    }

    pub fn dependency_root(&self, per_machine: bool) -> PathBuf {
        self.scope_root(per_machine).join("Dependencies")
    }

    pub fn log_directory(&self) -> &Path {
        &self.working_root
    }

    fn scope_root(&self, per_machine: bool) -> &Path {
        if per_machine {
            &self.machine_root
        } else {
            &self.user_root
        }
    }
}

pub fn default_machine_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let program_data = std::env::var("ProgramData")
            .context("ProgramData is not set; cannot resolve the per-machine root")?;
        return Ok(PathBuf::from(program_data));
    }
    Ok(PathBuf::from("/var/cache/burn"))
}

pub fn default_user_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve the per-user root")?;
        return Ok(PathBuf::from(app_data));
    }

    if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(cache_home).join("burn"));
    }
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve the per-user root")?;
    Ok(PathBuf::from(home).join(".cache").join("burn"))
}

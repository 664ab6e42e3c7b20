mod apply;
mod config;
mod context;
mod dependency;
mod detect;
mod elevated;
mod elevation;
mod embedded;
mod engine;
mod error;
mod exe;
mod executor;
mod host;
mod msi;
mod msp;
mod msu;
mod process;
mod products;
mod registration;
mod request;
mod restart;
mod services;
mod sink;
mod syncpoint;

pub use apply::{apply, ApplyResult, CacheHosts, ExecuteHosts};
pub use config::{default_machine_root, default_user_root, EngineConfig, MACHINE_ROOT_ENV, USER_ROOT_ENV};
pub use context::EngineContext;
pub use dependency::{DependencyStore, ProviderRecord};
pub use detect::detect;
pub use elevated::run_elevated;
pub use elevation::{ElevatedCache, ElevatedControl, ElevatedSession, ELEVATED_SWITCH};
pub use embedded::{run_embedded, EmbeddedReporter, EmbeddedUx, EMBEDDED_SWITCH};
pub use engine::{Engine, RunOutcome};
pub use error::{error_code, ElevationError, PackageFailed, RequestError};
pub use exe::{build_exe_command, exe_outcome};
pub use executor::{error_kind, CommandRunner, PackageExecutor};
pub use host::{CacheHost, ExecuteHost, LocalHost};
pub use msi::{feature_properties, msi_arguments, scan_installer_log, InstallerLogSummary};
pub use msp::msp_arguments;
pub use msu::msu_arguments;
pub use process::{
    join_command_line, run_command, run_process, split_command_line, ChildProcess,
    ProcessLauncher, SystemLauncher,
};
pub use products::{InstalledProduct, InstalledProducts, WindowsInstallerProducts};
pub use registration::{
    current_boot_id, detect_related_bundles, relation_to, resume_mode, RegistrationRecord,
    RegistrationStore, SessionEnd,
};
pub use request::{
    CachePayloadRequest, CleanRequest, DependencyRequest, ExeRequest, ExecuteRequest, MsiRequest,
    MspRequest, MsuRequest, ProgressMessage, RelatedBundlesQuery, SaveStateRequest,
    SessionBeginRequest, SessionEndRequest, SessionRequest, TextMessage,
};
pub use restart::{exit_code_for, restart_from_exit_code};
pub use sink::{ExecuteSink, UxSink, INSTALL_MESSAGE_ERROR, INSTALL_MESSAGE_WARNING, UI_HINT_RETRY_CANCEL};
pub use syncpoint::Syncpoints;

#[cfg(test)]
mod tests;

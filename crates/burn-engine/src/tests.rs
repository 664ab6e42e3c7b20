use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use burn_cache::{Downloader, ProgressFn, RetryPolicy};
use burn_core::{
    BufferWriter, Bundle, BundleAction, BundleManifest, Cancelled, ErrorKind, ErrorReport,
    FeatureState, PackageState, ResumeMode, UiResult, UserExperience,
};
use burn_pipe::{hresult_from_win32, ERROR_CANCELLED, ERROR_INSTALL_FAILURE, ERROR_INSTALL_USEREXIT};
use burn_security::{CertificateInfo, TrustProvider, VerificationError};
use sha1::{Digest, Sha1};

use crate::{
    run_elevated, ChildProcess, CommandRunner, ElevationError, Engine, EngineConfig,
    EngineContext, InstalledProduct, InstalledProducts, PackageExecutor, ProcessLauncher,
    RegistrationRecord, ELEVATED_SWITCH,
};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "burn-engine-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

struct NoTrust;

impl TrustProvider for NoTrust {
    fn authenticode_chain(&self, path: &Path) -> Result<Vec<CertificateInfo>, VerificationError> {
        Err(VerificationError::Unsigned {
            path: path.to_path_buf(),
            reason: "no signatures in tests".to_string(),
        })
    }

    fn verify_catalog_member(&self, _catalog: &Path, path: &Path) -> Result<(), VerificationError> {
        Err(VerificationError::Unverifiable {
            path: path.to_path_buf(),
        })
    }
}

struct NoProducts;

impl InstalledProducts for NoProducts {
    fn product(&self, _product_code: &str) -> Result<Option<InstalledProduct>> {
        Ok(None)
    }

    fn related_products(&self, _upgrade_code: &str) -> Result<Vec<InstalledProduct>> {
        Ok(Vec::new())
    }

    fn feature_state(&self, _product_code: &str, _feature: &str) -> Result<FeatureState> {
        Ok(FeatureState::Absent)
    }

    fn patch_state(&self, _patch_code: &str, _product_code: &str) -> Result<PackageState> {
        Ok(PackageState::Absent)
    }
}

struct NoDownloads;

impl Downloader for NoDownloads {
    fn download(&self, url: &str, _destination: &Path, _progress: &mut ProgressFn<'_>) -> Result<()> {
        Err(anyhow!("downloads are disabled in tests: {url}"))
    }
}

fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(root.join("machine"), root.join("user"))
        .with_working_root(root.join("work"))
        .with_source_directory(root.join("source"));
    config.retry = RetryPolicy::none();
    config.elevation_timeout = Duration::from_secs(10);
    config.cache_join_timeout = Duration::from_secs(10);
    config
}

fn test_context(root: &Path) -> EngineContext {
    EngineContext::new(
        test_config(root),
        Arc::new(NoTrust),
        Arc::new(NoProducts),
        Arc::new(NoDownloads),
    )
}

/// Installer runs seen by a [`CommandRunner`], as `file args...`.
#[derive(Default, Clone)]
struct RunLog {
    runs: Arc<Mutex<Vec<String>>>,
}

impl RunLog {
    /// Fails any run whose arguments include `/fail`.
    fn runner(&self) -> Arc<CommandRunner> {
        let runs = Arc::clone(&self.runs);
        Arc::new(move |command: &mut Command, _context: &str| {
            let program = Path::new(command.get_program())
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let arguments = command
                .get_args()
                .map(|argument| argument.to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            let failed = arguments.iter().any(|argument| argument == "/fail");
            runs.lock()
                .expect("run log lock")
                .push(format!("{program} {}", arguments.join(" ")));
            Ok(if failed { ERROR_INSTALL_FAILURE } else { 0 })
        })
    }

    fn runs(&self) -> Vec<String> {
        self.runs.lock().expect("run log lock").clone()
    }
}

struct NoLauncher;

impl ProcessLauncher for NoLauncher {
    fn launch(
        &self,
        executable: &Path,
        _arguments: &[String],
        _elevate: bool,
    ) -> Result<Box<dyn ChildProcess>> {
        Err(anyhow!("unexpected launch of {}", executable.display()))
    }
}

fn engine(root: &Path, log: &RunLog, launcher: Arc<dyn ProcessLauncher>) -> Engine {
    engine_with(test_context(root), log, launcher)
}

fn engine_with(context: EngineContext, log: &RunLog, launcher: Arc<dyn ProcessLauncher>) -> Engine {
    let executor = PackageExecutor::new(Arc::new(NoLauncher), Duration::from_secs(5))
        .with_runner(log.runner());
    Engine::new(context, executor, launcher)
}

#[derive(Default)]
struct RecordingUx {
    events: Mutex<Vec<String>>,
    cancel_package: Option<String>,
    elevations: AtomicUsize,
}

impl RecordingUx {
    fn cancelling(package_id: &str) -> Self {
        Self {
            cancel_package: Some(package_id.to_string()),
            ..Self::default()
        }
    }

    fn record(&self, event: String) {
        self.events.lock().expect("event lock").push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("event lock").clone()
    }
}

impl UserExperience for RecordingUx {
    fn on_elevate(&self) -> UiResult {
        self.elevations.fetch_add(1, Ordering::SeqCst);
        UiResult::NoAction
    }

    fn on_cache_package_complete(&self, package_id: &str, succeeded: bool) {
        self.record(format!("cached {package_id} {succeeded}"));
    }

    fn on_execute_package_begin(&self, package_id: &str, execute: bool) -> UiResult {
        self.record(format!("begin {package_id} {execute}"));
        if execute && self.cancel_package.as_deref() == Some(package_id) {
            return UiResult::Cancel;
        }
        UiResult::NoAction
    }

    fn on_error(&self, report: &ErrorReport<'_>) -> UiResult {
        let kind = match report.kind {
            ErrorKind::Elevation => "elevation",
            ErrorKind::Windows => "windows",
            ErrorKind::ExePackage => "exe",
            ErrorKind::MsiPackage => "msi",
            ErrorKind::Cache => "cache",
        };
        self.record(format!("error {kind} {}", report.package_id.unwrap_or("-")));
        UiResult::NoAction
    }

    fn on_apply_complete(&self, status: u32, _restart: burn_core::Restart) -> UiResult {
        self.record(format!("complete 0x{status:08x}"));
        UiResult::NoAction
    }
}

fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// Writes `name` into the source directory and returns its payload entry.
fn source_payload(root: &Path, key: &str, name: &str) -> String {
    let source = root.join("source");
    fs::create_dir_all(&source).expect("must create source dir");
    let content = format!("{name} installer bytes");
    fs::write(source.join(name), &content).expect("must write payload");
    format!(
        r#"
[[payloads]]
key = "{key}"
file = "{name}"
size = {}
hash = "{}"
"#,
        content.len(),
        sha1_hex(content.as_bytes())
    )
}

fn exe_package(id: &str, payload: &str, install_arguments: &str, extra: &str) -> String {
    format!(
        r#"
[[packages]]
id = "{id}"
type = "exe"
cache_id = "{id}-v1"
install_arguments = "{install_arguments}"
uninstall_arguments = "/uninstall"
payloads = ["{payload}"]
{extra}
"#
    )
}

fn bundle_from(header_extra: &str, body: &str) -> Bundle {
    let manifest = format!(
        r#"
[bundle]
id = "engine-bundle"
provider_key = "Acme.Engine"
name = "Engine Bundle"
version = "1.0.0"
{header_extra}
{body}
"#
    );
    BundleManifest::from_toml_str(&manifest)
        .expect("manifest should parse")
        .into_bundle()
        .expect("bundle should build")
}

fn two_package_bundle(root: &Path, second_arguments: &str) -> Bundle {
    let body = [
        source_payload(root, "FirstExe", "first.exe"),
        source_payload(root, "SecondExe", "second.exe"),
        exe_package("First", "FirstExe", "/install", ""),
        exe_package("Second", "SecondExe", second_arguments, ""),
    ]
    .concat();
    bundle_from("", &body)
}

#[test]
fn install_caches_executes_and_registers() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(NoLauncher));
    let mut bundle = two_package_bundle(&root, "/install");
    let ux = RecordingUx::default();

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    assert!(outcome.apply.succeeded(), "{:?}", outcome.apply.error);
    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.apply.rolled_back);
    assert_eq!(log.runs(), vec!["first.exe /install", "second.exe /install"]);

    let cached = engine
        .context()
        .cache
        .layout()
        .completed_payload_path(false, "Second-v1", "second.exe")
        .expect("cache path");
    assert_eq!(
        fs::read_to_string(cached).expect("payload should be cached"),
        "second.exe installer bytes"
    );

    let record = engine
        .context()
        .registrations(false)
        .read("engine-bundle")
        .expect("registration should read")
        .expect("bundle should stay registered");
    assert!(record.installed);
    assert_eq!(record.resume, ResumeMode::Arp);

    let events = ux.events();
    assert!(events.contains(&"cached First true".to_string()));
    assert!(events.contains(&"begin Second true".to_string()));
    assert_eq!(events.last().map(String::as_str), Some("complete 0x00000000"));
}

#[test]
fn failed_package_rolls_back_and_unregisters() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(NoLauncher));
    let mut bundle = two_package_bundle(&root, "/install /fail");
    let ux = RecordingUx::default();

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    assert!(!outcome.apply.succeeded());
    assert!(outcome.apply.rolled_back);
    assert_eq!(outcome.exit_code, hresult_from_win32(ERROR_INSTALL_FAILURE));

    let runs = log.runs();
    assert_eq!(runs.first().map(String::as_str), Some("first.exe /install"));
    assert!(runs.contains(&"second.exe /install /fail".to_string()));
    assert_eq!(runs.last().map(String::as_str), Some("first.exe /uninstall"));
    assert!(ux.events().contains(&"begin First false".to_string()));
    assert!(ux.events().contains(&"error exe Second".to_string()));

    let record = engine
        .context()
        .registrations(false)
        .read("engine-bundle")
        .expect("registration should read");
    assert!(record.is_none(), "a failed first install must not stay registered");
}

#[test]
fn non_vital_boundary_failure_continues_with_next_boundary() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(NoLauncher));
    let body = [
        source_payload(&root, "OptionalExe", "optional.exe"),
        source_payload(&root, "CoreExe", "core.exe"),
        r#"
[[rollback_boundaries]]
id = "optional"
vital = false

[[rollback_boundaries]]
id = "core"
"#
        .to_string(),
        exe_package(
            "Optional",
            "OptionalExe",
            "/install /fail",
            r#"rollback_boundary = "optional""#,
        ),
        exe_package("Core", "CoreExe", "/install", r#"rollback_boundary = "core""#),
    ]
    .concat();
    let mut bundle = bundle_from("", &body);
    let ux = RecordingUx::default();

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    assert!(outcome.apply.succeeded(), "{:?}", outcome.apply.error);
    assert!(outcome.apply.rolled_back);
    let runs = log.runs();
    assert!(runs.contains(&"optional.exe /uninstall".to_string()));
    assert_eq!(runs.last().map(String::as_str), Some("core.exe /install"));
}

#[test]
fn non_vital_package_failure_rolls_back_its_boundary_then_continues() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(NoLauncher));
    let body = [
        source_payload(&root, "FirstExe", "first.exe"),
        source_payload(&root, "SecondExe", "second.exe"),
        source_payload(&root, "ThirdExe", "third.exe"),
        r#"
[[rollback_boundaries]]
id = "main"

[[rollback_boundaries]]
id = "tail"
"#
        .to_string(),
        exe_package("First", "FirstExe", "/install", r#"rollback_boundary = "main""#),
        exe_package("Second", "SecondExe", "/install /fail", "vital = false"),
        exe_package("Third", "ThirdExe", "/install", r#"rollback_boundary = "tail""#),
    ]
    .concat();
    let mut bundle = bundle_from("", &body);
    let ux = RecordingUx::default();

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    assert!(outcome.apply.succeeded(), "{:?}", outcome.apply.error);
    assert!(outcome.apply.rolled_back);
    assert_eq!(
        log.runs(),
        vec![
            "first.exe /install",
            "second.exe /install /fail",
            "second.exe /uninstall",
            "first.exe /uninstall",
            "third.exe /install",
        ]
    );
    assert!(ux.events().contains(&"begin First false".to_string()));
}

#[test]
fn vital_package_failure_inside_a_boundary_stops_at_the_boundary() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(NoLauncher));
    let body = [
        source_payload(&root, "FirstExe", "first.exe"),
        source_payload(&root, "SecondExe", "second.exe"),
        r#"
[[rollback_boundaries]]
id = "first"

[[rollback_boundaries]]
id = "second"
"#
        .to_string(),
        exe_package("First", "FirstExe", "/install", r#"rollback_boundary = "first""#),
        exe_package(
            "Second",
            "SecondExe",
            "/install /fail",
            r#"rollback_boundary = "second""#,
        ),
    ]
    .concat();
    let mut bundle = bundle_from("", &body);
    let ux = RecordingUx::default();

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    assert!(!outcome.apply.succeeded());
    assert!(outcome.apply.rolled_back);
    assert_eq!(
        log.runs(),
        vec![
            "first.exe /install",
            "second.exe /install /fail",
            "second.exe /uninstall",
        ]
    );
}

#[test]
fn cancel_at_package_begin_rolls_back_as_user_exit() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(NoLauncher));
    let mut bundle = two_package_bundle(&root, "/install");
    let ux = RecordingUx::cancelling("Second");

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    let error = outcome.apply.error.as_ref().expect("apply should fail");
    assert!(error.chain().any(|cause| cause.downcast_ref::<Cancelled>().is_some()));
    assert_eq!(outcome.exit_code, hresult_from_win32(ERROR_INSTALL_USEREXIT));
    let runs = log.runs();
    assert!(!runs.iter().any(|run| run.starts_with("second.exe /install")));
    assert_eq!(runs.last().map(String::as_str), Some("first.exe /uninstall"));
}

#[test]
fn detect_restores_persisted_variables_of_an_active_session() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(NoLauncher));
    let header = r#"
[[variables]]
name = "InstallFolder"
value = "default"
persisted = true
"#;
    let mut interrupted = bundle_from(header, "");
    interrupted
        .variables
        .set_persisted("InstallFolder", "restored")
        .expect("variable should set");

    let store = engine.context().registrations(false);
    store
        .session_begin(RegistrationRecord::from_registration(
            &interrupted.registration,
            None,
        ))
        .expect("session should begin");
    let mut state = BufferWriter::new();
    interrupted.variables.serialize(&mut state);
    store
        .save_state("engine-bundle", &state.into_bytes())
        .expect("state should save");

    let mut bundle = bundle_from(header, "");
    engine
        .detect(&mut bundle, &RecordingUx::default())
        .expect("detect should succeed");

    assert_eq!(bundle.registration.resume_mode, ResumeMode::Active);
    assert_eq!(
        bundle.variables.get_string("InstallFolder").as_deref(),
        Some("restored")
    );
}

#[test]
fn layout_copies_bundle_and_payloads_without_registering() {
    let root = test_root();
    let log = RunLog::default();
    let executable = root.join("bundle.exe");
    fs::write(&executable, "bundle bytes").expect("must write bundle executable");
    let context = EngineContext::new(
        test_config(&root).with_bundle_executable(&executable),
        Arc::new(NoTrust),
        Arc::new(NoProducts),
        Arc::new(NoDownloads),
    );
    let engine = engine_with(context, &log, Arc::new(NoLauncher));
    let mut bundle = two_package_bundle(&root, "/install");
    let layout = root.join("layout");

    let outcome = engine
        .run(
            &mut bundle,
            &RecordingUx::default(),
            BundleAction::Layout,
            Some(layout.clone()),
        )
        .expect("run should complete");

    assert!(outcome.apply.succeeded(), "{:?}", outcome.apply.error);
    assert!(log.runs().is_empty());
    assert_eq!(
        fs::read_to_string(layout.join("Engine Bundle.exe")).expect("bundle should be laid out"),
        "bundle bytes"
    );
    assert!(layout.join("first.exe").is_file());
    assert!(layout.join("second.exe").is_file());
    assert!(engine
        .context()
        .registrations(false)
        .read("engine-bundle")
        .expect("registration should read")
        .is_none());
}

/// Runs the elevated engine on a thread in place of an elevated process.
struct ThreadLauncher {
    root: PathBuf,
    log: RunLog,
}

struct ThreadChild {
    handle: Option<JoinHandle<Result<u32>>>,
    exit_code: Option<u32>,
}

impl ThreadChild {
    fn reap(&mut self) -> Result<Option<u32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        match self.handle.take() {
            Some(handle) if handle.is_finished() => {
                let code = handle
                    .join()
                    .map_err(|_| anyhow!("elevated thread panicked"))??;
                self.exit_code = Some(code);
                Ok(Some(code))
            }
            Some(handle) => {
                self.handle = Some(handle);
                Ok(None)
            }
            None => Ok(self.exit_code),
        }
    }
}

impl ChildProcess for ThreadChild {
    fn try_wait(&mut self) -> Result<Option<u32>> {
        self.reap()
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<u32>> {
        let started = Instant::now();
        loop {
            if let Some(code) = self.reap()? {
                return Ok(Some(code));
            }
            if started.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ProcessLauncher for ThreadLauncher {
    fn launch(
        &self,
        _executable: &Path,
        arguments: &[String],
        elevate: bool,
    ) -> Result<Box<dyn ChildProcess>> {
        assert!(elevate, "only the elevated engine is launched");
        assert_eq!(arguments[1], ELEVATED_SWITCH);
        let pipe = arguments[2].clone();
        let token = arguments[3].clone();
        let context = Arc::new(test_context(&self.root));
        let executor = PackageExecutor::new(Arc::new(NoLauncher), Duration::from_secs(5))
            .with_runner(self.log.runner());
        let handle = thread::spawn(move || run_elevated(context, executor, &pipe, &token));
        Ok(Box::new(ThreadChild {
            handle: Some(handle),
            exit_code: None,
        }))
    }
}

#[test]
fn per_machine_packages_run_in_the_elevated_engine() {
    let root = test_root();
    let parent_log = RunLog::default();
    let elevated_log = RunLog::default();
    let launcher = ThreadLauncher {
        root: root.clone(),
        log: elevated_log.clone(),
    };
    let engine = engine(&root, &parent_log, Arc::new(launcher));
    let body = [
        source_payload(&root, "MachineExe", "machine.exe"),
        exe_package("Machine", "MachineExe", "/install", "per_machine = true"),
    ]
    .concat();
    let mut bundle = bundle_from("per_machine = true", &body);
    let ux = RecordingUx::default();

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    assert!(outcome.apply.succeeded(), "{:?}", outcome.apply.error);
    assert_eq!(ux.elevations.load(Ordering::SeqCst), 1);
    assert!(parent_log.runs().is_empty());
    assert_eq!(elevated_log.runs(), vec!["machine.exe /install"]);
    assert_eq!(
        bundle.variables.get_numeric(burn_core::VARIABLE_BUNDLE_ELEVATED),
        Some(1)
    );

    let cached = engine
        .context()
        .cache
        .layout()
        .completed_payload_path(true, "Machine-v1", "machine.exe")
        .expect("cache path");
    assert!(cached.is_file());
    let record = engine
        .context()
        .registrations(true)
        .read("engine-bundle")
        .expect("registration should read")
        .expect("bundle should be registered per machine");
    assert!(record.installed);
}

struct DeclinedChild;

impl ChildProcess for DeclinedChild {
    fn try_wait(&mut self) -> Result<Option<u32>> {
        Ok(Some(ERROR_CANCELLED))
    }

    fn wait_timeout(&mut self, _timeout: Duration) -> Result<Option<u32>> {
        Ok(Some(ERROR_CANCELLED))
    }

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}

struct DecliningLauncher;

impl ProcessLauncher for DecliningLauncher {
    fn launch(
        &self,
        _executable: &Path,
        _arguments: &[String],
        _elevate: bool,
    ) -> Result<Box<dyn ChildProcess>> {
        Ok(Box::new(DeclinedChild))
    }
}

#[test]
fn declined_elevation_fails_apply_before_any_package_runs() {
    let root = test_root();
    let log = RunLog::default();
    let engine = engine(&root, &log, Arc::new(DecliningLauncher));
    let body = [
        source_payload(&root, "MachineExe", "machine.exe"),
        exe_package("Machine", "MachineExe", "/install", "per_machine = true"),
    ]
    .concat();
    let mut bundle = bundle_from("per_machine = true", &body);
    let ux = RecordingUx::default();

    let outcome = engine
        .run(&mut bundle, &ux, BundleAction::Install, None)
        .expect("run should complete");

    let error = outcome.apply.error.as_ref().expect("apply should fail");
    assert!(matches!(
        error.downcast_ref::<ElevationError>(),
        Some(ElevationError::Declined { .. })
    ));
    assert_eq!(outcome.exit_code, hresult_from_win32(ERROR_CANCELLED));
    assert!(log.runs().is_empty());
    let events = ux.events();
    assert!(events.contains(&"error elevation -".to_string()));
    assert_eq!(
        events.last().map(String::as_str),
        Some(format!("complete 0x{:08x}", hresult_from_win32(ERROR_CANCELLED)).as_str())
    );
}

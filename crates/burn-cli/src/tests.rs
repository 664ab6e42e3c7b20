use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use burn_core::BundleAction;
use clap::Parser;

use crate::args::{normalize_args, Cli, Display, RunMode};
use crate::load_bundle;
use crate::render::{
    render_phase_summary, render_section_header, render_status_line, resolve_output_style,
    OutputStyle, PhaseUnit,
};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after the epoch")
        .as_nanos();
    let counter = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!(
        "burn-cli-tests-{}-{nanos}-{counter}",
        std::process::id()
    ));
    std::fs::create_dir_all(&root).expect("test root should be created");
    root
}

fn parse(args: &[&str]) -> Cli {
    let mut full = vec!["setup.exe"];
    full.extend_from_slice(args);
    Cli::try_parse_from(normalize_args(full)).expect("arguments should parse")
}

#[test]
fn no_switches_means_a_full_install() {
    let cli = parse(&[]);
    assert_eq!(cli.action(), BundleAction::Install);
    assert_eq!(cli.display(), Display::Full);
    assert_eq!(cli.mode(), RunMode::Normal);
    assert!(!cli.plan_only);
}

#[test]
fn windows_style_switches_select_action_and_display() {
    let cli = parse(&["/uninstall", "/q", "/norestart", "/log", "setup.log"]);
    assert_eq!(cli.action(), BundleAction::Uninstall);
    assert_eq!(cli.display(), Display::Quiet);
    assert!(cli.norestart);
    assert_eq!(cli.log, Some(PathBuf::from("setup.log")));

    let cli = parse(&["-Repair", "-passive"]);
    assert_eq!(cli.action(), BundleAction::Repair);
    assert_eq!(cli.display(), Display::Passive);
}

#[test]
fn layout_directory_is_optional() {
    let cli = parse(&["-layout"]);
    assert_eq!(cli.action(), BundleAction::Layout);
    assert_eq!(cli.layout_directory(), None);

    let cli = parse(&["-layout", "out", "-quiet"]);
    assert_eq!(cli.action(), BundleAction::Layout);
    assert_eq!(cli.layout_directory(), Some(PathBuf::from("out")));
    assert_eq!(cli.display(), Display::Quiet);
}

#[test]
fn conflicting_actions_are_rejected() {
    let result = Cli::try_parse_from(normalize_args(["setup.exe", "/install", "/uninstall"]));
    assert!(result.is_err());

    let result = Cli::try_parse_from(normalize_args(["setup.exe", "/quiet", "/passive"]));
    assert!(result.is_err());
}

#[test]
fn engine_switches_carry_pipe_and_token() {
    let cli = parse(&["-burn.elevated", "burn.pipe.1234", "secret"]);
    assert_eq!(
        cli.mode(),
        RunMode::Elevated {
            pipe: "burn.pipe.1234".to_string(),
            token: "secret".to_string(),
        }
    );

    let cli = parse(&["/quiet", "-burn.embedded", "burn.pipe.99", "token"]);
    assert_eq!(
        cli.mode(),
        RunMode::Embedded {
            pipe: "burn.pipe.99".to_string(),
            token: "token".to_string(),
        }
    );

    let result = Cli::try_parse_from(normalize_args(["setup.exe", "-burn.elevated", "only-pipe"]));
    assert!(result.is_err());
}

#[test]
fn plan_only_takes_a_manifest_override() {
    let cli = parse(&["-plan-only", "-manifest", "suite.toml"]);
    assert!(cli.plan_only);
    assert_eq!(cli.manifest, Some(PathBuf::from("suite.toml")));
}

#[test]
fn resolve_output_style_follows_stdout() {
    assert_eq!(resolve_output_style(true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false), OutputStyle::Plain);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "Runtime installed"),
        "Runtime installed"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "Runtime installed"),
        "[OK] Runtime installed"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "apply complete; restart to finish"),
        "[WARN] apply complete; restart to finish"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "Runtime failed with 0x80070643"),
        "[ERR] Runtime failed with 0x80070643"
    );
}

#[test]
fn plain_output_has_no_headers_or_progress_summary() {
    assert_eq!(render_section_header(OutputStyle::Plain, "apply"), None);
    assert_eq!(
        render_section_header(OutputStyle::Rich, "apply"),
        Some("== apply ==".to_string())
    );
    assert_eq!(
        render_phase_summary(OutputStyle::Plain, "cache", PhaseUnit::Bytes, 10, None),
        None
    );
}

#[test]
fn rich_phase_summary_reports_amount_and_time() {
    let line = render_phase_summary(
        OutputStyle::Rich,
        "execute",
        PhaseUnit::Percent,
        150,
        Some(Duration::from_millis(1250)),
    )
    .expect("rich output should render a summary");
    assert!(line.ends_with(" 100% in 1.250s"), "unexpected line: {line}");

    let line = render_phase_summary(OutputStyle::Rich, "cache", PhaseUnit::Bytes, 2048, None)
        .expect("rich output should render a summary");
    assert!(line.ends_with(" 2.00 KiB"), "unexpected line: {line}");
}

#[test]
fn load_bundle_reads_a_toml_manifest() {
    let root = test_root();
    let path = root.join("bundle.toml");
    std::fs::write(
        &path,
        r#"
[bundle]
id = "cli-bundle"
provider_key = "Acme.Cli"
name = "Cli Bundle"
version = "1.2.3"
"#,
    )
    .expect("manifest should be written");

    let bundle = load_bundle(&path).expect("bundle should load");
    assert_eq!(bundle.registration.bundle_id, "cli-bundle");
    assert!(bundle.packages.is_empty());

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn load_bundle_names_the_missing_manifest() {
    let root = test_root();
    let path = root.join("missing.toml");
    let err = load_bundle(&path).expect_err("missing manifest should fail");
    assert!(format!("{err:#}").contains("missing.toml"));

    let _ = std::fs::remove_dir_all(root);
}

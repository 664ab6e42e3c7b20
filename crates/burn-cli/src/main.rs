use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use burn_core::{Bundle, BundleManifest, UserExperience};
use burn_engine::{Engine, EngineConfig, EngineContext, EmbeddedReporter, EmbeddedUx};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod args;
mod render;
mod ux;

use args::{Cli, RunMode};
use render::current_output_style;
use ux::ConsoleUx;

const LOG_ENV: &str = "BURN_LOG";
const DEFAULT_MANIFEST: &str = "bundle.toml";

fn main() {
    let cli = Cli::parse_normalized();
    if let Err(err) = init_logging(cli.log.as_deref()) {
        eprintln!("error: {err:#}");
    }

    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            burn_pipe::E_FAIL
        }
    };
    info!(exit_code = code, "burn exiting");
    std::process::exit(code as i32);
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter =
        || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter())
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .with(filter())
                .init();
        }
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<u32> {
    let config = EngineConfig::from_env()?;
    let manifest_path = cli
        .manifest
        .clone()
        .unwrap_or_else(|| config.source_directory.join(DEFAULT_MANIFEST));
    let engine = Engine::for_host(EngineContext::for_host(config)?);

    if let RunMode::Elevated { pipe, token } = cli.mode() {
        info!(pipe = %pipe, "running as the elevated engine");
        return engine.run_elevated(&pipe, &token);
    }

    let mut bundle = load_bundle(&manifest_path)?;
    let console = ConsoleUx::new(current_output_style(), cli.display(), cli.norestart);
    match cli.mode() {
        RunMode::Embedded { pipe, token } => {
            let reporter = EmbeddedReporter::connect(&pipe, &token)?;
            let ux = EmbeddedUx::new(&console, reporter);
            run_bundle(&engine, &mut bundle, &ux, cli)
        }
        _ => run_bundle(&engine, &mut bundle, &console, cli),
    }
}

fn run_bundle(
    engine: &Engine,
    bundle: &mut Bundle,
    ux: &dyn UserExperience,
    cli: &Cli,
) -> Result<u32> {
    let action = cli.action();
    info!(
        bundle = %bundle.registration.bundle_id,
        action = action.as_str(),
        "starting bundle"
    );

    if cli.plan_only {
        engine.detect(bundle, ux)?;
        let plan = engine.plan(bundle, ux, action, layout_directory(cli)?)?;
        let rendered = serde_json::to_string_pretty(&plan).context("failed to render plan")?;
        println!("{rendered}");
        return Ok(0);
    }

    let outcome = engine.run(bundle, ux, action, layout_directory(cli)?)?;
    if let Some(err) = &outcome.apply.error {
        error!("apply failed: {err:#}");
    }
    Ok(outcome.exit_code)
}

fn layout_directory(cli: &Cli) -> Result<Option<PathBuf>> {
    if cli.layout.is_none() {
        return Ok(None);
    }
    match cli.layout_directory() {
        Some(directory) => Ok(Some(directory)),
        None => std::env::current_dir()
            .map(Some)
            .context("failed to resolve the current directory for layout"),
    }
}

fn load_bundle(path: &Path) -> Result<Bundle> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bundle manifest {}", path.display()))?;
    let manifest = BundleManifest::from_toml_str(&text)
        .with_context(|| format!("failed to parse bundle manifest {}", path.display()))?;
    manifest.into_bundle()
}

#[cfg(test)]
mod tests;

//! CLI entry point for the orchestrator

use clap::Parser;
use machinist::{Env, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "machinist")]
#[command(
    about = "GPU-aware worker orchestrator: expands the WORKERS spec against node hardware and emits a supervised process manifest",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Explicit catalog path, bypassing the candidate-path search
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Print the manifest to stdout instead of writing it (implies --skip-daemons)
    #[arg(long)]
    dry_run: bool,

    /// Do not bootstrap daemon services
    #[arg(long)]
    skip_daemons: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: &Cli) -> machinist::Result<()> {
    let env = Env::capture();
    let orchestrator = match &cli.catalog {
        Some(path) => Orchestrator::with_catalog_path(env, path)?,
        None => Orchestrator::from_env(env)?,
    };

    if cli.dry_run {
        let plan = orchestrator.plan()?;
        println!("{}", plan.manifest.to_json()?);
        return Ok(());
    }

    let plan = orchestrator.run(cli.skip_daemons)?;
    log::info!(
        "orchestration complete: {} processes, {} service pairs -> {}",
        plan.manifest.apps.len(),
        plan.manifest.service_pairs.len(),
        orchestrator.settings().manifest_path().display()
    );
    Ok(())
}

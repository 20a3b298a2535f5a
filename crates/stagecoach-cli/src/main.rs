mod render;
mod serve;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use stagecoach_installer::read_receipt;
use stagecoach_operate::{Engine, EngineConfig, Operations, StartParams};

use crate::render::{
    current_output_style, format_outcome_lines, format_receipt_lines, render_status_line,
    TerminalNotifier,
};
use crate::serve::{serve_session, JsonLines};

#[derive(Parser, Debug)]
#[command(name = "stagecoach")]
#[command(about = "Resumable install, upgrade and uninstall of game uploads", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept operation requests as JSON lines on stdin.
    Serve,
    /// Run one operation from a JSON start-parameters file.
    Install { params: PathBuf },
    /// Print the receipt of an install folder.
    Receipt { install_folder: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Serve => {
            let operations = Arc::new(Operations::new(Arc::new(build_engine(
                cli.config.as_deref(),
            )?)));
            let lines = Arc::new(JsonLines::new(Box::new(io::stdout())));
            info!("serving operation requests on stdin");
            serve_session(&operations, io::stdin().lock(), &lines)?;
        }
        Commands::Install { params } => {
            let start = read_start_params(&params)?;
            let operations = Operations::new(Arc::new(build_engine(cli.config.as_deref())?));
            let style = current_output_style();
            let notifier = Arc::new(TerminalNotifier::new(style));
            let id = start.id.clone();
            let outcome = operations.run(start, notifier).map_err(|err| {
                anyhow!(
                    "operation {id} failed (code {}): {err}",
                    err.code().value()
                )
            })?;
            for line in format_outcome_lines(&outcome, style) {
                println!("{line}");
            }
        }
        Commands::Receipt { install_folder } => {
            let style = current_output_style();
            match read_receipt(&install_folder)? {
                Some(receipt) => {
                    for line in format_receipt_lines(&receipt, style) {
                        println!("{line}");
                    }
                }
                None => println!(
                    "{}",
                    render_status_line(
                        style,
                        "warn",
                        &format!("no receipt in {}", install_folder.display()),
                    )
                ),
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn build_engine(config_path: Option<&Path>) -> Result<Engine> {
    let config = EngineConfig::load(config_path)?;
    Engine::new(config).context("failed to set up install engine")
}

fn read_start_params(path: &Path) -> Result<StartParams> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read start parameters {}", path.display()))?;
    parse_start_params(&raw)
        .with_context(|| format!("invalid start parameters in {}", path.display()))
}

fn parse_start_params(raw: &str) -> Result<StartParams> {
    let params: StartParams = serde_json::from_str(raw)?;
    params.validate()?;
    Ok(params)
}

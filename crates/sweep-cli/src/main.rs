mod cli;
mod commands;
mod render;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, Verbosity};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbosity = cli.verbosity();
    init_diagnostics(verbosity);

    // `completion` needs no campaign file — handle it early
    if let Commands::Completion(args) = cli.command {
        clap_complete::generate(
            args.shell,
            &mut <Cli as clap::CommandFactory>::command(),
            "reposweep",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let result = match cli.command {
        Commands::Exec(args) => commands::exec::run(args, verbosity).await,
        Commands::Validate(args) => commands::validate::run(args, verbosity),
        Commands::Completion(_) => unreachable!("completion handled above"),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("\n{} {}", "FAILED".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Route diagnostics to stderr so they never mix with the event stream on
/// stdout. The level defaults from the verbosity flags and can be
/// overridden via `SWEEP_LOG` or `RUST_LOG`.
fn init_diagnostics(verbosity: Verbosity) {
    let default_level = match verbosity {
        Verbosity::Verbose => "debug",
        Verbosity::Normal => "warn",
        Verbosity::Quiet => "error",
    };

    let env_filter = EnvFilter::try_from_env("SWEEP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

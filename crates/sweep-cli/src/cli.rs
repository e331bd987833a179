use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::commands::{exec::ExecArgs, validate::ValidateArgs};

/// reposweep: run multi-step code-change campaigns across many repositories
///
/// Emits a machine-readable JSON event stream that automation can tail
/// while the run is still in progress.
#[derive(Parser, Debug)]
#[command(name = "reposweep", version, about, long_about = None)]
pub struct Cli {
    /// Increase output verbosity (show debug info)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Verbosity level resolved from --verbose / --quiet flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// --quiet: only errors and essential output
    Quiet,
    /// default: normal output
    Normal,
    /// --verbose: extra debug info
    Verbose,
}

impl Cli {
    /// Resolve the verbosity level from CLI flags
    pub fn verbosity(&self) -> Verbosity {
        match (self.quiet, self.verbose) {
            (true, _) => Verbosity::Quiet,
            (_, true) => Verbosity::Verbose,
            _ => Verbosity::Normal,
        }
    }
}

/// How lifecycle notifications are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Colored, human-readable console output
    Pretty,
    /// One JSON notification per line on stdout, for machine consumption
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a campaign across all matched repositories
    Exec(ExecArgs),

    /// Parse and check a campaign file without executing anything
    Validate(ValidateArgs),

    /// Generate shell completion scripts
    Completion(CompletionArgs),
}

/// Arguments for the `completion` command
#[derive(Args, Debug)]
pub struct CompletionArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_resolution() {
        let cli = Cli::parse_from(["reposweep", "validate"]);
        assert_eq!(cli.verbosity(), Verbosity::Normal);

        let cli = Cli::parse_from(["reposweep", "-v", "validate"]);
        assert_eq!(cli.verbosity(), Verbosity::Verbose);

        let cli = Cli::parse_from(["reposweep", "-q", "validate"]);
        assert_eq!(cli.verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_output_mode_parses() {
        let cli = Cli::parse_from(["reposweep", "exec", "--output", "json"]);
        match cli.command {
            Commands::Exec(args) => assert_eq!(args.output, OutputMode::Json),
            _ => panic!("expected exec command"),
        }
    }
}

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use sweep_core::campaign::Campaign;

use crate::cli::Verbosity;

/// Arguments for the `validate` command
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the campaign file
    #[arg(short = 'f', long = "file", default_value = "sweep.yaml")]
    pub file: PathBuf,
}

/// Parse and check a campaign file without executing anything.
pub fn run(args: ValidateArgs, verbosity: Verbosity) -> Result<()> {
    let campaign = Campaign::load(&args.file)?;
    let warnings = campaign.validate();

    for warning in &warnings {
        eprintln!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    if verbosity != Verbosity::Quiet {
        println!(
            "{} {} ({} step(s), {} repository pattern(s))",
            "valid".green().bold(),
            campaign.name.bold(),
            campaign.steps.len(),
            campaign.repos.len(),
        );
        if let Some(description) = &campaign.description {
            println!("  {}", description.dimmed());
        }
        for (i, step) in campaign.steps.iter().enumerate() {
            let label = step.name.as_deref().unwrap_or(&step.run);
            println!("  {} step {}: {}", "->".cyan(), i, label);
        }
    }

    Ok(())
}

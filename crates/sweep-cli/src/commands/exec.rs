use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use sweep_core::cache::ResultCache;
use sweep_core::campaign::{Campaign, resolve_repositories};
use sweep_core::json_lines::JsonLinesUi;
use sweep_core::runner::{CampaignRunner, TaskOutcome, repo_head};
use sweep_core::task::{ChangesetSpec, Task, TaskKey};
use sweep_core::ui::ExecUi;

use super::TaskResults;
use crate::cli::{OutputMode, Verbosity};
use crate::render::ConsoleUi;

/// Arguments for the `exec` command
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Path to the campaign file
    #[arg(short = 'f', long = "file", default_value = "sweep.yaml")]
    pub file: PathBuf,

    /// How to render lifecycle notifications
    #[arg(long, value_enum, default_value_t = OutputMode::Pretty)]
    pub output: OutputMode,

    /// Maximum number of concurrent tasks
    #[arg(short = 'c', long, default_value = "5")]
    pub concurrency: usize,

    /// Stop scheduling new tasks on first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Timeout per step in seconds (0 = no timeout)
    #[arg(long, default_value = "0")]
    pub timeout: u64,

    /// Disable the task result cache
    #[arg(long)]
    pub no_cache: bool,

    /// Where to write the changeset specs
    #[arg(long, default_value = "changesets.json")]
    pub save_changesets: PathBuf,

    /// Resolve repositories and print the plan without executing
    #[arg(long)]
    pub dry_run: bool,
}

/// Execute a campaign across all matched repositories.
pub async fn run(args: ExecArgs, verbosity: Verbosity) -> Result<()> {
    // One reporting implementation, selected once; everything downstream
    // talks to the trait.
    let ui: Arc<dyn ExecUi> = match args.output {
        OutputMode::Json => Arc::new(JsonLinesUi::stdout()),
        OutputMode::Pretty => Arc::new(ConsoleUi::new(verbosity)),
    };

    let results = match run_campaign(&args, verbosity, ui.as_ref()).await {
        Ok(results) => results,
        Err(e) => {
            ui.execution_error(&e);
            return Err(e);
        }
    };

    let Some(results) = results else {
        // Dry run: nothing was executed.
        return Ok(());
    };

    if results.failed() > 0 {
        anyhow::bail!(
            "{} task(s) failed ({} passed)",
            results.failed(),
            results.passed()
        );
    }

    if args.output == OutputMode::Pretty && verbosity != Verbosity::Quiet {
        println!(
            "\n{}",
            format!("All {} task(s) passed.", results.passed()).green()
        );
    }
    Ok(())
}

/// Drive the whole campaign through the reporting interface. Returns `None`
/// for a dry run.
async fn run_campaign(
    args: &ExecArgs,
    verbosity: Verbosity,
    ui: &dyn ExecUi,
) -> Result<Option<TaskResults>> {
    ui.parsing_campaign_spec();
    let campaign = match Campaign::load(&args.file) {
        Ok(campaign) => {
            ui.parsing_campaign_spec_success()?;
            campaign
        }
        Err(e) => {
            ui.parsing_campaign_spec_failure(&e)?;
            return Err(e);
        }
    };

    for warning in campaign.validate() {
        eprintln!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    let root = campaign_root(&args.file);

    ui.resolving_repositories();
    let repos = match resolve_repositories(&root, &campaign.repos) {
        Ok(repos) => {
            ui.resolving_repositories_success(repos.len())?;
            repos
        }
        Err(e) => {
            ui.resolving_repositories_failure(&e)?;
            return Err(e);
        }
    };

    if repos.is_empty() {
        if args.output == OutputMode::Pretty {
            println!("{}", "No repositories matched the campaign patterns.".yellow());
        }
        return Ok(Some(TaskResults::from(vec![])));
    }

    let cache = if args.no_cache {
        None
    } else {
        Some(Arc::new(ResultCache::new(root.join(".sweep").join("cache"))))
    };

    ui.checking_cache();
    let tasks = build_tasks(&campaign, &root, &repos, cache.as_deref()).await;
    let cached_found = tasks.iter().filter(|t| t.cached_result_found).count();
    ui.checking_cache_success(cached_found, tasks.len() - cached_found)?;

    if args.dry_run {
        if args.output == OutputMode::Pretty {
            println!(
                "\n{} Would execute {} step(s) in {} repository(ies):\n",
                "DRY RUN".yellow().bold(),
                campaign.steps.len(),
                tasks.len()
            );
            for task in &tasks {
                println!("  {} {}", "->".cyan(), task.repository);
            }
        }
        return Ok(None);
    }

    let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    let runner = CampaignRunner::new(args.concurrency, args.fail_fast)
        .with_timeout(timeout)
        .with_cache(cache);

    if verbosity == Verbosity::Verbose && args.output == OutputMode::Pretty {
        println!(
            "{} concurrency {}, fail_fast {}, cache {}",
            "DEBUG".dimmed(),
            args.concurrency,
            args.fail_fast,
            !args.no_cache,
        );
    }

    let outcomes = runner.run(&tasks, &campaign.changeset, ui).await?;

    save_changesets(&args.save_changesets, &outcomes, ui)?;

    Ok(Some(TaskResults::from(
        outcomes
            .iter()
            .map(|o| (o.repository.clone(), o.success))
            .collect::<Vec<_>>(),
    )))
}

/// Directory the campaign file lives in; repository patterns and the
/// `.sweep` scratch directory are resolved relative to it.
fn campaign_root(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Build the task list, consulting the cache for each repository.
async fn build_tasks(
    campaign: &Campaign,
    root: &Path,
    repos: &[(String, PathBuf)],
    cache: Option<&ResultCache>,
) -> Vec<Arc<Task>> {
    let mut tasks = Vec::with_capacity(repos.len());
    for (i, (name, path)) in repos.iter().enumerate() {
        let (cache_key, cached) = match cache {
            Some(cache) => match repo_head(path).await {
                Ok(rev) => {
                    let key =
                        ResultCache::task_key(name, &rev, &campaign.steps, &campaign.changeset);
                    let cached = cache.get(&key).unwrap_or_else(|e| {
                        tracing::warn!(repository = %name, error = %e, "cache lookup failed");
                        None
                    });
                    (Some(key), cached)
                }
                Err(e) => {
                    tracing::warn!(repository = %name, error = %e, "could not determine revision; skipping cache");
                    (None, None)
                }
            },
            None => (None, None),
        };

        let cached_result_found = cached.is_some();
        tasks.push(Arc::new(Task {
            key: TaskKey(i),
            repository: name.clone(),
            repo_path: path.clone(),
            workspace: root.join(".sweep").join("workspaces").join(name),
            steps: campaign.steps.clone(),
            cached_result_found,
            resume_at: if cached_result_found {
                campaign.steps.len()
            } else {
                0
            },
            cached,
            cache_key,
        }));
    }
    tasks
}

/// Write the changeset specs produced by successful tasks, reporting
/// save progress along the way.
fn save_changesets(path: &Path, outcomes: &[TaskOutcome], ui: &dyn ExecUi) -> Result<()> {
    let specs: Vec<ChangesetSpec> = outcomes
        .iter()
        .filter_map(|o| o.changeset.clone())
        .collect();

    ui.saving_changesets(specs.len());
    for done in 1..=specs.len() {
        ui.saving_changesets_progress(done, specs.len())?;
    }

    let encoded = serde_json::to_string_pretty(&specs).context("Could not encode changesets")?;
    if let Err(e) = std::fs::write(path, encoded)
        .with_context(|| format!("Could not write changesets to {}", path.display()))
    {
        ui.saving_changesets_failure(&e)?;
        return Err(e);
    }
    ui.saving_changesets_success(&specs)?;
    Ok(())
}

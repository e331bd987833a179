use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use colored::{Color, Colorize};
use indicatif::{ProgressBar, ProgressStyle};

use sweep_core::task::{ChangesetSpec, Task};
use sweep_core::ui::{ExecUi, ReportError, StepOutputWriter, StepsUi, TaskExecUi};

use crate::cli::Verbosity;

/// Colors assigned to repositories for distinguishing concurrent output.
const REPO_COLORS: &[Color] = &[
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Red,
    Color::BrightCyan,
    Color::BrightGreen,
    Color::BrightYellow,
    Color::BrightBlue,
];

/// Width (in characters) of the separator line drawn around task output.
const SEPARATOR_WIDTH: usize = 60;

/// Create a styled progress bar for task processing.
fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_message(message.to_string());
    pb
}

/// Build a separator line: `─── repo_name ─────────────────`
fn separator_line(name: &str, color: Color) -> String {
    let label = format!(" {} ", name);
    let prefix_dashes = 3;
    let suffix_dashes = SEPARATOR_WIDTH.saturating_sub(prefix_dashes + label.len());
    format!(
        "{}{}{}",
        "─".repeat(prefix_dashes).color(color),
        label.color(color).bold(),
        "─".repeat(suffix_dashes).color(color),
    )
}

/// Build a plain closing separator line: `──────────────────`
fn closing_separator(color: Color) -> String {
    format!("{}", "─".repeat(SEPARATOR_WIDTH).color(color))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct ConsoleState {
    verbosity: Verbosity,
    colors: Mutex<(HashMap<String, Color>, usize)>,
    progress: Mutex<Option<ProgressBar>>,
    started_at: Mutex<HashMap<String, Instant>>,
}

impl ConsoleState {
    fn color(&self, name: &str) -> Color {
        let mut colors = lock(&self.colors);
        let (map, next) = &mut *colors;
        *map.entry(name.to_string()).or_insert_with(|| {
            let c = REPO_COLORS[*next % REPO_COLORS.len()];
            *next += 1;
            c
        })
    }

    fn prefix(&self, name: &str) -> colored::ColoredString {
        format!("[{}]", name).color(self.color(name)).bold()
    }

    fn quiet(&self) -> bool {
        self.verbosity == Verbosity::Quiet
    }

    fn verbose(&self) -> bool {
        self.verbosity == Verbosity::Verbose
    }
}

/// Interactive, human-readable implementation of the reporting interface:
/// colored per-repository output with a progress bar, in the spirit of
/// classic monorepo runners. Selected by `--output pretty`.
pub struct ConsoleUi {
    state: Arc<ConsoleState>,
}

impl ConsoleUi {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            state: Arc::new(ConsoleState {
                verbosity,
                colors: Mutex::new((HashMap::new(), 0)),
                progress: Mutex::new(None),
                started_at: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl ExecUi for ConsoleUi {
    fn parsing_campaign_spec(&self) {}

    fn parsing_campaign_spec_success(&self) -> Result<(), ReportError> {
        Ok(())
    }

    fn parsing_campaign_spec_failure(&self, _err: &anyhow::Error) -> Result<(), ReportError> {
        // The CLI prints the error itself; nothing extra to render.
        Ok(())
    }

    fn resolving_repositories(&self) {}

    fn resolving_repositories_success(&self, count: usize) -> Result<(), ReportError> {
        if !self.state.quiet() {
            println!("{} repository(ies) matched", count.to_string().cyan());
        }
        Ok(())
    }

    fn resolving_repositories_failure(&self, _err: &anyhow::Error) -> Result<(), ReportError> {
        Ok(())
    }

    fn checking_cache(&self) {}

    fn checking_cache_success(
        &self,
        cached_results_found: usize,
        tasks_to_execute: usize,
    ) -> Result<(), ReportError> {
        if !self.state.quiet() && cached_results_found > 0 {
            println!(
                "{} cached result(s) found, {} task(s) to execute",
                cached_results_found.to_string().cyan(),
                tasks_to_execute.to_string().cyan(),
            );
        }
        Ok(())
    }

    fn executing_tasks(&self, tasks: &[Arc<Task>]) -> Result<Arc<dyn TaskExecUi>, ReportError> {
        if !self.state.quiet() {
            println!("\nExecuting {} task(s):\n", tasks.len().to_string().cyan());
            for task in tasks {
                println!("  {} {}", "->".cyan(), task.repository);
            }
            println!();
            *lock(&self.state.progress) = Some(create_progress_bar(tasks.len() as u64, "exec"));
        }
        Ok(Arc::new(ConsoleTaskUi {
            state: self.state.clone(),
        }))
    }

    fn saving_changesets(&self, _total: usize) {}

    fn saving_changesets_progress(&self, _done: usize, _total: usize) -> Result<(), ReportError> {
        Ok(())
    }

    fn saving_changesets_success(&self, specs: &[ChangesetSpec]) -> Result<(), ReportError> {
        if !self.state.quiet() {
            println!("\nSaved {} changeset spec(s)", specs.len().to_string().cyan());
        }
        Ok(())
    }

    fn saving_changesets_failure(&self, _err: &anyhow::Error) -> Result<(), ReportError> {
        Ok(())
    }

    fn execution_error(&self, err: &anyhow::Error) {
        eprintln!("{} {}", "ERROR".red().bold(), err);
    }
}

struct ConsoleTaskUi {
    state: Arc<ConsoleState>,
}

impl TaskExecUi for ConsoleTaskUi {
    fn task_started(&self, task: &Task) -> Result<(), ReportError> {
        lock(&self.state.started_at).insert(task.repository.clone(), Instant::now());
        if !self.state.quiet() {
            let color = self.state.color(&task.repository);
            println!("{}", separator_line(&task.repository, color));
        }
        Ok(())
    }

    fn task_finished(&self, task: &Task, err: Option<&anyhow::Error>) -> Result<(), ReportError> {
        let elapsed = lock(&self.state.started_at)
            .remove(&task.repository)
            .map(|t| format!("({:.1}s)", t.elapsed().as_secs_f64()))
            .unwrap_or_default();

        let prefix = self.state.prefix(&task.repository);
        match err {
            Some(err) => {
                eprintln!(
                    "{} {} {} {}",
                    prefix,
                    "FAILED".red(),
                    elapsed.dimmed(),
                    err
                );
            }
            None => {
                if !self.state.quiet() {
                    println!("{} {} {}", prefix, "SUCCESS".green(), elapsed.dimmed());
                }
            }
        }
        if !self.state.quiet() {
            println!("{}", closing_separator(self.state.color(&task.repository)));
        }
        if let Some(pb) = lock(&self.state.progress).as_ref() {
            pb.inc(1);
        }
        Ok(())
    }

    fn task_changeset_built(&self, task: &Task, spec: &ChangesetSpec) -> Result<(), ReportError> {
        if self.state.verbose() {
            println!(
                "{} changeset on branch {} ({} diff bytes)",
                self.state.prefix(&task.repository),
                spec.branch.bold(),
                spec.diff.len(),
            );
        }
        Ok(())
    }

    fn cache_result_written(&self, task: &Task, key: &str) -> Result<(), ReportError> {
        if self.state.verbose() {
            println!(
                "{} cached result written ({})",
                self.state.prefix(&task.repository),
                key.dimmed(),
            );
        }
        Ok(())
    }

    fn steps(&self, task: &Task) -> Result<Box<dyn StepsUi>, ReportError> {
        Ok(Box::new(ConsoleStepsUi {
            state: self.state.clone(),
            repository: task.repository.clone(),
        }))
    }

    fn finished(&self, _err: Option<&anyhow::Error>) -> Result<(), ReportError> {
        if let Some(pb) = lock(&self.state.progress).take() {
            pb.finish_and_clear();
        }
        Ok(())
    }
}

struct ConsoleStepsUi {
    state: Arc<ConsoleState>,
    repository: String,
}

impl ConsoleStepsUi {
    fn debug(&self, message: &str) {
        if self.state.verbose() {
            println!(
                "{} {}",
                self.state.prefix(&self.repository),
                message.dimmed()
            );
        }
    }
}

impl StepsUi for ConsoleStepsUi {
    fn fetching_repository(&self) {
        self.debug("fetching repository");
    }

    fn fetching_repository_finished(
        &self,
        _err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError> {
        Ok(())
    }

    fn initializing_workspace(&self) {
        self.debug("initializing workspace");
    }

    fn initializing_workspace_finished(
        &self,
        _err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError> {
        Ok(())
    }

    fn skipping_steps_up_to(&self, start_step: usize) {
        if !self.state.quiet() {
            println!(
                "{} {}",
                self.state.prefix(&self.repository),
                format!("cached result found, skipping steps up to {}", start_step).dimmed(),
            );
        }
    }

    fn step_skipped(&self, step: usize) {
        if !self.state.quiet() {
            println!(
                "{} {}",
                self.state.prefix(&self.repository),
                format!("step {} skipped (condition not met)", step).dimmed(),
            );
        }
    }

    fn step_preparing(&self, step: usize) {
        self.debug(&format!("preparing step {}", step));
    }

    fn step_preparing_finished(
        &self,
        _step: usize,
        _err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError> {
        Ok(())
    }

    fn step_started(&self, step: usize, run: &str, _env: &HashMap<String, String>) {
        if !self.state.quiet() {
            println!(
                "{} {} {}",
                self.state.prefix(&self.repository),
                format!("step {}:", step).dimmed(),
                run,
            );
        }
    }

    fn step_output_writer(&self, _step: usize) -> Box<dyn StepOutputWriter> {
        Box::new(PassthroughWriter {
            state: self.state.clone(),
            repository: self.repository.clone(),
        })
    }

    fn step_finished(&self, step: usize, _diff: &str) -> Result<(), ReportError> {
        self.debug(&format!("step {} finished", step));
        Ok(())
    }

    fn step_failed(
        &self,
        step: usize,
        err: &anyhow::Error,
        exit_code: Option<i32>,
    ) -> Result<(), ReportError> {
        let code = exit_code
            .map(|c| format!(" (exit code {})", c))
            .unwrap_or_default();
        eprintln!(
            "{} {} {}{}",
            self.state.prefix(&self.repository),
            format!("step {} failed:", step).red(),
            err,
            code.dimmed(),
        );
        Ok(())
    }

    fn calculating_diff(&self) {
        self.debug("calculating diff");
    }

    fn calculating_diff_finished(&self, _err: Option<&anyhow::Error>) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Prints step output lines immediately with the repository's colored
/// prefix; the console renderer has no need for rate limiting.
struct PassthroughWriter {
    state: Arc<ConsoleState>,
    repository: String,
}

#[async_trait]
impl StepOutputWriter for PassthroughWriter {
    async fn write(&self, chunk: &str) {
        if self.state.quiet() {
            return;
        }
        let prefix = self.state.prefix(&self.repository);
        for line in chunk.lines() {
            println!("{} {}", prefix, line);
        }
    }

    async fn close(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use sweep_core::task::TaskKey;

    fn make_task(key: usize, repository: &str) -> Arc<Task> {
        Arc::new(Task {
            key: TaskKey(key),
            repository: repository.to_string(),
            repo_path: PathBuf::from("/repos").join(repository),
            workspace: PathBuf::from("/work").join(repository),
            steps: vec![],
            cached_result_found: false,
            resume_at: 0,
            cached: None,
            cache_key: None,
        })
    }

    #[test]
    fn test_separator_line_has_fixed_width() {
        let line = separator_line("repo", Color::Cyan);
        // Strip ANSI codes by counting the dash/label characters only.
        let plain: String = String::from_utf8(
            strip_ansi(line.as_bytes()),
        )
        .unwrap();
        assert_eq!(plain.chars().count(), SEPARATOR_WIDTH);
        assert!(plain.contains(" repo "));
    }

    fn strip_ansi(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut in_escape = false;
        for &b in bytes {
            match (in_escape, b) {
                (false, 0x1b) => in_escape = true,
                (false, _) => out.push(b),
                (true, b'm') => in_escape = false,
                (true, _) => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn test_console_ui_full_lifecycle_does_not_panic() {
        let ui = ConsoleUi::new(Verbosity::Quiet);
        ui.parsing_campaign_spec();
        ui.parsing_campaign_spec_success().unwrap();
        ui.resolving_repositories();
        ui.resolving_repositories_success(1).unwrap();
        ui.checking_cache();
        ui.checking_cache_success(0, 1).unwrap();

        let tasks = vec![make_task(0, "repo-a")];
        let set = ui.executing_tasks(&tasks).unwrap();
        set.task_started(&tasks[0]).unwrap();
        let steps = set.steps(&tasks[0]).unwrap();
        steps.fetching_repository();
        steps.fetching_repository_finished(None).unwrap();
        steps.step_started(0, "echo hi", &HashMap::new());
        let writer = steps.step_output_writer(0);
        writer.write("hello\nworld\n").await;
        writer.close().await;
        steps.step_finished(0, "").unwrap();
        set.task_finished(&tasks[0], None).unwrap();
        set.finished(None).unwrap();
        ui.saving_changesets(0);
        ui.saving_changesets_success(&[]).unwrap();
    }

    #[test]
    fn test_colors_are_stable_per_repository() {
        let ui = ConsoleUi::new(Verbosity::Normal);
        let a1 = ui.state.color("alpha");
        let b = ui.state.color("beta");
        let a2 = ui.state.color("alpha");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }
}

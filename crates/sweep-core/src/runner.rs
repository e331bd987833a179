use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;

use crate::cache::{CachedTaskResult, ResultCache};
use crate::campaign::ChangesetTemplate;
use crate::task::{ChangesetSpec, Step, Task};
use crate::ui::{ExecUi, ReportError, StepOutputWriter, StepsUi, TaskExecUi};

/// Return the platform-appropriate shell executable and flag for running
/// step commands.
///
/// On Windows, returns `("cmd", "/C")` to invoke `cmd.exe /C <command>`.
/// On Unix-like systems, returns `("sh", "-c")` to invoke `sh -c <command>`.
pub fn shell_command() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}

/// Outcome of one task after the run.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub repository: String,
    pub success: bool,
    pub changeset: Option<ChangesetSpec>,
}

/// Executes campaign tasks with bounded concurrency, driving the reporting
/// interface at every lifecycle point.
///
/// The runner decides scheduling and nothing else: what appears on the
/// event stream is entirely the UI implementation's business.
pub struct CampaignRunner {
    /// Maximum concurrent tasks.
    concurrency: usize,
    /// Whether to stop scheduling new tasks on first failure.
    fail_fast: bool,
    /// Per-step timeout.
    timeout: Option<Duration>,
    /// Result cache to write successful task results into.
    cache: Option<Arc<ResultCache>>,
}

impl CampaignRunner {
    pub fn new(concurrency: usize, fail_fast: bool) -> Self {
        Self {
            concurrency: concurrency.max(1),
            fail_fast,
            timeout: None,
            cache: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<ResultCache>>) -> Self {
        self.cache = cache;
        self
    }

    /// Run every task, returning per-task outcomes in completion order.
    ///
    /// Individual task failures do not fail the run; they are reported and
    /// reflected in the outcomes. The returned error covers setup problems
    /// only (e.g. reporting already started).
    pub async fn run(
        &self,
        tasks: &[Arc<Task>],
        template: &ChangesetTemplate,
        ui: &dyn ExecUi,
    ) -> Result<Vec<TaskOutcome>> {
        let set = ui.executing_tasks(tasks)?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let outcomes = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let failed = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for task in tasks {
            let sem = semaphore.clone();
            let outcomes = outcomes.clone();
            let failed = failed.clone();
            let fail_fast = self.fail_fast;
            let timeout = self.timeout;
            let cache = self.cache.clone();
            let template = template.clone();
            let set = set.clone();
            let task = task.clone();

            let handle = tokio::spawn(async move {
                // safety: the semaphore is never closed, so acquire always succeeds
                let _permit = sem.acquire().await.expect("semaphore closed unexpectedly");

                if fail_fast && failed.load(Ordering::Relaxed) {
                    // Still emit the task's started/terminal pair so the
                    // stream accounts for every task in the run.
                    report(set.task_started(&task));
                    let err = anyhow::anyhow!("skipped: an earlier task failed");
                    report(set.task_finished(&task, Some(&err)));
                    outcomes.lock().await.push(TaskOutcome {
                        repository: task.repository.clone(),
                        success: false,
                        changeset: None,
                    });
                    return;
                }

                report(set.task_started(&task));
                let result =
                    execute_task(&task, &template, set.as_ref(), timeout, cache.as_deref()).await;

                let outcome = match result {
                    Ok(changeset) => {
                        report(set.task_finished(&task, None));
                        TaskOutcome {
                            repository: task.repository.clone(),
                            success: true,
                            changeset: Some(changeset),
                        }
                    }
                    Err(e) => {
                        report(set.task_finished(&task, Some(&e)));
                        failed.store(true, Ordering::Relaxed);
                        TaskOutcome {
                            repository: task.repository.clone(),
                            success: false,
                            changeset: None,
                        }
                    }
                };
                outcomes.lock().await.push(outcome);
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.await.context("Task worker panicked")?;
        }

        let outcomes = outcomes.lock().await.clone();
        if self.fail_fast && outcomes.iter().any(|o| !o.success) {
            let err = anyhow::anyhow!("aborted after first task failure");
            report(set.finished(Some(&err)));
        } else {
            report(set.finished(None));
        }
        Ok(outcomes)
    }
}

/// Log a reporting contract violation without letting it touch engine
/// state. The engine is the façade's only caller, so a violation here is a
/// bug in this module, not a run failure.
fn report(result: Result<(), ReportError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "reporting contract violation");
    }
}

async fn execute_task(
    task: &Task,
    template: &ChangesetTemplate,
    set: &dyn TaskExecUi,
    timeout: Option<Duration>,
    cache: Option<&ResultCache>,
) -> Result<ChangesetSpec> {
    let steps_ui: Box<dyn StepsUi> = set.steps(task)?;

    // A full cached result short-circuits execution entirely.
    if let Some(cached) = &task.cached {
        steps_ui.skipping_steps_up_to(task.resume_at);
        let spec = cached.changeset.clone();
        report(set.task_changeset_built(task, &spec));
        return Ok(spec);
    }

    steps_ui.fetching_repository();
    match fetch_repository(task).await {
        Ok(()) => report(steps_ui.fetching_repository_finished(None)),
        Err(e) => {
            report(steps_ui.fetching_repository_finished(Some(&e)));
            return Err(e);
        }
    }

    steps_ui.initializing_workspace();
    match init_workspace(task, template).await {
        Ok(()) => report(steps_ui.initializing_workspace_finished(None)),
        Err(e) => {
            report(steps_ui.initializing_workspace_finished(Some(&e)));
            return Err(e);
        }
    }

    if task.resume_at > 0 {
        steps_ui.skipping_steps_up_to(task.resume_at);
    }

    for (idx, step) in task.steps.iter().enumerate().skip(task.resume_at) {
        if let Some(when) = &step.when {
            let holds = run_condition(&task.workspace, when)
                .await
                .with_context(|| format!("Could not evaluate condition for step {}", idx))?;
            if !holds {
                steps_ui.step_skipped(idx);
                continue;
            }
        }

        steps_ui.step_preparing(idx);
        let env = build_step_env(task, step, idx);
        report(steps_ui.step_preparing_finished(idx, None));

        steps_ui.step_started(idx, &step.run, &env);
        let writer = steps_ui.step_output_writer(idx);
        let run_result = run_step(&task.workspace, step, &env, timeout, writer.as_ref()).await;
        // The writer's final flush must land before the step's terminal
        // notification, so close it before reporting either way.
        writer.close().await;

        match run_result {
            Ok(()) => {
                let diff = match stage_and_diff(&task.workspace).await {
                    Ok(diff) => diff,
                    Err(e) => {
                        tracing::warn!(repository = %task.repository, step = idx, error = %e, "could not compute after-step diff");
                        String::new()
                    }
                };
                report(steps_ui.step_finished(idx, &diff));
            }
            Err(failure) => {
                report(steps_ui.step_failed(idx, &failure.err, failure.exit_code));
                return Err(failure.err.context(format!("step {} failed", idx)));
            }
        }
    }

    steps_ui.calculating_diff();
    let diff = match stage_and_diff(&task.workspace).await {
        Ok(diff) => {
            report(steps_ui.calculating_diff_finished(None));
            diff
        }
        Err(e) => {
            report(steps_ui.calculating_diff_finished(Some(&e)));
            return Err(e);
        }
    };

    let spec = ChangesetSpec {
        repository: task.repository.clone(),
        branch: template.branch.clone(),
        title: template.title.clone(),
        commit_message: template.commit_message().to_string(),
        diff: diff.clone(),
    };
    report(set.task_changeset_built(task, &spec));

    if let (Some(cache), Some(key)) = (cache, &task.cache_key) {
        match cache.set(
            key,
            &CachedTaskResult {
                diff,
                changeset: spec.clone(),
            },
        ) {
            Ok(()) => report(set.cache_result_written(task, key)),
            Err(e) => {
                tracing::warn!(repository = %task.repository, error = %e, "could not write cache entry");
            }
        }
    }

    Ok(spec)
}

/// Create the task workspace as a fresh clone of the source repository.
async fn fetch_repository(task: &Task) -> Result<()> {
    if let Some(parent) = task.workspace.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    if task.workspace.exists() {
        tokio::fs::remove_dir_all(&task.workspace)
            .await
            .with_context(|| format!("Could not clear stale workspace for {}", task.repository))?;
    }

    let repo = task.repo_path.display().to_string();
    let workspace = task.workspace.display().to_string();
    git(&task.repo_path, &["clone", "--quiet", &repo, &workspace])
        .await
        .with_context(|| format!("Could not fetch repository {}", task.repository))?;
    Ok(())
}

/// Prepare the workspace for the campaign: check out the changeset branch.
async fn init_workspace(task: &Task, template: &ChangesetTemplate) -> Result<()> {
    git(
        &task.workspace,
        &["checkout", "--quiet", "-b", &template.branch],
    )
    .await
    .with_context(|| format!("Could not initialize workspace for {}", task.repository))?;
    Ok(())
}

/// HEAD revision of a repository checkout; part of the task cache key.
pub async fn repo_head(repo: &Path) -> Result<String> {
    let out = git(repo, &["rev-parse", "HEAD"]).await?;
    Ok(out.trim().to_string())
}

/// Stage everything and return the cumulative diff of the workspace,
/// including untracked files.
async fn stage_and_diff(workspace: &Path) -> Result<String> {
    git(workspace, &["add", "--all"]).await?;
    git(workspace, &["diff", "--cached", "--no-color"]).await
}

async fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .with_context(|| format!("Could not run git {}", args.join(" ")))?;

    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Evaluate a step's `when` condition: true when the command exits zero.
async fn run_condition(workspace: &Path, condition: &str) -> Result<bool> {
    let (shell, shell_flag) = shell_command();
    let output = Command::new(shell)
        .arg(shell_flag)
        .arg(condition)
        .current_dir(workspace)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .context("Could not spawn condition command")?;
    Ok(output.status.success())
}

/// Environment for one step: ambient campaign variables plus the step's own.
fn build_step_env(task: &Task, step: &Step, idx: usize) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("SWEEP_REPOSITORY".to_string(), task.repository.clone());
    env.insert(
        "SWEEP_WORKSPACE".to_string(),
        task.workspace.display().to_string(),
    );
    env.insert("SWEEP_STEP".to_string(), idx.to_string());
    for (key, val) in &step.env {
        env.insert(key.clone(), val.clone());
    }
    env
}

struct StepFailure {
    err: anyhow::Error,
    exit_code: Option<i32>,
}

/// Run one step command in the workspace, streaming its combined output
/// through the UI-provided writer.
async fn run_step(
    workspace: &Path,
    step: &Step,
    env: &HashMap<String, String>,
    timeout: Option<Duration>,
    writer: &dyn StepOutputWriter,
) -> Result<(), StepFailure> {
    let (shell, shell_flag) = shell_command();
    let mut child = Command::new(shell)
        .arg(shell_flag)
        .arg(&step.run)
        .current_dir(workspace)
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| StepFailure {
            err: anyhow::Error::new(e).context("Could not spawn step command"),
            exit_code: None,
        })?;

    // safety: we set Stdio::piped() above so these are always Some
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let stream_stdout = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            writer.write(&format!("{line}\n")).await;
        }
    };
    let stream_stderr = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            writer.write(&format!("{line}\n")).await;
        }
    };

    let (status, (), ()) = tokio::join!(
        wait_with_timeout(&mut child, timeout),
        stream_stdout,
        stream_stderr,
    );

    let status = status.map_err(|err| StepFailure {
        err,
        exit_code: None,
    })?;
    if status.success() {
        Ok(())
    } else {
        Err(StepFailure {
            err: anyhow::anyhow!("step command exited with {}", status),
            exit_code: status.code(),
        })
    }
}

async fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<std::process::ExitStatus> {
    match timeout {
        Some(dur) => match tokio::time::timeout(dur, child.wait()).await {
            Ok(status) => status.context("Could not wait for step command"),
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!("step timed out after {}s", dur.as_secs())
            }
        },
        None => child.wait().await.context("Could not wait for step command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::SharedBuf;
    use crate::events::{EventSink, Operation, Status};
    use crate::json_lines::JsonLinesUi;
    use crate::task::TaskKey;
    use std::path::PathBuf;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn sh(dir: &Path, cmd: &str) {
        let status = StdCommand::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "fixture command failed: {cmd}");
    }

    /// A git repository with one committed file.
    fn fixture_repo(root: &Path, name: &str) -> PathBuf {
        let repo = root.join("repos").join(name);
        std::fs::create_dir_all(&repo).unwrap();
        sh(&repo, "git init -q");
        sh(&repo, "git config user.email sweep@example.com");
        sh(&repo, "git config user.name sweep");
        sh(&repo, "echo hello > README.md");
        sh(&repo, "git add . && git commit -qm init");
        repo
    }

    fn fixture_task(root: &Path, key: usize, name: &str, steps: Vec<Step>) -> Arc<Task> {
        let repo_path = fixture_repo(root, name);
        Arc::new(Task {
            key: TaskKey(key),
            repository: name.to_string(),
            repo_path,
            workspace: root.join("work").join(name),
            steps,
            cached_result_found: false,
            resume_at: 0,
            cached: None,
            cache_key: None,
        })
    }

    fn step(run: &str) -> Step {
        Step {
            name: None,
            run: run.to_string(),
            env: Default::default(),
            when: None,
        }
    }

    fn template() -> ChangesetTemplate {
        ChangesetTemplate {
            branch: "sweep/test".to_string(),
            title: "Test change".to_string(),
            commit_message: None,
        }
    }

    #[test]
    fn test_shell_command_returns_platform_appropriate_values() {
        let (shell, flag) = shell_command();
        if cfg!(target_os = "windows") {
            assert_eq!(shell, "cmd");
            assert_eq!(flag, "/C");
        } else {
            assert_eq!(shell, "sh");
            assert_eq!(flag, "-c");
        }
    }

    #[test]
    fn test_build_step_env_merges_step_vars() {
        let task = Task {
            key: TaskKey(0),
            repository: "repo".to_string(),
            repo_path: PathBuf::from("/repos/repo"),
            workspace: PathBuf::from("/work/repo"),
            steps: vec![],
            cached_result_found: false,
            resume_at: 0,
            cached: None,
            cache_key: None,
        };
        let mut s = step("echo hi");
        s.env.insert("FOO".to_string(), "bar".to_string());

        let env = build_step_env(&task, &s, 2);
        assert_eq!(env.get("SWEEP_REPOSITORY").unwrap(), "repo");
        assert_eq!(env.get("SWEEP_STEP").unwrap(), "2");
        assert_eq!(env.get("FOO").unwrap(), "bar");
    }

    #[tokio::test]
    async fn test_run_produces_changeset_with_diff() {
        let dir = TempDir::new().unwrap();
        let task = fixture_task(
            dir.path(),
            0,
            "alpha",
            vec![step("echo NOTICE >> README.md")],
        );

        let buf = SharedBuf::default();
        let ui = JsonLinesUi::new(EventSink::new(Box::new(buf.clone())));
        let runner = CampaignRunner::new(2, false);
        let outcomes = runner
            .run(std::slice::from_ref(&task), &template(), &ui)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        let changeset = outcomes[0].changeset.as_ref().unwrap();
        assert_eq!(changeset.repository, "alpha");
        assert_eq!(changeset.branch, "sweep/test");
        assert!(changeset.diff.contains("NOTICE"));

        // Every lifecycle phase shows up with a started/terminal pair.
        let events = buf.events();
        for op in [
            Operation::ExecutingTask,
            Operation::TaskFetchingRepository,
            Operation::TaskInitializingWorkspace,
            Operation::TaskStep,
            Operation::TaskCalculatingDiff,
        ] {
            let started = events
                .iter()
                .filter(|e| e.operation == op && e.status == Status::Started)
                .count();
            let success = events
                .iter()
                .filter(|e| e.operation == op && e.status == Status::Success)
                .count();
            assert_eq!(started, 1, "expected one started for {op}");
            assert_eq!(success, 1, "expected one success for {op}");
        }
    }

    #[tokio::test]
    async fn test_failing_step_fails_task_with_exit_code() {
        let dir = TempDir::new().unwrap();
        let task = fixture_task(dir.path(), 0, "alpha", vec![step("exit 3")]);

        let buf = SharedBuf::default();
        let ui = JsonLinesUi::new(EventSink::new(Box::new(buf.clone())));
        let outcomes = CampaignRunner::new(1, false)
            .run(std::slice::from_ref(&task), &template(), &ui)
            .await
            .unwrap();

        assert!(!outcomes[0].success);

        let events = buf.events();
        let step_failure = events
            .iter()
            .find(|e| e.operation == Operation::TaskStep && e.status == Status::Failure)
            .unwrap();
        assert_eq!(step_failure.metadata["exit_code"], 3);

        let task_failure = events
            .iter()
            .find(|e| e.operation == Operation::ExecutingTask && e.status == Status::Failure)
            .unwrap();
        assert!(task_failure.metadata["error"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_when_condition_skips_step() {
        let dir = TempDir::new().unwrap();
        let mut conditional = step("echo SHOULD_NOT_RUN >> README.md");
        conditional.when = Some("test -f does-not-exist".to_string());
        let task = fixture_task(dir.path(), 0, "alpha", vec![conditional]);

        let buf = SharedBuf::default();
        let ui = JsonLinesUi::new(EventSink::new(Box::new(buf.clone())));
        let outcomes = CampaignRunner::new(1, false)
            .run(std::slice::from_ref(&task), &template(), &ui)
            .await
            .unwrap();

        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].changeset.as_ref().unwrap().diff, "");

        let events = buf.events();
        assert!(
            events
                .iter()
                .any(|e| e.operation == Operation::TaskStepSkipped
                    && e.metadata["step"] == 0)
        );
        // The skipped step never started.
        assert!(
            !events
                .iter()
                .any(|e| e.operation == Operation::TaskStep && e.status == Status::Started)
        );
    }

    #[tokio::test]
    async fn test_cached_task_skips_execution() {
        let dir = TempDir::new().unwrap();
        let mut task = (*fixture_task(
            dir.path(),
            0,
            "alpha",
            vec![step("echo NOTICE >> README.md")],
        ))
        .clone();
        let cached_spec = ChangesetSpec {
            repository: "alpha".to_string(),
            branch: "sweep/test".to_string(),
            title: "Test change".to_string(),
            commit_message: "Test change".to_string(),
            diff: "cached-diff".to_string(),
        };
        task.cached_result_found = true;
        task.resume_at = task.steps.len();
        task.cached = Some(CachedTaskResult {
            diff: "cached-diff".to_string(),
            changeset: cached_spec,
        });
        let task = Arc::new(task);

        let buf = SharedBuf::default();
        let ui = JsonLinesUi::new(EventSink::new(Box::new(buf.clone())));
        let outcomes = CampaignRunner::new(1, false)
            .run(std::slice::from_ref(&task), &template(), &ui)
            .await
            .unwrap();

        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].changeset.as_ref().unwrap().diff, "cached-diff");

        let events = buf.events();
        // No fetch, no steps: only the skip marker and the task pair.
        assert!(
            events
                .iter()
                .any(|e| e.operation == Operation::TaskSkippingSteps)
        );
        assert!(
            !events
                .iter()
                .any(|e| e.operation == Operation::TaskFetchingRepository)
        );
    }

    #[tokio::test]
    async fn test_cache_write_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut task = (*fixture_task(
            dir.path(),
            0,
            "alpha",
            vec![step("echo NOTICE >> README.md")],
        ))
        .clone();
        task.cache_key = Some("abc123".to_string());
        let task = Arc::new(task);

        let cache = Arc::new(ResultCache::new(dir.path().join("cache")));
        let buf = SharedBuf::default();
        let ui = JsonLinesUi::new(EventSink::new(Box::new(buf.clone())));
        let outcomes = CampaignRunner::new(1, false)
            .with_cache(Some(cache.clone()))
            .run(std::slice::from_ref(&task), &template(), &ui)
            .await
            .unwrap();
        assert!(outcomes[0].success);

        let stored = cache.get("abc123").unwrap().unwrap();
        assert!(stored.diff.contains("NOTICE"));

        let events = buf.events();
        let cache_event = events
            .iter()
            .find(|e| e.operation == Operation::CacheResult && e.status == Status::Success)
            .unwrap();
        assert_eq!(cache_event.metadata["key"], "abc123");
    }

    #[tokio::test]
    async fn test_fail_fast_reports_skipped_tasks() {
        let dir = TempDir::new().unwrap();
        let failing = fixture_task(dir.path(), 0, "alpha", vec![step("exit 1")]);
        let skipped = fixture_task(dir.path(), 1, "beta", vec![step("echo ok")]);

        let buf = SharedBuf::default();
        let ui = JsonLinesUi::new(EventSink::new(Box::new(buf.clone())));
        let outcomes = CampaignRunner::new(1, true)
            .run(&[failing, skipped], &template(), &ui)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));

        // Every task still has exactly one started and one terminal event.
        let events = buf.events();
        let started = events
            .iter()
            .filter(|e| e.operation == Operation::ExecutingTask && e.status == Status::Started)
            .count();
        let terminals = events
            .iter()
            .filter(|e| e.operation == Operation::ExecutingTask && e.status == Status::Failure)
            .count();
        assert_eq!(started, 2);
        assert_eq!(terminals, 2);

        // And the task set itself terminated with a failure.
        assert!(
            events
                .iter()
                .any(|e| e.operation == Operation::ExecutingTasks
                    && e.status == Status::Failure)
        );
    }
}

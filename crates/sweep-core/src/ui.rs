use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::interval::IntervalWriter;
use crate::task::{ChangesetSpec, Task};

/// Contract violations in the reporting layer.
///
/// These indicate the reporting interface was driven out of order, never a
/// runtime condition of the campaign itself. They are typed results rather
/// than aborts so the caller decides fatality, and they never cause a
/// malformed event to be emitted.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no task registered for repository {repository}")]
    UnknownTask { repository: String },

    #[error("task for repository {repository} is already registered")]
    AlreadyRegistered { repository: String },

    #[error("task execution reporting was already started")]
    AlreadyStarted,

    #[error("{operation} has no started event in flight for {scope}")]
    NotStarted {
        operation: &'static str,
        scope: String,
    },
}

/// Receives step output from the engine and forwards it to the UI in
/// whatever framing the UI needs. `close` completes only after all written
/// content has reached the UI, so callers can order the step's terminal
/// notification after its last output.
#[async_trait]
pub trait StepOutputWriter: Send + Sync {
    async fn write(&self, chunk: &str);
    async fn close(self: Box<Self>);
}

#[async_trait]
impl StepOutputWriter for IntervalWriter {
    async fn write(&self, chunk: &str) {
        IntervalWriter::write(self, chunk).await;
    }

    async fn close(self: Box<Self>) {
        IntervalWriter::close(*self).await;
    }
}

/// Campaign-level reporting interface the execution engine calls into.
///
/// One concrete implementation is selected at startup (machine-readable
/// JSON lines or the interactive console renderer); the engine never
/// branches on which one it talks to.
pub trait ExecUi: Send + Sync {
    fn parsing_campaign_spec(&self);
    fn parsing_campaign_spec_success(&self) -> Result<(), ReportError>;
    fn parsing_campaign_spec_failure(&self, err: &anyhow::Error) -> Result<(), ReportError>;

    fn resolving_repositories(&self);
    fn resolving_repositories_success(&self, count: usize) -> Result<(), ReportError>;
    fn resolving_repositories_failure(&self, err: &anyhow::Error) -> Result<(), ReportError>;

    fn checking_cache(&self);
    fn checking_cache_success(
        &self,
        cached_results_found: usize,
        tasks_to_execute: usize,
    ) -> Result<(), ReportError>;

    /// Begin task execution reporting. Registers every task up front and
    /// returns the per-task-set interface. Calling this a second time on
    /// the same UI is a contract violation.
    fn executing_tasks(&self, tasks: &[Arc<Task>]) -> Result<Arc<dyn TaskExecUi>, ReportError>;

    fn saving_changesets(&self, total: usize);
    fn saving_changesets_progress(&self, done: usize, total: usize) -> Result<(), ReportError>;
    fn saving_changesets_success(&self, specs: &[ChangesetSpec]) -> Result<(), ReportError>;
    fn saving_changesets_failure(&self, err: &anyhow::Error) -> Result<(), ReportError>;

    /// Report a campaign-level execution error not attributable to a single
    /// task.
    fn execution_error(&self, err: &anyhow::Error);
}

/// Reporting interface for one task set, handed out by
/// [`ExecUi::executing_tasks`].
pub trait TaskExecUi: Send + Sync {
    fn task_started(&self, task: &Task) -> Result<(), ReportError>;

    /// `err` is `None` when the task succeeded.
    fn task_finished(&self, task: &Task, err: Option<&anyhow::Error>) -> Result<(), ReportError>;

    fn task_changeset_built(&self, task: &Task, spec: &ChangesetSpec) -> Result<(), ReportError>;

    fn cache_result_written(&self, task: &Task, key: &str) -> Result<(), ReportError>;

    /// Per-step reporting interface for one task, bound to the task's
    /// external identity.
    fn steps(&self, task: &Task) -> Result<Box<dyn StepsUi>, ReportError>;

    /// Terminal for the whole task set.
    fn finished(&self, err: Option<&anyhow::Error>) -> Result<(), ReportError>;
}

/// Reporting interface for the sub-phases of one task's execution.
pub trait StepsUi: Send + Sync {
    fn fetching_repository(&self);
    fn fetching_repository_finished(&self, err: Option<&anyhow::Error>)
    -> Result<(), ReportError>;

    fn initializing_workspace(&self);
    fn initializing_workspace_finished(
        &self,
        err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError>;

    /// Steps below `start_step` are being skipped because a cached result
    /// was found.
    fn skipping_steps_up_to(&self, start_step: usize);

    /// A single step was skipped because its condition did not hold.
    fn step_skipped(&self, step: usize);

    fn step_preparing(&self, step: usize);
    fn step_preparing_finished(
        &self,
        step: usize,
        err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError>;

    fn step_started(&self, step: usize, run: &str, env: &HashMap<String, String>);

    /// Writer the engine streams the step's raw output through. The UI
    /// decides the framing; the JSON implementation rate-limits output into
    /// periodic progress notifications.
    fn step_output_writer(&self, step: usize) -> Box<dyn StepOutputWriter>;

    fn step_finished(&self, step: usize, diff: &str) -> Result<(), ReportError>;
    fn step_failed(
        &self,
        step: usize,
        err: &anyhow::Error,
        exit_code: Option<i32>,
    ) -> Result<(), ReportError>;

    fn calculating_diff(&self);
    fn calculating_diff_finished(&self, err: Option<&anyhow::Error>) -> Result<(), ReportError>;
}

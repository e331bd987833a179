use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::events::{
    CacheResultMetadata, CampaignExecutionMetadata, CheckingCacheMetadata, EventSink,
    ExecutingTasksMetadata, Operation, ParsingCampaignSpecMetadata, ResolvingRepositoriesMetadata,
    SavingChangesetsMetadata, StepMetadata, TaskDescription, TaskMetadata,
    TaskSkippingStepsMetadata, TaskStepSkippedMetadata,
};
use crate::interval::{IntervalWriter, STEP_FLUSH_INTERVAL};
use crate::registry::TaskRegistry;
use crate::reporter::{OperationGuard, OperationReporter};
use crate::task::{ChangesetSpec, Task, TaskKey};
use crate::ui::{ExecUi, ReportError, StepOutputWriter, StepsUi, TaskExecUi};

/// Machine-readable implementation of the reporting interface: every
/// lifecycle notification becomes one JSON line on the configured sink.
///
/// This is the implementation selected by `--output json`, and the stream
/// it produces is the stable contract external automation tails.
pub struct JsonLinesUi {
    shared: Arc<Shared>,
    campaign_guards: Mutex<HashMap<Operation, OperationGuard>>,
    started: AtomicBool,
}

struct Shared {
    sink: Arc<EventSink>,
    registry: TaskRegistry,
    flush_interval: Duration,
}

impl Shared {
    fn reporter(&self, operation: Operation) -> OperationReporter {
        OperationReporter::new(self.sink.clone(), operation)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl JsonLinesUi {
    /// UI writing to standard output with the default flush interval.
    pub fn stdout() -> Self {
        Self::new(EventSink::stdout())
    }

    pub fn new(sink: EventSink) -> Self {
        Self::with_flush_interval(sink, STEP_FLUSH_INTERVAL)
    }

    pub fn with_flush_interval(sink: EventSink, flush_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink: Arc::new(sink),
                registry: TaskRegistry::new(),
                flush_interval,
            }),
            campaign_guards: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    fn begin<M: serde::Serialize>(&self, operation: Operation, metadata: &M) {
        let guard = self.shared.reporter(operation).start(metadata);
        if lock(&self.campaign_guards)
            .insert(operation, guard)
            .is_some()
        {
            tracing::warn!(%operation, "operation started twice; previous instance left unterminated");
        }
    }

    fn take_guard(&self, operation: Operation) -> Result<OperationGuard, ReportError> {
        lock(&self.campaign_guards)
            .remove(&operation)
            .ok_or(ReportError::NotStarted {
                operation: operation.as_str(),
                scope: "campaign".to_string(),
            })
    }
}

impl ExecUi for JsonLinesUi {
    fn parsing_campaign_spec(&self) {
        self.begin(
            Operation::ParsingCampaignSpec,
            &ParsingCampaignSpecMetadata::default(),
        );
    }

    fn parsing_campaign_spec_success(&self) -> Result<(), ReportError> {
        self.take_guard(Operation::ParsingCampaignSpec)?
            .success(&ParsingCampaignSpecMetadata::default());
        Ok(())
    }

    fn parsing_campaign_spec_failure(&self, err: &anyhow::Error) -> Result<(), ReportError> {
        self.take_guard(Operation::ParsingCampaignSpec)?
            .failure(&ParsingCampaignSpecMetadata {
                error: Some(err.to_string()),
            });
        Ok(())
    }

    fn resolving_repositories(&self) {
        self.begin(
            Operation::ResolvingRepositories,
            &ResolvingRepositoriesMetadata::default(),
        );
    }

    fn resolving_repositories_success(&self, count: usize) -> Result<(), ReportError> {
        self.take_guard(Operation::ResolvingRepositories)?
            .success(&ResolvingRepositoriesMetadata {
                count: Some(count),
                error: None,
            });
        Ok(())
    }

    fn resolving_repositories_failure(&self, err: &anyhow::Error) -> Result<(), ReportError> {
        self.take_guard(Operation::ResolvingRepositories)?
            .failure(&ResolvingRepositoriesMetadata {
                count: None,
                error: Some(err.to_string()),
            });
        Ok(())
    }

    fn checking_cache(&self) {
        self.begin(Operation::CheckingCache, &CheckingCacheMetadata::default());
    }

    fn checking_cache_success(
        &self,
        cached_results_found: usize,
        tasks_to_execute: usize,
    ) -> Result<(), ReportError> {
        self.take_guard(Operation::CheckingCache)?
            .success(&CheckingCacheMetadata {
                cached_results_found: Some(cached_results_found),
                tasks_to_execute: Some(tasks_to_execute),
            });
        Ok(())
    }

    fn executing_tasks(&self, tasks: &[Arc<Task>]) -> Result<Arc<dyn TaskExecUi>, ReportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReportError::AlreadyStarted);
        }

        let mut descriptions = Vec::with_capacity(tasks.len());
        for task in tasks {
            let id = self.shared.registry.register(task)?;
            descriptions.push(TaskDescription {
                id,
                repository: task.repository.clone(),
                workspace: task.workspace.display().to_string(),
                steps: task.steps.clone(),
                cached_result_found: task.cached_result_found,
                start_step: task.resume_at,
            });
        }

        let guard = self
            .shared
            .reporter(Operation::ExecutingTasks)
            .start(&ExecutingTasksMetadata {
                tasks: Some(descriptions),
                error: None,
            });

        Ok(Arc::new(JsonLinesTaskUi {
            shared: self.shared.clone(),
            set_guard: Mutex::new(Some(guard)),
            task_guards: Mutex::new(HashMap::new()),
        }))
    }

    fn saving_changesets(&self, total: usize) {
        self.begin(
            Operation::SavingChangesets,
            &SavingChangesetsMetadata {
                done: Some(0),
                total: Some(total),
                ..Default::default()
            },
        );
    }

    fn saving_changesets_progress(&self, done: usize, total: usize) -> Result<(), ReportError> {
        let guards = lock(&self.campaign_guards);
        let guard = guards
            .get(&Operation::SavingChangesets)
            .ok_or(ReportError::NotStarted {
                operation: Operation::SavingChangesets.as_str(),
                scope: "campaign".to_string(),
            })?;
        guard.progress(&SavingChangesetsMetadata {
            done: Some(done),
            total: Some(total),
            ..Default::default()
        });
        Ok(())
    }

    fn saving_changesets_success(&self, specs: &[ChangesetSpec]) -> Result<(), ReportError> {
        self.take_guard(Operation::SavingChangesets)?
            .success(&SavingChangesetsMetadata {
                done: Some(specs.len()),
                total: Some(specs.len()),
                repositories: Some(specs.iter().map(|s| s.repository.clone()).collect()),
                error: None,
            });
        Ok(())
    }

    fn saving_changesets_failure(&self, err: &anyhow::Error) -> Result<(), ReportError> {
        self.take_guard(Operation::SavingChangesets)?
            .failure(&SavingChangesetsMetadata {
                error: Some(err.to_string()),
                ..Default::default()
            });
        Ok(())
    }

    fn execution_error(&self, err: &anyhow::Error) {
        self.shared
            .reporter(Operation::CampaignExecution)
            .start(&CampaignExecutionMetadata {
                error: err.to_string(),
            })
            .failure(&CampaignExecutionMetadata {
                error: err.to_string(),
            });
    }
}

struct JsonLinesTaskUi {
    shared: Arc<Shared>,
    set_guard: Mutex<Option<OperationGuard>>,
    task_guards: Mutex<HashMap<TaskKey, OperationGuard>>,
}

impl TaskExecUi for JsonLinesTaskUi {
    fn task_started(&self, task: &Task) -> Result<(), ReportError> {
        let task_id = self.shared.registry.resolve(task)?;
        let guard = self
            .shared
            .reporter(Operation::ExecutingTask)
            .start(&TaskMetadata {
                task_id,
                error: None,
            });
        if lock(&self.task_guards).insert(task.key, guard).is_some() {
            tracing::warn!(repository = %task.repository, "task started twice; previous instance left unterminated");
        }
        Ok(())
    }

    fn task_finished(&self, task: &Task, err: Option<&anyhow::Error>) -> Result<(), ReportError> {
        let task_id = self.shared.registry.resolve(task)?;
        let guard =
            lock(&self.task_guards)
                .remove(&task.key)
                .ok_or_else(|| ReportError::NotStarted {
                    operation: Operation::ExecutingTask.as_str(),
                    scope: task.repository.clone(),
                })?;
        match err {
            Some(err) => guard.failure(&TaskMetadata {
                task_id,
                error: Some(err.to_string()),
            }),
            None => guard.success(&TaskMetadata {
                task_id,
                error: None,
            }),
        }
        Ok(())
    }

    fn task_changeset_built(&self, task: &Task, _spec: &ChangesetSpec) -> Result<(), ReportError> {
        let task_id = self.shared.registry.resolve(task)?;
        self.shared
            .reporter(Operation::TaskBuildingChangeset)
            .instant_success(&TaskMetadata {
                task_id,
                error: None,
            });
        Ok(())
    }

    fn cache_result_written(&self, task: &Task, key: &str) -> Result<(), ReportError> {
        let task_id = self.shared.registry.resolve(task)?;
        self.shared
            .reporter(Operation::CacheResult)
            .instant_success(&CacheResultMetadata {
                task_id,
                key: key.to_string(),
            });
        Ok(())
    }

    fn steps(&self, task: &Task) -> Result<Box<dyn StepsUi>, ReportError> {
        let task_id = self.shared.registry.resolve(task)?;
        Ok(Box::new(JsonLinesStepsUi {
            shared: self.shared.clone(),
            task_id,
            repository: task.repository.clone(),
            phase_guards: Mutex::new(HashMap::new()),
            step_guards: Mutex::new(HashMap::new()),
        }))
    }

    fn finished(&self, err: Option<&anyhow::Error>) -> Result<(), ReportError> {
        let guard = lock(&self.set_guard)
            .take()
            .ok_or(ReportError::NotStarted {
                operation: Operation::ExecutingTasks.as_str(),
                scope: "task set".to_string(),
            })?;
        match err {
            Some(err) => guard.failure(&ExecutingTasksMetadata {
                tasks: None,
                error: Some(err.to_string()),
            }),
            None => guard.success(&ExecutingTasksMetadata::default()),
        }
        Ok(())
    }
}

struct JsonLinesStepsUi {
    shared: Arc<Shared>,
    task_id: String,
    repository: String,
    phase_guards: Mutex<HashMap<Operation, OperationGuard>>,
    step_guards: Mutex<HashMap<(Operation, usize), OperationGuard>>,
}

impl JsonLinesStepsUi {
    fn task_meta(&self, err: Option<&anyhow::Error>) -> TaskMetadata {
        TaskMetadata {
            task_id: self.task_id.clone(),
            error: err.map(|e| e.to_string()),
        }
    }

    fn begin_phase(&self, operation: Operation) {
        let guard = self.shared.reporter(operation).start(&self.task_meta(None));
        if lock(&self.phase_guards).insert(operation, guard).is_some() {
            tracing::warn!(%operation, repository = %self.repository, "phase started twice; previous instance left unterminated");
        }
    }

    fn finish_phase(
        &self,
        operation: Operation,
        err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError> {
        let guard =
            lock(&self.phase_guards)
                .remove(&operation)
                .ok_or_else(|| ReportError::NotStarted {
                    operation: operation.as_str(),
                    scope: self.repository.clone(),
                })?;
        match err {
            Some(_) => guard.failure(&self.task_meta(err)),
            None => guard.success(&self.task_meta(None)),
        }
        Ok(())
    }

    fn step_meta(&self, step: usize) -> StepMetadata {
        StepMetadata {
            task_id: self.task_id.clone(),
            step,
            ..Default::default()
        }
    }

    fn take_step_guard(
        &self,
        operation: Operation,
        step: usize,
    ) -> Result<OperationGuard, ReportError> {
        lock(&self.step_guards)
            .remove(&(operation, step))
            .ok_or_else(|| ReportError::NotStarted {
                operation: operation.as_str(),
                scope: format!("{} step {}", self.repository, step),
            })
    }
}

impl StepsUi for JsonLinesStepsUi {
    fn fetching_repository(&self) {
        self.begin_phase(Operation::TaskFetchingRepository);
    }

    fn fetching_repository_finished(
        &self,
        err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError> {
        self.finish_phase(Operation::TaskFetchingRepository, err)
    }

    fn initializing_workspace(&self) {
        self.begin_phase(Operation::TaskInitializingWorkspace);
    }

    fn initializing_workspace_finished(
        &self,
        err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError> {
        self.finish_phase(Operation::TaskInitializingWorkspace, err)
    }

    fn skipping_steps_up_to(&self, start_step: usize) {
        self.shared
            .reporter(Operation::TaskSkippingSteps)
            .instant_success(&TaskSkippingStepsMetadata {
                task_id: self.task_id.clone(),
                start_step,
            });
    }

    fn step_skipped(&self, step: usize) {
        self.shared
            .reporter(Operation::TaskStepSkipped)
            .instant_success(&TaskStepSkippedMetadata {
                task_id: self.task_id.clone(),
                step,
            });
    }

    fn step_preparing(&self, step: usize) {
        let guard = self
            .shared
            .reporter(Operation::TaskPreparingStep)
            .start(&self.step_meta(step));
        lock(&self.step_guards).insert((Operation::TaskPreparingStep, step), guard);
    }

    fn step_preparing_finished(
        &self,
        step: usize,
        err: Option<&anyhow::Error>,
    ) -> Result<(), ReportError> {
        let guard = self.take_step_guard(Operation::TaskPreparingStep, step)?;
        match err {
            Some(err) => guard.failure(&StepMetadata {
                error: Some(err.to_string()),
                ..self.step_meta(step)
            }),
            None => guard.success(&self.step_meta(step)),
        }
        Ok(())
    }

    fn step_started(&self, step: usize, run: &str, env: &HashMap<String, String>) {
        let guard = self
            .shared
            .reporter(Operation::TaskStep)
            .start(&StepMetadata {
                run: Some(run.to_string()),
                env: Some(env.clone()),
                ..self.step_meta(step)
            });
        lock(&self.step_guards).insert((Operation::TaskStep, step), guard);
    }

    fn step_output_writer(&self, step: usize) -> Box<dyn StepOutputWriter> {
        let shared = self.shared.clone();
        let task_id = self.task_id.clone();
        let sink = move |out: String| {
            shared.sink.emit(
                Operation::TaskStep,
                crate::events::Status::Progress,
                &StepMetadata {
                    task_id: task_id.clone(),
                    step,
                    out: Some(out),
                    ..Default::default()
                },
            );
        };
        Box::new(IntervalWriter::new(self.shared.flush_interval, sink))
    }

    fn step_finished(&self, step: usize, diff: &str) -> Result<(), ReportError> {
        let guard = self.take_step_guard(Operation::TaskStep, step)?;
        guard.success(&StepMetadata {
            diff: Some(diff.to_string()),
            ..self.step_meta(step)
        });
        Ok(())
    }

    fn step_failed(
        &self,
        step: usize,
        err: &anyhow::Error,
        exit_code: Option<i32>,
    ) -> Result<(), ReportError> {
        let guard = self.take_step_guard(Operation::TaskStep, step)?;
        guard.failure(&StepMetadata {
            error: Some(err.to_string()),
            exit_code,
            ..self.step_meta(step)
        });
        Ok(())
    }

    fn calculating_diff(&self) {
        self.begin_phase(Operation::TaskCalculatingDiff);
    }

    fn calculating_diff_finished(&self, err: Option<&anyhow::Error>) -> Result<(), ReportError> {
        self.finish_phase(Operation::TaskCalculatingDiff, err)
    }
}

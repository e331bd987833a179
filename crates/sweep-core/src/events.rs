use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Step;

/// Lifecycle phases reported on the event stream.
///
/// The wire names are a stable contract for external consumers and must not
/// change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    ParsingCampaignSpec,
    ResolvingRepositories,
    CheckingCache,
    ExecutingTasks,
    ExecutingTask,
    TaskFetchingRepository,
    TaskInitializingWorkspace,
    TaskSkippingSteps,
    TaskStepSkipped,
    TaskPreparingStep,
    TaskStep,
    TaskCalculatingDiff,
    TaskBuildingChangeset,
    CacheResult,
    SavingChangesets,
    CampaignExecution,
}

impl Operation {
    /// Wire name of the operation, identical to its JSON serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ParsingCampaignSpec => "PARSING_CAMPAIGN_SPEC",
            Operation::ResolvingRepositories => "RESOLVING_REPOSITORIES",
            Operation::CheckingCache => "CHECKING_CACHE",
            Operation::ExecutingTasks => "EXECUTING_TASKS",
            Operation::ExecutingTask => "EXECUTING_TASK",
            Operation::TaskFetchingRepository => "TASK_FETCHING_REPOSITORY",
            Operation::TaskInitializingWorkspace => "TASK_INITIALIZING_WORKSPACE",
            Operation::TaskSkippingSteps => "TASK_SKIPPING_STEPS",
            Operation::TaskStepSkipped => "TASK_STEP_SKIPPED",
            Operation::TaskPreparingStep => "TASK_PREPARING_STEP",
            Operation::TaskStep => "TASK_STEP",
            Operation::TaskCalculatingDiff => "TASK_CALCULATING_DIFF",
            Operation::TaskBuildingChangeset => "TASK_BUILDING_CHANGESET",
            Operation::CacheResult => "CACHE_RESULT",
            Operation::SavingChangesets => "SAVING_CHANGESETS",
            Operation::CampaignExecution => "CAMPAIGN_EXECUTION",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a notification within an operation's lifecycle.
///
/// Every operation instance emits exactly one `Started`, any number of
/// `Progress`, then exactly one of `Success` or `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Started,
    Progress,
    Success,
    Failure,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Started => "STARTED",
            Status::Progress => "PROGRESS",
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// One notification on the stream: a single line of JSON.
///
/// Consumers can deserialize each line into this type. The overall stream
/// interleaves lines from concurrently running tasks; per-task ordering is
/// reconstructed from the identifiers embedded in `metadata`, not from
/// stream position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub status: Status,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Timestamp codec for the wire format: RFC 3339 with exactly millisecond
/// precision.
mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// External description of a task, embedded in the `EXECUTING_TASKS` start
/// payload so consumers can associate later per-task events with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescription {
    pub id: String,
    pub repository: String,
    pub workspace: String,
    pub steps: Vec<Step>,
    pub cached_result_found: bool,
    pub start_step: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct ParsingCampaignSpecMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ResolvingRepositoriesMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct CheckingCacheMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_results_found: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks_to_execute: Option<usize>,
}

#[derive(Debug, Default, Serialize)]
pub struct ExecutingTasksMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskDescription>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for task-scoped operations that carry no extra detail beyond the
/// task identity (overall execution, repository fetch, workspace init, diff
/// calculation, changeset building).
#[derive(Debug, Default, Serialize)]
pub struct TaskMetadata {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskSkippingStepsMetadata {
    pub task_id: String,
    pub start_step: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskStepSkippedMetadata {
    pub task_id: String,
    pub step: usize,
}

/// Payload for `TASK_PREPARING_STEP` and `TASK_STEP`. Which optional fields
/// are present depends on the status: `run`/`env` on start, `out` on
/// progress, `diff` on success, `error`/`exit_code` on failure.
#[derive(Debug, Default, Serialize)]
pub struct StepMetadata {
    pub task_id: String,
    pub step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct CacheResultMetadata {
    pub task_id: String,
    pub key: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SavingChangesetsMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repositories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct CampaignExecutionMetadata {
    pub error: String,
}

/// Serializes notifications as single JSON lines on one configured sink.
///
/// The serialize-and-write step is atomic with respect to concurrent emits:
/// the encoded line is written with one `write_all` under the sink lock, so
/// interleaved calls can never mangle a line. Write failures are logged to
/// the diagnostic channel and swallowed; a broken consumer must never fail
/// the run.
pub struct EventSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl EventSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Sink writing to the process's standard output, the default transport
    /// external tooling tails.
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Emit one notification. The timestamp is captured here and truncated
    /// to millisecond precision.
    pub fn emit<M: Serialize>(&self, operation: Operation, status: Status, metadata: &M) {
        let metadata = match serde_json::to_value(metadata) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(%operation, %status, error = %e, "dropping unserializable metadata");
                serde_json::Value::Null
            }
        };
        let event = Event {
            timestamp: truncate_to_millis(Utc::now()),
            operation,
            status,
            metadata,
        };

        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(%operation, %status, error = %e, "failed to encode event");
                return;
            }
        };
        line.push('\n');

        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = out.write_all(line.as_bytes()).and_then(|()| out.flush()) {
            tracing::warn!(%operation, %status, error = %e, "failed to write event line");
        }
    }
}

fn truncate_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_nanosecond(dt.nanosecond() / 1_000_000 * 1_000_000)
        .unwrap_or(dt)
}

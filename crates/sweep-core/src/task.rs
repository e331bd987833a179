use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CachedTaskResult;

/// Dense index identifying a task within one run.
///
/// Assigned by the engine when the task list is built and carried alongside
/// the task, so lookups never depend on pointer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey(pub usize);

/// One script execution inside a task's workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Optional human-readable label shown in event payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Shell command executed in the task workspace.
    pub run: String,

    /// Extra environment variables for this step.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Optional condition command. The step runs only when this command
    /// exits zero in the workspace; otherwise the step is reported skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

/// One unit of per-repository campaign work.
///
/// Built by the engine before reporting begins and treated as read-only by
/// the reporting layer.
#[derive(Debug, Clone)]
pub struct Task {
    pub key: TaskKey,

    /// Repository name (directory name of the checkout).
    pub repository: String,

    /// Path to the source repository the workspace is created from.
    pub repo_path: PathBuf,

    /// Path to the scratch workspace the steps execute in.
    pub workspace: PathBuf,

    /// Ordered steps to execute.
    pub steps: Vec<Step>,

    /// Whether a cached result for this task definition was found.
    pub cached_result_found: bool,

    /// Step index execution resumes at when a cached result was found.
    pub resume_at: usize,

    /// The cached result itself, when one was found.
    pub cached: Option<CachedTaskResult>,

    /// Cache key for this task definition, when caching is enabled.
    pub cache_key: Option<String>,
}

/// The per-task artifact of a successful campaign run: everything needed to
/// turn the workspace diff into a proposed change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetSpec {
    pub repository: String,
    pub branch: String,
    pub title: String,
    pub commit_message: String,
    pub diff: String,
}

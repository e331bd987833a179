use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::task::Step;

/// Template for the changeset produced from each repository's diff.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetTemplate {
    /// Branch name the change is proposed on.
    pub branch: String,

    /// Changeset title.
    pub title: String,

    /// Commit message. Defaults to the title when absent.
    #[serde(default)]
    pub commit_message: Option<String>,
}

impl ChangesetTemplate {
    pub fn commit_message(&self) -> &str {
        self.commit_message.as_deref().unwrap_or(&self.title)
    }
}

/// Top-level sweep.yaml campaign definition.
#[derive(Debug, Deserialize)]
pub struct Campaign {
    /// Campaign name.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Glob patterns selecting repository checkouts, relative to the
    /// campaign file's directory.
    pub repos: Vec<String>,

    /// Steps executed in order in every matched repository's workspace.
    pub steps: Vec<Step>,

    pub changeset: ChangesetTemplate,
}

impl Campaign {
    /// Load and parse a campaign file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read campaign file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Could not parse campaign file {}", path.display()))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let campaign: Campaign = yaml_serde::from_str(yaml)?;
        Ok(campaign)
    }

    /// Post-parse validation. Returns warnings; the caller is responsible
    /// for presenting them to the user.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.steps.is_empty() {
            warnings.push("campaign has no steps; every task will produce an empty diff".into());
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.run.trim().is_empty() {
                warnings.push(format!("step {} has an empty run command", i));
            }
        }
        if self.repos.is_empty() {
            warnings.push("campaign has no repository patterns".into());
        }
        if self.changeset.branch.trim().is_empty() {
            warnings.push("changeset branch is empty".into());
        }

        warnings
    }
}

/// Resolve repository glob patterns to `(name, path)` pairs.
///
/// A match counts as a repository when it is a directory containing a
/// `.git` entry; other matches are skipped with a diagnostic so a stray
/// pattern never fails the whole campaign silently.
pub fn resolve_repositories(root: &Path, patterns: &[String]) -> Result<Vec<(String, PathBuf)>> {
    let mut repos: Vec<(String, PathBuf)> = Vec::new();

    for pattern in patterns {
        let full_pattern = root.join(pattern);
        let full_pattern = full_pattern.to_string_lossy();
        let entries = glob::glob(&full_pattern)
            .with_context(|| format!("Invalid repository pattern '{}'", pattern))?;

        for entry in entries {
            let path = entry.with_context(|| format!("Could not match pattern '{}'", pattern))?;
            if !path.is_dir() {
                continue;
            }
            if !path.join(".git").exists() {
                tracing::warn!(path = %path.display(), "skipping match without a .git directory");
                continue;
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            if !repos.iter().any(|(_, p)| *p == path) {
                repos.push((name, path));
            }
        }
    }

    repos.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(repos)
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::campaign::ChangesetTemplate;
use crate::task::{ChangesetSpec, Step};

/// Cached outcome of one task, keyed by the task definition and the
/// repository revision it ran against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTaskResult {
    pub diff: String,
    pub changeset: ChangesetSpec,
}

/// On-disk cache of task results.
///
/// Keys are content hashes of everything that determines a task's outcome;
/// a changed step list or a new repository revision produces a different
/// key, so entries never need invalidation.
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Compute the cache key for a task definition.
    pub fn task_key(
        repository: &str,
        rev: &str,
        steps: &[Step],
        template: &ChangesetTemplate,
    ) -> String {
        #[derive(Serialize)]
        struct KeyInput<'a> {
            repository: &'a str,
            rev: &'a str,
            steps: &'a [Step],
            branch: &'a str,
            title: &'a str,
            commit_message: &'a str,
        }

        let input = KeyInput {
            repository,
            rev,
            steps,
            branch: &template.branch,
            title: &template.title,
            commit_message: template.commit_message(),
        };

        let mut hasher = Sha256::new();
        // Serializing these types cannot fail; an empty digest input would
        // only collide with another empty input.
        if let Ok(serialized) = serde_json::to_vec(&input) {
            hasher.update(&serialized);
        }
        hex_digest(&hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Result<Option<CachedTaskResult>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Could not read cache entry {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt cache entry");
                Ok(None)
            }
        }
    }

    pub fn set(&self, key: &str, result: &CachedTaskResult) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create cache directory {}", self.dir.display()))?;
        let path = self.entry_path(key);
        let content = serde_json::to_string(result).context("Could not encode cache entry")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Could not write cache entry {}", path.display()))?;
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn template() -> ChangesetTemplate {
        ChangesetTemplate {
            branch: "sweep/test".to_string(),
            title: "Test".to_string(),
            commit_message: None,
        }
    }

    fn step(run: &str) -> Step {
        Step {
            name: None,
            run: run.to_string(),
            env: Default::default(),
            when: None,
        }
    }

    #[test]
    fn test_key_is_stable_and_content_sensitive() {
        let steps = vec![step("echo hi")];
        let a = ResultCache::task_key("repo", "abc123", &steps, &template());
        let b = ResultCache::task_key("repo", "abc123", &steps, &template());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_steps = vec![step("echo bye")];
        assert_ne!(
            a,
            ResultCache::task_key("repo", "abc123", &other_steps, &template())
        );
        assert_ne!(
            a,
            ResultCache::task_key("repo", "def456", &steps, &template())
        );
    }

    #[test]
    fn test_get_set_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(dir.path().join("cache"));

        let result = CachedTaskResult {
            diff: "--- a\n+++ b\n".to_string(),
            changeset: ChangesetSpec {
                repository: "repo".to_string(),
                branch: "sweep/test".to_string(),
                title: "Test".to_string(),
                commit_message: "Test".to_string(),
                diff: "--- a\n+++ b\n".to_string(),
            },
        };

        assert!(cache.get("k1").unwrap().is_none());
        cache.set("k1", &result).unwrap();
        let loaded = cache.get("k1").unwrap().unwrap();
        assert_eq!(loaded.diff, result.diff);
        assert_eq!(loaded.changeset.repository, "repo");
    }

    #[test]
    fn test_corrupt_entry_is_ignored() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();

        assert!(cache.get("bad").unwrap().is_none());
    }
}

pub mod exec;
pub mod validate;

/// Results from running a campaign across multiple repositories.
///
/// Each entry is a `(repository, success)` tuple.
#[derive(Debug, Clone)]
pub struct TaskResults {
    pub results: Vec<(String, bool)>,
}

impl TaskResults {
    /// Number of tasks that succeeded.
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|(_, s)| *s).count()
    }

    /// Number of tasks that failed.
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, s)| !*s).count()
    }
}

impl From<Vec<(String, bool)>> for TaskResults {
    fn from(results: Vec<(String, bool)>) -> Self {
        Self { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_results_counts() {
        let results = TaskResults::from(vec![
            ("a".to_string(), true),
            ("b".to_string(), false),
            ("c".to_string(), true),
        ]);
        assert_eq!(results.passed(), 2);
        assert_eq!(results.failed(), 1);
    }

    #[test]
    fn test_task_results_empty() {
        let results = TaskResults::from(vec![]);
        assert_eq!(results.passed(), 0);
        assert_eq!(results.failed(), 0);
    }
}

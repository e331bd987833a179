use std::sync::Arc;

use serde::Serialize;

use crate::events::{EventSink, Operation, Status};

/// Builds the start/progress/terminal event protocol for one operation kind.
///
/// `start` emits the `STARTED` notification and hands back a one-shot
/// [`OperationGuard`]; the terminal methods consume the guard, so emitting a
/// second terminal for the same operation instance does not compile.
#[derive(Clone)]
pub struct OperationReporter {
    sink: Arc<EventSink>,
    operation: Operation,
}

impl OperationReporter {
    pub fn new(sink: Arc<EventSink>, operation: Operation) -> Self {
        Self { sink, operation }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Emit `STARTED` and return the guard for the in-flight operation.
    #[must_use = "the guard carries the operation's single terminal event"]
    pub fn start<M: Serialize>(&self, metadata: &M) -> OperationGuard {
        self.sink.emit(self.operation, Status::Started, metadata);
        OperationGuard {
            sink: self.sink.clone(),
            operation: self.operation,
        }
    }

    /// Emit an immediately-completed operation: `STARTED` followed by
    /// `SUCCESS`, with the same payload on both notifications.
    pub fn instant_success<M: Serialize>(&self, metadata: &M) {
        self.start(metadata).success(metadata);
    }
}

/// In-flight operation instance. Dropping the guard without calling a
/// terminal method leaves the operation unterminated on the stream, so every
/// code path must end in [`success`](Self::success) or
/// [`failure`](Self::failure).
pub struct OperationGuard {
    sink: Arc<EventSink>,
    operation: Operation,
}

impl OperationGuard {
    /// Emit a `PROGRESS` notification. May be called any number of times.
    pub fn progress<M: Serialize>(&self, metadata: &M) {
        self.sink.emit(self.operation, Status::Progress, metadata);
    }

    /// Terminal: emit `SUCCESS` and consume the guard.
    pub fn success<M: Serialize>(self, metadata: &M) {
        self.sink.emit(self.operation, Status::Success, metadata);
    }

    /// Terminal: emit `FAILURE` and consume the guard. The metadata is
    /// expected to carry the error's textual description.
    pub fn failure<M: Serialize>(self, metadata: &M) {
        self.sink.emit(self.operation, Status::Failure, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::SharedBuf;
    use crate::events::TaskMetadata;

    fn reporter(buf: &SharedBuf, operation: Operation) -> OperationReporter {
        OperationReporter::new(Arc::new(EventSink::new(Box::new(buf.clone()))), operation)
    }

    #[test]
    fn test_start_progress_terminal_sequence() {
        let buf = SharedBuf::default();
        let reporter = reporter(&buf, Operation::ExecutingTask);

        let meta = TaskMetadata {
            task_id: "t1".to_string(),
            error: None,
        };
        let guard = reporter.start(&meta);
        guard.progress(&meta);
        guard.progress(&meta);
        guard.success(&meta);

        let statuses: Vec<Status> = buf.events().iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                Status::Started,
                Status::Progress,
                Status::Progress,
                Status::Success
            ]
        );
    }

    #[test]
    fn test_failure_is_terminal() {
        let buf = SharedBuf::default();
        let reporter = reporter(&buf, Operation::TaskStep);

        let guard = reporter.start(&serde_json::json!({}));
        guard.failure(&serde_json::json!({"error": "exit status 2"}));

        let events = buf.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, Status::Failure);
        assert_eq!(events[1].metadata["error"], "exit status 2");
    }

    #[test]
    fn test_instant_success_emits_started_then_success() {
        let buf = SharedBuf::default();
        let reporter = reporter(&buf, Operation::CacheResult);

        reporter.instant_success(&serde_json::json!({"key": "abc"}));

        let events = buf.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, Status::Started);
        assert_eq!(events[1].status, Status::Success);
        assert_eq!(events[0].metadata, events[1].metadata);
    }

    #[test]
    fn test_timestamps_non_decreasing_within_operation() {
        let buf = SharedBuf::default();
        let reporter = reporter(&buf, Operation::SavingChangesets);

        let guard = reporter.start(&serde_json::json!({}));
        for done in 0..20 {
            guard.progress(&serde_json::json!({"done": done}));
        }
        guard.success(&serde_json::json!({}));

        let events = buf.events();
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }
}

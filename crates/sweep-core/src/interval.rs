use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// How often buffered step output becomes one progress notification.
pub const STEP_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Rate-limits a high-frequency output stream into periodic notifications.
///
/// Writes append to an accumulator; a background flusher drains the whole
/// accumulator into the sink once per interval, skipping ticks where nothing
/// accumulated. Closing the writer performs exactly one final flush of any
/// remaining content, so trailing output survives cancellation. The
/// accumulator swap is mutually exclusive with concurrent appends: no byte
/// is lost, duplicated, or observed half-flushed.
pub struct IntervalWriter {
    buf: Arc<Mutex<String>>,
    shutdown: Arc<Notify>,
    flusher: Option<JoinHandle<()>>,
}

impl IntervalWriter {
    pub fn new<F>(every: Duration, sink: F) -> Self
    where
        F: Fn(String) + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(String::new()));
        let shutdown = Arc::new(Notify::new());
        let flusher = tokio::spawn(flush_loop(buf.clone(), shutdown.clone(), every, sink));
        Self {
            buf,
            shutdown,
            flusher: Some(flusher),
        }
    }

    /// Append a chunk to the accumulator. A single large chunk is never
    /// split; it is flushed whole at the next tick or at finalization.
    pub async fn write(&self, chunk: &str) {
        self.buf.lock().await.push_str(chunk);
    }

    /// Stop the flusher after its final flush. Completion of this call
    /// guarantees all buffered content has reached the sink.
    pub async fn close(mut self) {
        self.shutdown.notify_one();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.await;
        }
    }
}

impl Drop for IntervalWriter {
    fn drop(&mut self) {
        // If the writer is dropped without close(), the flusher still gets
        // woken for its final flush; it just isn't awaited.
        self.shutdown.notify_one();
    }
}

async fn flush_loop<F>(buf: Arc<Mutex<String>>, shutdown: Arc<Notify>, every: Duration, sink: F)
where
    F: Fn(String),
{
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pending = std::mem::take(&mut *buf.lock().await);
                if !pending.is_empty() {
                    sink(pending);
                }
            }
            _ = shutdown.notified() => {
                let pending = std::mem::take(&mut *buf.lock().await);
                if !pending.is_empty() {
                    sink(pending);
                }
                break;
            }
        }
    }
}

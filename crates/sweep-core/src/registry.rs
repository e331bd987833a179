use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::task::{Task, TaskKey};
use crate::ui::ReportError;

/// Maps process-lifetime task handles to stable external identifiers.
///
/// An identifier is assigned exactly once, at registration, before any event
/// referencing the task is emitted, and is never reused or reassigned. IDs
/// combine a monotonic counter with a random component drawn from an RNG
/// owned by this registry, so they are collision-free within a run without
/// relying on global state.
pub struct TaskRegistry {
    next: AtomicU64,
    rng: Mutex<StdRng>,
    ids: Mutex<HashMap<TaskKey, String>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            next: AtomicU64::new(0),
            rng: Mutex::new(rng),
            ids: Mutex::new(HashMap::new()),
        }
    }

    /// Assign an external ID to `task`. Must be called exactly once per
    /// task; a second registration is a contract violation.
    pub fn register(&self, task: &Task) -> Result<String, ReportError> {
        let mut ids = match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ids.contains_key(&task.key) {
            return Err(ReportError::AlreadyRegistered {
                repository: task.repository.clone(),
            });
        }

        let counter = self.next.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rng.r#gen()
        };
        let id = encode_base36((counter << 32) | u64::from(salt));
        ids.insert(task.key, id.clone());
        Ok(id)
    }

    /// Look up the external ID of a previously registered task.
    pub fn resolve(&self, task: &Task) -> Result<String, ReportError> {
        let ids = match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.get(&task.key)
            .cloned()
            .ok_or_else(|| ReportError::UnknownTask {
                repository: task.repository.clone(),
            })
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode `n` into a compact lowercase alphanumeric form.
fn encode_base36(mut n: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = String::new();
    while n > 0 {
        out.insert(0, ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// Scheduling primitive shared by the transaction and dialog layers.
///
/// Tasks are ordered by deadline in a `BTreeMap` keyed by
/// `(deadline, task id)`; a side map from task id to deadline makes
/// `cancel` O(log n). The wheel never runs callbacks itself: owners call
/// [`Timer::poll`] from their serve loop and dispatch the drained values
/// into per-object channels, so nothing ever fires on a socket read path.
///
/// A task that fires after its owner reached a terminal state is expected
/// to be a no-op on the owner's side; the wheel makes no attempt to know.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|ts| ts.len()).unwrap_or_default()
    }

    /// Schedule `value` to fire after `delay`. Returns the task id used for
    /// cancellation.
    pub fn timeout(&self, delay: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + delay, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .write()
            .as_mut()
            .map(|ts| ts.insert((deadline, task_id), value))
            .ok();
        self.deadlines
            .write()
            .as_mut()
            .map(|ds| ds.insert(task_id, deadline))
            .ok();
        task_id
    }

    /// Cancel a pending task, returning its value if it had not fired yet.
    /// Cancelling an already-fired or unknown id is a no-op.
    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let deadline = self
            .deadlines
            .write()
            .as_mut()
            .map(|ds| ds.remove(&task_id))
            .ok()
            .flatten()?;
        self.tasks
            .write()
            .as_mut()
            .map(|ts| ts.remove(&(deadline, task_id)))
            .ok()
            .flatten()
    }

    /// Drain every task whose deadline is at or before `now`, in deadline
    /// order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        let drained: Vec<(Instant, u64)> = {
            let mut tasks = match self.tasks.write() {
                Ok(tasks) => tasks,
                Err(_) => return fired,
            };
            let due: Vec<(Instant, u64)> = tasks
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect();
            fired.reserve(due.len());
            for key in due.iter() {
                if let Some(value) = tasks.remove(key) {
                    fired.push(value);
                }
            }
            due
        };
        if !drained.is_empty() {
            self.deadlines
                .write()
                .as_mut()
                .map(|ds| {
                    for (_, task_id) in drained {
                        ds.remove(&task_id);
                    }
                })
                .ok();
        }
        fired
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Timer;
    use std::time::{Duration, Instant};

    #[test]
    fn test_timeout_and_cancel() {
        let timer = Timer::new();
        let now = Instant::now();
        let task_id = timer.timeout_at(now, "first");
        assert_eq!(timer.cancel(task_id), Some("first"));
        assert_eq!(timer.cancel(task_id), None);

        timer.timeout_at(now, "second");
        let fired = timer.poll(now + Duration::from_secs(1));
        assert_eq!(fired, vec!["second"]);

        timer.timeout_at(now + Duration::from_millis(1500), "third");
        assert!(timer.poll(now + Duration::from_secs(1)).is_empty());
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn test_poll_order() {
        let timer = Timer::new();
        let now = Instant::now();
        timer.timeout_at(now + Duration::from_millis(20), "late");
        timer.timeout_at(now + Duration::from_millis(10), "early");
        let fired = timer.poll(now + Duration::from_millis(30));
        assert_eq!(fired, vec!["early", "late"]);
    }

    #[test]
    fn test_stale_cancel_after_poll() {
        let timer = Timer::new();
        let now = Instant::now();
        let id = timer.timeout_at(now, "gone");
        timer.poll(now);
        // fired tasks cannot be cancelled, and the id map must not leak
        assert_eq!(timer.cancel(id), None);
        assert_eq!(timer.len(), 0);
    }
}

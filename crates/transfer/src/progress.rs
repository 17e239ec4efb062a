use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{trace, warn};

/// A progress notification for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub task_id: String,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

impl ProgressEvent {
    /// Progress as a fraction in `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.uploaded_bytes as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Callback invoked with upload progress.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Handle returned by [`ProgressReporter::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous, in-order progress fan-out.
///
/// Emits for the same task never go backwards: an emit with a byte count
/// below the last delivered one is dropped. Callbacks run on the emitting
/// task, outside the reporter's locks, so they may subscribe or
/// unsubscribe freely but must not block.
pub struct ProgressReporter {
    subscribers: RwLock<Subscribers>,
    last_emitted: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Subscribers {
    per_task: HashMap<String, Vec<(SubscriptionId, ProgressCallback)>>,
    global: Vec<(SubscriptionId, ProgressCallback)>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Subscribers::default()),
            last_emitted: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback for a single task.
    pub fn subscribe<F>(&self, task_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subs.per_task
            .entry(task_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Registers a callback for every task.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subs.global.push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subs.global.len();
        subs.global.retain(|(sid, _)| *sid != id);
        if subs.global.len() != before {
            return true;
        }
        let mut removed = false;
        subs.per_task.retain(|_, list| {
            let len = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != len;
            !list.is_empty()
        });
        removed
    }

    /// Delivers a progress notification.
    ///
    /// Returns `false` (and delivers nothing) if `uploaded_bytes` is below
    /// the last value delivered for this task.
    pub fn emit(&self, task_id: &str, uploaded_bytes: u64, total_bytes: u64) -> bool {
        {
            let mut last = self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(&prev) = last.get(task_id)
                && uploaded_bytes < prev
            {
                warn!(
                    task = %task_id,
                    previous = prev,
                    uploaded_bytes,
                    "dropping regressing progress event"
                );
                return false;
            }
            last.insert(task_id.to_string(), uploaded_bytes);
        }

        let callbacks: Vec<ProgressCallback> = {
            let subs = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            subs.per_task
                .get(task_id)
                .into_iter()
                .flatten()
                .chain(subs.global.iter())
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        let event = ProgressEvent {
            task_id: task_id.to_string(),
            uploaded_bytes,
            total_bytes,
        };
        trace!(task = %task_id, uploaded_bytes, total_bytes, "progress");
        for cb in callbacks {
            cb(&event);
        }
        true
    }

    /// Last byte count delivered for a task.
    pub fn last_emitted(&self, task_id: &str) -> Option<u64> {
        self.last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .copied()
    }

    /// Forgets a retired task: its per-task subscribers and its monotonic
    /// floor, so a later task reusing the identity starts from zero.
    pub fn reset(&self, task_id: &str) {
        self.last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .per_task
            .remove(task_id);
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<ProgressEvent>>>, impl Fn(&ProgressEvent) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |e: &ProgressEvent| sink.lock().unwrap().push(e.clone()))
    }

    #[test]
    fn per_task_subscription_only_sees_its_task() {
        let reporter = ProgressReporter::new();
        let (seen, cb) = recorder();
        reporter.subscribe("Videos/a", cb);

        reporter.emit("Videos/a", 10, 100);
        reporter.emit("Videos/b", 20, 100);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].task_id, "Videos/a");
        assert_eq!(seen[0].uploaded_bytes, 10);
    }

    #[test]
    fn global_subscription_sees_everything_in_order() {
        let reporter = ProgressReporter::new();
        let (seen, cb) = recorder();
        reporter.subscribe_all(cb);

        reporter.emit("Videos/a", 10, 100);
        reporter.emit("Videos/b", 20, 100);
        reporter.emit("Videos/a", 30, 100);

        let bytes: Vec<u64> = seen.lock().unwrap().iter().map(|e| e.uploaded_bytes).collect();
        assert_eq!(bytes, vec![10, 20, 30]);
    }

    #[test]
    fn regressing_emit_is_dropped() {
        let reporter = ProgressReporter::new();
        let (seen, cb) = recorder();
        reporter.subscribe("Videos/a", cb);

        assert!(reporter.emit("Videos/a", 50, 100));
        assert!(!reporter.emit("Videos/a", 40, 100));
        assert!(reporter.emit("Videos/a", 50, 100));
        assert!(reporter.emit("Videos/a", 100, 100));

        let bytes: Vec<u64> = seen.lock().unwrap().iter().map(|e| e.uploaded_bytes).collect();
        assert_eq!(bytes, vec![50, 50, 100]);
        assert_eq!(reporter.last_emitted("Videos/a"), Some(100));
    }

    #[test]
    fn reset_clears_floor_and_task_subscribers() {
        let reporter = ProgressReporter::new();
        let (seen, cb) = recorder();
        reporter.subscribe("Videos/a", cb);
        reporter.emit("Videos/a", 80, 100);

        reporter.reset("Videos/a");
        assert_eq!(reporter.last_emitted("Videos/a"), None);
        assert!(reporter.emit("Videos/a", 10, 100));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let reporter = ProgressReporter::new();
        let (seen, cb) = recorder();
        let id = reporter.subscribe_all(cb);
        reporter.emit("Videos/a", 1, 10);
        assert!(reporter.unsubscribe(id));
        assert!(!reporter.unsubscribe(id));
        reporter.emit("Videos/a", 2, 10);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn callback_may_subscribe_without_deadlock() {
        let reporter = Arc::new(ProgressReporter::new());
        let r = Arc::clone(&reporter);
        reporter.subscribe_all(move |e: &ProgressEvent| {
            if e.uploaded_bytes == 1 {
                r.subscribe(&e.task_id, |_| {});
            }
        });
        reporter.emit("Videos/a", 1, 10);
        reporter.emit("Videos/a", 2, 10);
    }

    #[test]
    fn fraction_of_empty_asset() {
        let e = ProgressEvent {
            task_id: "x".into(),
            uploaded_bytes: 0,
            total_bytes: 0,
        };
        assert!((e.fraction() - 1.0).abs() < f64::EPSILON);
    }
}

//! Recorded, manually fired tasks for driving the manager in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{RecurringTask, RecurringTaskFactory, ScheduleKind, TaskCallback};

/// A task that never fires on its own. Tests call [`FakeRecurringTask::fire`]
/// and observe the reported results.
pub struct FakeRecurringTask {
    name: String,
    kind: ScheduleKind,
    callback: TaskCallback,
    running: AtomicBool,
    immediate_requests: AtomicUsize,
    reschedules: AtomicUsize,
    results: Mutex<Vec<bool>>,
    result_tx: mpsc::UnboundedSender<bool>,
    result_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<bool>>,
}

impl FakeRecurringTask {
    pub fn new(name: &str, kind: ScheduleKind, callback: TaskCallback) -> Self {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            kind,
            callback,
            running: AtomicBool::new(false),
            immediate_requests: AtomicUsize::new(0),
            reschedules: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
            result_tx,
            result_rx: tokio::sync::Mutex::new(result_rx),
        }
    }

    pub fn kind(&self) -> &ScheduleKind {
        &self.kind
    }

    /// Invoke the owner's callback as if the timer had fired.
    pub fn fire(&self) {
        (self.callback)();
    }

    pub fn immediate_request_count(&self) -> usize {
        self.immediate_requests.load(Ordering::SeqCst)
    }

    pub fn reschedule_count(&self) -> usize {
        self.reschedules.load(Ordering::SeqCst)
    }

    pub fn handled_results(&self) -> Vec<bool> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Wait for the next `handle_result` call.
    pub async fn next_result(&self, timeout: Duration) -> Option<bool> {
        let mut rx = self.result_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

impl RecurringTask for FakeRecurringTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn make_immediate_request(&self) {
        self.immediate_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_result(&self, success: bool) {
        if let Ok(mut results) = self.results.lock() {
            results.push(success);
        }
        let _ = self.result_tx.send(success);
    }

    fn reschedule(&self) {
        self.reschedules.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out [`FakeRecurringTask`]s and keeps them by name.
#[derive(Default)]
pub struct FakeRecurringTaskFactory {
    tasks: Mutex<HashMap<String, Arc<FakeRecurringTask>>>,
}

impl FakeRecurringTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, name: &str) -> Option<Arc<FakeRecurringTask>> {
        self.tasks.lock().ok()?.get(name).cloned()
    }
}

impl RecurringTaskFactory for FakeRecurringTaskFactory {
    fn create(
        &self,
        name: &str,
        _pref_key: &str,
        kind: ScheduleKind,
        callback: TaskCallback,
    ) -> Arc<dyn RecurringTask> {
        let task = Arc::new(FakeRecurringTask::new(name, kind, callback));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(name.to_string(), task.clone());
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_task_records_interactions() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let factory = FakeRecurringTaskFactory::new();
        let task = factory.create(
            "upload",
            "unused",
            ScheduleKind::OnDemand,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        task.start();
        task.make_immediate_request();
        task.handle_result(false);

        let fake = factory.task("upload").unwrap();
        fake.fire();
        assert!(fake.is_running());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(fake.immediate_request_count(), 1);
        assert_eq!(fake.next_result(Duration::from_millis(10)).await, Some(false));
        assert_eq!(fake.handled_results(), vec![false]);
        assert!(factory.task("download").is_none());
    }
}

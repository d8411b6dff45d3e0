use sharing_common::{log_debug, log_error, log_info, log_warn, Component, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{
    time_until_next_request, RecurringTask, RecurringTaskFactory, RetryPolicy, ScheduleKind,
    SchedulerState, TaskCallback,
};
use crate::clock::Clock;
use crate::error::CertificateError;
use crate::storage::PreferenceStore;

/// [`RecurringTask`] driven by a tokio timer.
///
/// At most one timer is armed at a time; rescheduling aborts the previous one.
/// The timer task holds a weak reference, so dropping the scheduler cancels
/// any pending request.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    name: String,
    pref_key: String,
    kind: ScheduleKind,
    retry: RetryPolicy,
    preferences: Arc<dyn PreferenceStore>,
    clock: Arc<dyn Clock>,
    callback: TaskCallback,
    running: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    logger: Arc<Logger>,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        pref_key: &str,
        kind: ScheduleKind,
        retry: RetryPolicy,
        preferences: Arc<dyn PreferenceStore>,
        clock: Arc<dyn Clock>,
        callback: TaskCallback,
        logger: Arc<Logger>,
    ) -> Self {
        let logger = Arc::new(
            logger
                .with_component(Component::Scheduler)
                .with_operation(name),
        );
        let inner = Arc::new(SchedulerInner {
            name: name.to_string(),
            pref_key: pref_key.to_string(),
            kind,
            retry,
            preferences,
            clock,
            callback,
            running: AtomicBool::new(false),
            timer: Mutex::new(None),
            logger,
        });

        let mut state = inner.load_state();
        if state.recover_interrupted_request() {
            log_info!(
                inner.logger,
                "Request was interrupted before its result was recorded; re-issuing"
            );
            inner.save_state(&state);
        }
        Self { inner }
    }

    /// Snapshot of the persisted state.
    pub fn state(&self) -> SchedulerState {
        self.inner.load_state()
    }

    pub fn time_until_next_request(&self) -> Option<Duration> {
        self.inner.time_until_next_request()
    }
}

impl SchedulerInner {
    fn load_state(&self) -> SchedulerState {
        match self.preferences.get(&self.pref_key) {
            None => SchedulerState::default(),
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                log_warn!(self.logger, "Discarding undecodable scheduler state: {e}");
                SchedulerState::default()
            }),
        }
    }

    fn save_state(&self, state: &SchedulerState) {
        let result = serde_json::to_value(state)
            .map_err(CertificateError::from)
            .and_then(|value| self.preferences.set(&self.pref_key, value));
        if let Err(e) = result {
            log_error!(self.logger, "Failed to persist scheduler state: {e}");
        }
    }

    fn update_state(&self, mutate: impl FnOnce(&mut SchedulerState)) -> SchedulerState {
        let mut state = self.load_state();
        mutate(&mut state);
        self.save_state(&state);
        state
    }

    fn time_until_next_request(&self) -> Option<Duration> {
        time_until_next_request(
            &self.load_state(),
            &self.kind,
            self.clock.now(),
            self.running.load(Ordering::SeqCst),
            &self.retry,
        )
    }

    fn cancel_timer(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }

    fn reschedule(self: &Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.cancel_timer();

        let Some(delay) = self.time_until_next_request() else {
            log_debug!(self.logger, "No request scheduled");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log_error!(self.logger, "Cannot arm timer outside a tokio runtime");
            return;
        };

        log_debug!(self.logger, "Next request in {:?}", delay);
        let weak: Weak<SchedulerInner> = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_fired();
            }
        });
        if let Ok(mut timer) = self.timer.lock() {
            *timer = Some(handle);
        }
    }

    fn on_timer_fired(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            timer.take();
        }
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.update_state(|state| {
            state.waiting_for_result = true;
            state.pending_immediate_request = false;
        });
        log_debug!(self.logger, "Request fired");
        (self.callback)();
    }

    fn log_state(&self) {
        let state = self.load_state();
        log_debug!(
            self.logger,
            "State: last_attempt={:?} last_success={:?} failures={} pending={} waiting={} next={:?}",
            state.last_attempt(),
            state.last_success(),
            state.consecutive_failures,
            state.pending_immediate_request,
            state.waiting_for_result,
            self.time_until_next_request()
        );
    }
}

impl RecurringTask for TaskScheduler {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log_info!(self.inner.logger, "Starting scheduler");
        // A request that fired before the last stop never gets its result.
        let mut state = self.inner.load_state();
        if state.recover_interrupted_request() {
            log_info!(
                self.inner.logger,
                "Request fired before the scheduler stopped; re-issuing"
            );
            self.inner.save_state(&state);
        }
        self.inner.reschedule();
        self.inner.log_state();
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log_info!(self.inner.logger, "Stopping scheduler");
        self.inner.cancel_timer();
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn make_immediate_request(&self) {
        self.inner.cancel_timer();
        self.inner
            .update_state(|state| state.pending_immediate_request = true);
        self.inner.reschedule();
    }

    fn handle_result(&self, success: bool) {
        let now = self.inner.clock.now();
        self.inner
            .update_state(|state| state.record_result(success, now));
        log_info!(
            self.inner.logger,
            "Latest attempt {}",
            if success { "succeeded" } else { "failed" }
        );
        self.inner.reschedule();
        self.inner.log_state();
    }

    fn reschedule(&self) {
        self.inner.reschedule();
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.inner.cancel_timer();
    }
}

/// Builds [`TaskScheduler`]s sharing one preference store, clock and retry
/// policy.
pub struct TaskSchedulerFactory {
    preferences: Arc<dyn PreferenceStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    logger: Arc<Logger>,
}

impl TaskSchedulerFactory {
    pub fn new(
        preferences: Arc<dyn PreferenceStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            preferences,
            clock,
            retry,
            logger,
        }
    }
}

impl RecurringTaskFactory for TaskSchedulerFactory {
    fn create(
        &self,
        name: &str,
        pref_key: &str,
        kind: ScheduleKind,
        callback: TaskCallback,
    ) -> Arc<dyn RecurringTask> {
        Arc::new(TaskScheduler::new(
            name,
            pref_key,
            kind,
            self.retry,
            self.preferences.clone(),
            self.clock.clone(),
            callback,
            self.logger.clone(),
        ))
    }
}

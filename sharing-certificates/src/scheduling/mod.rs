//! Recurring task scheduling for certificate rotation, upload and download.
//!
//! Each task persists its progress (last attempt, last success, consecutive
//! failures, pending/waiting flags) in the preference store, so backoff and
//! outstanding requests survive restarts. When the next request is due is a
//! pure function of that state, [`time_until_next_request`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::CertificateManagerConfig;
use crate::validity::{from_unix_nanos, to_unix_nanos};

pub mod fake;
pub mod task_scheduler;

pub use fake::{FakeRecurringTask, FakeRecurringTaskFactory};
pub use task_scheduler::{TaskScheduler, TaskSchedulerFactory};

/// Invoked when a task's request fires. The owner performs the work and
/// reports back through [`RecurringTask::handle_result`].
pub type TaskCallback = Arc<dyn Fn() + Send + Sync>;

/// Computes the next expiration-driven request time; `None` means nothing
/// is scheduled.
pub type ExpirationTimeFn = Arc<dyn Fn() -> Option<SystemTime> + Send + Sync>;

pub trait RecurringTask: Send + Sync {
    fn name(&self) -> &str;
    /// Idempotent.
    fn start(&self);
    /// Idempotent; cancels any armed timer.
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// Request the task as soon as possible, bypassing backoff.
    fn make_immediate_request(&self);
    /// Record the outcome of the request that last fired and reschedule.
    fn handle_result(&self, success: bool);
    /// Recompute the timer from the persisted state.
    fn reschedule(&self);
}

/// Creates the tasks owned by the certificate manager.
pub trait RecurringTaskFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        pref_key: &str,
        kind: ScheduleKind,
        callback: TaskCallback,
    ) -> Arc<dyn RecurringTask>;
}

#[derive(Clone)]
pub enum ScheduleKind {
    /// Fires at the time returned by the callback.
    Expiration(ExpirationTimeFn),
    /// Fires only on [`RecurringTask::make_immediate_request`] and retries.
    OnDemand,
    /// Fires `period` after the last success, immediately if never succeeded.
    Periodic(Duration),
}

impl fmt::Debug for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleKind::Expiration(_) => write!(f, "Expiration"),
            ScheduleKind::OnDemand => write!(f, "OnDemand"),
            ScheduleKind::Periodic(period) => write!(f, "Periodic({period:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^(failures - 1))`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl From<&CertificateManagerConfig> for RetryPolicy {
    fn from(config: &CertificateManagerConfig) -> Self {
        Self {
            base_delay: config.scheduler_base_retry_delay,
            max_delay: config.scheduler_max_retry_delay,
        }
    }
}

/// Persisted per-task progress. Times are unix nanos.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    pub last_attempt_nanos: Option<i64>,
    pub last_success_nanos: Option<i64>,
    pub consecutive_failures: u32,
    pub pending_immediate_request: bool,
    pub waiting_for_result: bool,
}

impl SchedulerState {
    pub fn last_attempt(&self) -> Option<SystemTime> {
        self.last_attempt_nanos.map(from_unix_nanos)
    }

    pub fn last_success(&self) -> Option<SystemTime> {
        self.last_success_nanos.map(from_unix_nanos)
    }

    pub fn record_result(&mut self, success: bool, now: SystemTime) {
        let now = to_unix_nanos(now);
        self.last_attempt_nanos = Some(now);
        if success {
            self.last_success_nanos = Some(now);
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.waiting_for_result = false;
    }

    /// A request that was in flight when the process stopped is re-issued.
    pub fn recover_interrupted_request(&mut self) -> bool {
        if !self.waiting_for_result {
            return false;
        }
        self.waiting_for_result = false;
        self.pending_immediate_request = true;
        true
    }
}

fn until(now: SystemTime, target: SystemTime) -> Duration {
    target.duration_since(now).unwrap_or(Duration::ZERO)
}

/// Delay before the next request, or `None` when nothing should fire.
pub fn time_until_next_request(
    state: &SchedulerState,
    kind: &ScheduleKind,
    now: SystemTime,
    is_running: bool,
    retry: &RetryPolicy,
) -> Option<Duration> {
    if !is_running || state.waiting_for_result {
        return None;
    }
    if state.pending_immediate_request {
        return Some(Duration::ZERO);
    }

    if state.consecutive_failures > 0 {
        let delay = retry.delay_for(state.consecutive_failures);
        let elapsed = state
            .last_attempt()
            .and_then(|attempt| now.duration_since(attempt).ok())
            .unwrap_or(Duration::ZERO);
        return Some(delay.saturating_sub(elapsed));
    }

    match kind {
        ScheduleKind::Expiration(next_time) => next_time().map(|t| until(now, t)),
        ScheduleKind::OnDemand => None,
        ScheduleKind::Periodic(period) => Some(match state.last_success() {
            Some(last_success) => until(now, last_success + *period),
            None => Duration::ZERO,
        }),
    }
}

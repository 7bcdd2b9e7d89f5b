//! Background job scheduling and spin backoff used by the page cache.

#![forbid(unsafe_code)]

use std::hint;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::Result;

/// Work item run by a recurring job.
pub type Job = Arc<dyn Fn() + Send + Sync>;

/// Schedules recurring background work such as the eviction sweep.
pub trait JobScheduler: Send + Sync {
    /// Runs `job` every `period` until cancelled, and additionally whenever triggered.
    fn schedule_recurring(
        &self,
        name: &str,
        period: Duration,
        job: Job,
    ) -> Result<Box<dyn JobHandle>>;
}

/// Control handle for a scheduled job.
pub trait JobHandle: Send + Sync {
    /// Asks the job to run as soon as possible.
    fn trigger(&self);
    /// Stops the job and waits for an in-flight run to finish.
    fn cancel(&self);
}

/// Scheduler that gives every recurring job its own named thread.
#[derive(Default, Clone, Copy, Debug)]
pub struct ThreadJobScheduler;

impl ThreadJobScheduler {
    /// Creates a scheduler.
    pub fn new() -> Self {
        Self
    }
}

#[derive(Default)]
struct JobState {
    triggered: bool,
    cancelled: bool,
}

struct JobControl {
    state: Mutex<JobState>,
    wakeup: Condvar,
}

struct ThreadJob {
    control: Arc<JobControl>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
}

impl JobScheduler for ThreadJobScheduler {
    fn schedule_recurring(
        &self,
        name: &str,
        period: Duration,
        job: Job,
    ) -> Result<Box<dyn JobHandle>> {
        let control = Arc::new(JobControl {
            state: Mutex::new(JobState::default()),
            wakeup: Condvar::new(),
        });
        let worker_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker_control, period, job))?;
        debug!(job = name, period_ms = period.as_millis() as u64, "scheduler.job.started");
        Ok(Box::new(ThreadJob {
            control,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
            name: name.to_string(),
        }))
    }
}

fn worker_loop(control: &JobControl, period: Duration, job: Job) {
    loop {
        {
            let mut state = control.state.lock();
            if !state.triggered && !state.cancelled {
                control.wakeup.wait_for(&mut state, period);
            }
            if state.cancelled {
                break;
            }
            state.triggered = false;
        }
        job();
    }
}

impl JobHandle for ThreadJob {
    fn trigger(&self) {
        let mut state = self.control.state.lock();
        if !state.triggered {
            state.triggered = true;
            self.control.wakeup.notify_one();
        }
    }

    fn cancel(&self) {
        {
            let mut state = self.control.state.lock();
            state.cancelled = true;
            self.control.wakeup.notify_one();
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(job = %self.name, "scheduler.job.panicked");
            }
            debug!(job = %self.name, "scheduler.job.stopped");
        }
    }
}

impl Drop for ThreadJob {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Exponential spin that degrades into yielding the thread.
#[derive(Default, Debug)]
pub struct Backoff {
    step: u32,
}

const SPIN_LIMIT: u32 = 6;

impl Backoff {
    /// Creates a fresh backoff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits a little longer than the previous call.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

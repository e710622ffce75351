//! The control context.
//!
//! All mutation of download queues, package slots and content caches happens
//! on the thread that created the [`Scheduler`]. Work finishing elsewhere is
//! handed back with [`Scheduler::post`] and runs on the next [`Scheduler::pump`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, warn};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct SchedulerInner {
    owner: ThreadId,
    interval: Duration,
    queue: Mutex<VecDeque<Task>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl Scheduler {
    /// Creates a scheduler owned by the calling thread.
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                owner: thread::current().id(),
                interval,
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn is_control_thread(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    /// Queues `task` for the next pump. Callable from any thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queue.lock().push_back(Box::new(task));
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Runs the tasks queued before this call. Tasks posted while pumping
    /// wait for the next pump. Returns how many tasks ran.
    pub fn pump(&self) -> usize {
        if !self.is_control_thread() {
            warn!("pump called off the control context, ignored");
            return 0;
        }

        let batch: Vec<Task> = {
            let mut queue = self.inner.queue.lock();
            queue.drain(..).collect()
        };

        let count = batch.len();
        for task in batch {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("scheduled task failed: {message}");
            }
        }
        count
    }

    /// Pumps until `predicate` holds, sleeping briefly between rounds.
    pub fn wait_until(&self, mut predicate: impl FnMut() -> bool) {
        while !predicate() {
            self.pump();
            thread::sleep(self.inner.interval);
        }
    }

    /// Like [`Scheduler::wait_until`] but gives up after `timeout`.
    /// Returns whether the predicate was satisfied.
    pub fn wait_until_timeout(
        &self,
        mut predicate: impl FnMut() -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.pump();
            thread::sleep(self.inner.interval);
        }
    }
}

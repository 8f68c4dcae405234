use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, span, trace, Level};

use crate::pool::{Job, PoolShared};

enum SlotState {
    /// listed (or about to be listed) in the pool's idle list, waiting for work
    Idle,
    /// work was handed over, but the thread did not pick it up yet
    Assigned(Job),
    Running,
    /// the thread terminated or is about to - a slot never leaves this state
    Expired,
}

/// A single pool thread. All state transitions happen under the slot's mutex, so handing work
///  to a slot and the slot expiring are mutually exclusive: [PoolSlot::issue] either succeeds
///  while the thread is still alive, or it observes `Expired` and gives the job back.
///
/// Lock order is pool (idle list) before slot; the slot never calls into the pool while holding
///  its own lock.
pub(crate) struct PoolSlot {
    pub(crate) id: u64,
    state: Mutex<SlotState>,
    work_arrived: Condvar,
}

impl PoolSlot {
    pub(crate) fn new(id: u64) -> PoolSlot {
        PoolSlot {
            id,
            state: Mutex::new(SlotState::Running),
            work_arrived: Condvar::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_expired(id: u64) -> PoolSlot {
        PoolSlot {
            id,
            state: Mutex::new(SlotState::Expired),
            work_arrived: Condvar::new(),
        }
    }

    pub(crate) fn issue(&self, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Idle => {
                trace!("issue(): reusing pool thread #{}", self.id);
                *state = SlotState::Assigned(job);
                self.work_arrived.notify_one();
                Ok(())
            }
            SlotState::Expired => {
                debug!("issue(): pool thread #{} has expired", self.id);
                Err(job)
            }
            SlotState::Assigned(_) | SlotState::Running => {
                error!("tried to issue work to pool thread #{} which is not idle - this is a bug", self.id);
                Err(job)
            }
        }
    }

    /// Wakes the thread if it is idle, causing it to terminate. Returns `false` if the slot was
    ///  busy or already gone.
    pub(crate) fn expire_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if let SlotState::Idle = &*state {
            *state = SlotState::Expired;
            self.work_arrived.notify_one();
            true
        }
        else {
            false
        }
    }

    pub(crate) fn run(self: Arc<Self>, pool: Arc<PoolShared>, first_job: Job) {
        let mut next = Some(first_job);

        while let Some(job) = next.take() {
            if !self.execute(&pool, job) {
                break;
            }
            next = self.await_work(&pool);
        }

        pool.thread_gone(self.id);
    }

    /// returns `false` if the job failed, i.e. the thread must not continue
    fn execute(&self, pool: &PoolShared, job: Job) -> bool {
        let span = span!(Level::DEBUG, "pool_work", task = job.name.as_str(), thread = self.id);
        let _entered = span.enter();

        trace!("starting work");
        let failure = match catch_unwind(AssertUnwindSafe(job.work)) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        match failure {
            None => {
                trace!("work completed");
                true
            }
            Some(msg) => {
                error!("caught failure in pool thread #{} running {}: {}", self.id, job.name, msg);
                *self.state.lock() = SlotState::Expired;
                pool.fault_handler.on_fatal_fault(&job.name, &msg);
                false
            }
        }
    }

    fn await_work(self: &Arc<Self>, pool: &PoolShared) -> Option<Job> {
        *self.state.lock() = SlotState::Idle;
        pool.push_idle(self.clone());

        let deadline = Instant::now() + pool.idle_timeout;
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Running) {
                SlotState::Assigned(job) => {
                    return Some(job);
                }
                SlotState::Idle => {
                    if Instant::now() >= deadline {
                        *state = SlotState::Expired;
                        drop(state);
                        debug!("pool thread #{} expired after idle timeout", self.id);
                        pool.remove_idle(self.id);
                        return None;
                    }
                    *state = SlotState::Idle;
                    let _ = self.work_arrived.wait_until(&mut state, deadline);
                }
                SlotState::Expired | SlotState::Running => {
                    *state = SlotState::Expired;
                    debug!("pool thread #{} was drained", self.id);
                    return None;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    }
    else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    }
    else {
        "panic with non-string payload".to_string()
    }
}

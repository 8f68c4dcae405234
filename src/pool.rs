//! A process-wide pool of reusable worker threads.
//!
//! Threads are created on demand and never bounded in number: tasks that submit further tasks
//!  and wait for their completion would otherwise be able to deadlock the pool. Idle threads
//!  are reused in LIFO order (favoring warm threads) and terminate after an idle timeout, so the
//!  pool drains to zero threads when there is no work.
//!
//! A failure escaping a unit of work (an `Err` or a panic) is treated as an internal consistency
//!  failure: it is logged and handed to the pool's [FaultHandler], which terminates the process
//!  by default. Tasks that want to report errors to a caller use [WorkerPool::spawn_task].

mod slot;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::pool::slot::PoolSlot;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Called when a unit of work fails. The worker thread terminates after this returns.
#[cfg_attr(test, automock)]
pub trait FaultHandler: Send + Sync + 'static {
    fn on_fatal_fault(&self, task_name: &str, message: &str);
}

/// The default policy: a worker crashing mid-task leaves shared state (routing tables,
///  connection state) in an unknown condition, so the process exits.
pub struct ExitProcess;

impl FaultHandler for ExitProcess {
    fn on_fatal_fault(&self, task_name: &str, message: &str) {
        error!("fatal failure in pool task {}: {} - exiting", task_name, message);
        std::process::exit(1);
    }
}

pub(crate) struct Job {
    name: String,
    work: Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>,
}

pub(crate) struct PoolShared {
    /// LIFO: the most recently idled slot is at the end
    idle: Mutex<Vec<Arc<PoolSlot>>>,
    idle_timeout: Duration,
    fault_handler: Arc<dyn FaultHandler>,
    next_slot_id: AtomicU64,
    live_threads: AtomicUsize,
    max_simultaneous_threads: AtomicUsize,
    threads_created: AtomicU64,
}

impl PoolShared {
    fn push_idle(&self, slot: Arc<PoolSlot>) {
        self.idle.lock().push(slot);
    }

    fn remove_idle(&self, slot_id: u64) {
        self.idle.lock().retain(|s| s.id != slot_id);
    }

    fn thread_gone(&self, slot_id: u64) {
        let now_live = self.live_threads.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!("pool thread #{} terminated, {} threads now", slot_id, now_live);
    }

    fn drain_locked(idle: &mut Vec<Arc<PoolSlot>>) -> usize {
        let mut num_expired = 0;
        for slot in idle.drain(..) {
            if slot.expire_if_idle() {
                num_expired += 1;
            }
        }
        num_expired
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PoolStats {
    pub live_threads: usize,
    pub idle_threads: usize,
    pub max_simultaneous_threads: usize,
    pub threads_created: u64,
}

#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(idle_timeout: Duration, fault_handler: Arc<dyn FaultHandler>) -> WorkerPool {
        WorkerPool {
            shared: Arc::new(PoolShared {
                idle: Default::default(),
                idle_timeout,
                fault_handler,
                next_slot_id: AtomicU64::new(1),
                live_threads: AtomicUsize::new(0),
                max_simultaneous_threads: AtomicUsize::new(0),
                threads_created: AtomicU64::new(0),
            })
        }
    }

    /// The process-wide pool, with the default idle timeout and exiting the process on failed
    ///  work
    pub fn global() -> &'static WorkerPool {
        static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();
        GLOBAL.get_or_init(|| WorkerPool::new(DEFAULT_IDLE_TIMEOUT, Arc::new(ExitProcess)))
    }

    /// Runs `work` on a pool thread, reusing the most recently idled thread if there is one.
    ///
    /// If the handoff to the idle thread fails because that thread expired concurrently, all
    ///  listed idle threads are assumed to be stale: they went idle at similar or earlier times,
    ///  and the one that went idle last has already timed out. The idle list is purged, and a
    ///  new thread is started.
    pub fn submit<F>(&self, name: impl Into<String>, work: F) -> anyhow::Result<()>
    where F: FnOnce() -> anyhow::Result<()> + Send + 'static
    {
        let mut job = Job {
            name: name.into(),
            work: Box::new(work),
        };

        {
            let mut idle = self.shared.idle.lock();
            if let Some(slot) = idle.pop() {
                match slot.issue(job) {
                    Ok(()) => return Ok(()),
                    Err(returned) => {
                        debug!("clearing pool of {} idle threads after failed handoff", idle.len());
                        PoolShared::drain_locked(&mut idle);
                        job = returned;
                    }
                }
            }
        }

        self.start_thread(job)
    }

    /// Runs `work` on a pool thread, delivering its result through the returned handle. Errors
    ///  returned by `work` go to the joiner and are not treated as worker faults.
    pub fn spawn_task<T, F>(&self, name: impl Into<String>, work: F) -> anyhow::Result<TaskHandle<T>>
    where T: Send + 'static,
          F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let name = name.into();
        let (send, recv) = bounded(1);
        self.submit(name.clone(), move || {
            // the joiner may have lost interest, which is fine
            let _ = send.send(work());
            Ok(())
        })?;
        Ok(TaskHandle { name, result: recv })
    }

    /// Wakes and removes all idle threads so they terminate. Threads running work are not
    ///  affected.
    pub fn drain(&self) {
        let mut idle = self.shared.idle.lock();
        let num_expired = PoolShared::drain_locked(&mut idle);
        debug!("drained {} idle pool threads", num_expired);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_threads: self.shared.live_threads.load(Ordering::Acquire),
            idle_threads: self.shared.idle.lock().len(),
            max_simultaneous_threads: self.shared.max_simultaneous_threads.load(Ordering::Acquire),
            threads_created: self.shared.threads_created.load(Ordering::Acquire),
        }
    }

    fn start_thread(&self, job: Job) -> anyhow::Result<()> {
        let id = self.shared.next_slot_id.fetch_add(1, Ordering::AcqRel);
        let slot = Arc::new(PoolSlot::new(id));

        let now_live = self.shared.live_threads.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.max_simultaneous_threads.fetch_max(now_live, Ordering::AcqRel);
        self.shared.threads_created.fetch_add(1, Ordering::AcqRel);
        debug!("new pool thread #{} for {}, {} threads now", id, job.name, now_live);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("pool-{}", id))
            .spawn(move || slot.run(shared, job));

        if let Err(e) = spawned {
            self.shared.live_threads.fetch_sub(1, Ordering::AcqRel);
            return Err(e).context("spawning pool thread");
        }
        Ok(())
    }
}

pub struct TaskHandle<T> {
    name: String,
    result: Receiver<anyhow::Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn join(self) -> anyhow::Result<T> {
        match self.result.recv() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("task {} terminated without a result", self.name)),
        }
    }

    pub fn join_timeout(self, timeout: Duration) -> anyhow::Result<T> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(anyhow!("task {} did not complete within {:?}", self.name, timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("task {} terminated without a result", self.name)),
        }
    }

    /// non-blocking
    pub fn try_join(&self) -> Option<anyhow::Result<T>> {
        let result = self.result.try_recv().ok();
        if result.is_some() {
            trace!("task {} completed", self.name);
        }
        result
    }
}

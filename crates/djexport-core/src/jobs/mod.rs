//! Cancellable, progress-reporting background jobs
//!
//! [`JobRunner`] runs each submitted unit of work on its own named thread
//! and keeps a registry of live jobs. The runner is owned by one thread
//! (the "owner") together with a context value `C` that is not safe to use
//! concurrently, typically the host's library data access layer. Jobs
//! reach that context only through deferred calls, which the owner
//! executes whenever it pumps the runner.
//!
//! ```text
//! ┌──────────────┐  submit(work)   ┌──────────────┐
//! │ Owner thread │ ──────────────► │  job-<id>    │
//! │  (ctx: C)    │                 │  thread      │
//! │              │ ◄────────────── │              │
//! │  pump(ctx)   │  deferred call  │ conn.call(f) │
//! └──────────────┘  (f(&mut C))    └──────────────┘
//! ```
//!
//! Cancellation is cooperative: [`JobHandle::request_cancellation`] only
//! raises a flag the job body is expected to poll.

mod handle;

pub use handle::{Connection, Deferred, JobHandle, JobId, JobResult};

use handle::{DeferredTask, JobState};

use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the pump loops sleep between registry polls
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Job runner errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to spawn job thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Deferred call was dropped before it ran (runner shut down or call panicked)")]
    DeferredCallDropped,

    #[error("Job result was already taken or the job vanished")]
    ResultLost,
}

struct JobEntry {
    handle: JobHandle,
    thread: JoinHandle<()>,
}

/// Runs jobs concurrently with the owner and serializes their access to
/// the owner's context
pub struct JobRunner<C> {
    next_id: AtomicU64,
    registry: Mutex<Vec<JobEntry>>,
    deferred_tx: Sender<DeferredTask<C>>,
    deferred_rx: Receiver<DeferredTask<C>>,
}

impl<C> Default for JobRunner<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> JobRunner<C> {
    pub fn new() -> Self {
        let (deferred_tx, deferred_rx) = channel::unbounded();
        Self {
            next_id: AtomicU64::new(0),
            registry: Mutex::new(Vec::new()),
            deferred_tx,
            deferred_rx,
        }
    }

    /// Start `work` on a dedicated thread
    ///
    /// The returned handle can be cloned freely; the [`JobResult`] yields
    /// the work's return value, or [`JobError::Panicked`] if it panicked.
    pub fn submit<F, R>(
        &self,
        name: impl Into<String>,
        work: F,
    ) -> Result<(JobHandle, JobResult<R>), JobError>
    where
        C: 'static,
        F: FnOnce(Connection<C>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.reap_finished();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = name.into();
        let state = Arc::new(JobState::new(id, name.clone()));
        let handle = JobHandle::new(state.clone());
        let connection = Connection::new(state.clone(), self.deferred_tx.clone());
        let (result_tx, result_rx) = channel::bounded(1);

        let thread = thread::Builder::new()
            .name(format!("job-{}", id))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(move || work(connection)))
                    .map_err(|payload| JobError::Panicked(panic_message(payload.as_ref())));
                if let Err(e) = &result {
                    log::error!("[jobs] Job {} failed: {}", id, e);
                }
                let _ = result_tx.send(result);
                state.mark_finished();
            })
            .map_err(JobError::Spawn)?;

        log::debug!("[jobs] Submitted job {} ({})", id, name);
        self.lock_registry().push(JobEntry {
            handle: handle.clone(),
            thread,
        });

        Ok((handle.clone(), JobResult::new(result_rx, handle)))
    }

    /// Request cancellation of one job
    pub fn cancel(&self, handle: &JobHandle) {
        log::info!("[jobs] Cancellation requested for job {} ({})", handle.id(), handle.name());
        handle.request_cancellation();
    }

    /// Request cancellation of every live job
    pub fn cancel_all(&self) {
        for entry in self.lock_registry().iter() {
            entry.handle.request_cancellation();
        }
    }

    /// Snapshot of the jobs not yet reaped
    pub fn jobs(&self) -> Vec<JobHandle> {
        self.lock_registry().iter().map(|e| e.handle.clone()).collect()
    }

    /// Execute all queued deferred calls against `ctx`, then reap finished
    /// jobs. Returns the number of deferred calls executed.
    pub fn pump(&self, ctx: &mut C) -> usize {
        let mut executed = 0;
        while let Ok(task) = self.deferred_rx.try_recv() {
            run_deferred(task, ctx);
            executed += 1;
        }
        self.reap_finished();
        executed
    }

    /// Pump until `result` is ready and return it
    ///
    /// `on_idle` is invoked whenever nothing happened for a short interval,
    /// which lets a headless host drain progress messages on the same
    /// thread.
    pub fn run_until_complete<R>(
        &self,
        ctx: &mut C,
        result: JobResult<R>,
        mut on_idle: impl FnMut(&mut C),
    ) -> Result<R, JobError> {
        loop {
            channel::select! {
                recv(self.deferred_rx) -> task => {
                    if let Ok(task) = task {
                        run_deferred(task, &mut *ctx);
                    }
                }
                recv(result.rx) -> outcome => {
                    self.reap_finished();
                    return outcome.unwrap_or(Err(JobError::ResultLost));
                }
                default(POLL_INTERVAL) => on_idle(&mut *ctx),
            }
        }
    }

    /// Cancel every live job and keep pumping until all of them have
    /// exited and been joined
    pub fn shutdown(&self, ctx: &mut C) {
        self.cancel_all();
        loop {
            self.pump(ctx);
            if self.lock_registry().is_empty() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        log::info!("[jobs] Runner shut down");
    }

    fn lock_registry(&self) -> MutexGuard<'_, Vec<JobEntry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap_finished(&self) {
        let finished: Vec<JobEntry> = {
            let mut registry = self.lock_registry();
            let (finished, live) = registry.drain(..).partition(|e| e.thread.is_finished());
            *registry = live;
            finished
        };

        for entry in finished {
            if entry.thread.join().is_err() {
                log::warn!("[jobs] Job {} thread exited abnormally", entry.handle.id());
            }
            log::debug!("[jobs] Reaped job {} ({})", entry.handle.id(), entry.handle.name());
        }
    }
}

impl<C> Drop for JobRunner<C> {
    /// Without an owner context, queued deferred calls cannot run; they are
    /// dropped so the jobs waiting on them get an error and can exit.
    fn drop(&mut self) {
        self.cancel_all();
        loop {
            while self.deferred_rx.try_recv().is_ok() {}
            self.reap_finished();
            if self.lock_registry().is_empty() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn run_deferred<C>(task: DeferredTask<C>, ctx: &mut C) {
    if panic::catch_unwind(AssertUnwindSafe(|| task(ctx))).is_err() {
        log::error!("[jobs] Deferred call panicked on the owning context");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

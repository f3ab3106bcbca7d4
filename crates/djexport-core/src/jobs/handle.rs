//! Shared job state and the two views onto it
//!
//! A [`JobHandle`] is what observers hold: it can read the job's name and
//! progress and request cancellation. A [`Connection`] is what the running
//! job holds: it can additionally update name and progress and marshal
//! calls back onto the runner's owning context.

use super::JobError;
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Opaque job identifier, unique per runner
pub type JobId = u64;

/// A closure queued for execution on the owning context
pub(crate) type DeferredTask<C> = Box<dyn FnOnce(&mut C) + Send>;

// ============================================================================
// Shared State
// ============================================================================

/// Mutable state of one job, shared between the job thread and observers
pub(crate) struct JobState {
    id: JobId,
    name: Mutex<String>,
    /// f64 bits, only ever raised
    progress: AtomicU64,
    cancellation_requested: AtomicBool,
    finished: AtomicBool,
}

impl JobState {
    pub(crate) fn new(id: JobId, name: String) -> Self {
        Self {
            id,
            name: Mutex::new(name),
            progress: AtomicU64::new(0f64.to_bits()),
            cancellation_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    fn name(&self) -> String {
        self.name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_name(&self, name: String) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    fn raise_progress(&self, value: f64) {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        let _ = self
            .progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (value > f64::from_bits(bits)).then(|| value.to_bits())
            });
    }

    fn request_cancellation(&self) {
        self.cancellation_requested.store(true, Ordering::SeqCst);
    }

    fn is_cancellation_requested(&self) -> bool {
        self.cancellation_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

// ============================================================================
// Observer Handle
// ============================================================================

/// Cheap, cloneable reference to a submitted job
///
/// Safe to inspect from any thread for as long as anyone holds it, even
/// after the runner has reaped the job.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<JobState>,
}

impl JobHandle {
    pub(crate) fn new(state: Arc<JobState>) -> Self {
        Self { state }
    }

    pub fn id(&self) -> JobId {
        self.state.id
    }

    /// Current display name, as last set by the job
    pub fn name(&self) -> String {
        self.state.name()
    }

    /// Progress fraction in `[0, 1]`, never decreasing
    pub fn progress(&self) -> f64 {
        self.state.progress()
    }

    /// Ask the job to stop at its next checkpoint
    ///
    /// Cooperative only: the job keeps running until it looks at the flag.
    pub fn request_cancellation(&self) {
        self.state.request_cancellation();
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.state.is_cancellation_requested()
    }

    /// True once the job body has returned (or panicked) and its result is
    /// available
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("progress", &self.progress())
            .field("cancellation_requested", &self.is_cancellation_requested())
            .field("finished", &self.is_finished())
            .finish()
    }
}

// ============================================================================
// Job-side Connection
// ============================================================================

/// The running job's view of itself and its channel back to the owner
pub struct Connection<C> {
    state: Arc<JobState>,
    deferred_tx: Sender<DeferredTask<C>>,
}

impl<C> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            deferred_tx: self.deferred_tx.clone(),
        }
    }
}

impl<C> Connection<C> {
    pub(crate) fn new(state: Arc<JobState>, deferred_tx: Sender<DeferredTask<C>>) -> Self {
        Self { state, deferred_tx }
    }

    pub fn name(&self) -> String {
        self.state.name()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state.set_name(name.into());
    }

    pub fn progress(&self) -> f64 {
        self.state.progress()
    }

    /// Report progress; values are clamped to `[0, 1]` and lower values
    /// than the current one are ignored
    pub fn set_progress(&self, value: f64) {
        self.state.raise_progress(value);
    }

    pub fn cancellation_requested(&self) -> bool {
        self.state.is_cancellation_requested()
    }

    /// Observer handle for this job
    pub fn handle(&self) -> JobHandle {
        JobHandle::new(self.state.clone())
    }

    /// Queue `f` for execution on the runner's owning context
    ///
    /// `f` runs during the owner's next pump, serialized with every other
    /// deferred call. The returned [`Deferred`] resolves once it has run.
    pub fn run_sync<F, R>(&self, f: F) -> Deferred<R>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = tokio::sync::oneshot::channel();
        let task: DeferredTask<C> = Box::new(move |ctx| {
            let _ = reply.send(f(ctx));
        });
        if self.deferred_tx.send(task).is_err() {
            // The task and its reply sender are dropped here, so the
            // Deferred resolves to an error instead of blocking.
            log::warn!("[jobs] Job {} issued a deferred call after its runner closed", self.state.id);
        }
        Deferred { rx }
    }

    /// Run `f` on the owning context and block until it returns
    pub fn call<F, R>(&self, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_sync(f).wait()
    }
}

/// Pending result of a deferred call
pub struct Deferred<R> {
    rx: tokio::sync::oneshot::Receiver<R>,
}

impl<R> Deferred<R> {
    /// Block the calling job thread until the owner has executed the call
    ///
    /// Must not be called from the owning context itself: that context is
    /// the one that has to run the call.
    pub fn wait(self) -> Result<R, JobError> {
        self.rx.blocking_recv().map_err(|_| JobError::DeferredCallDropped)
    }
}

// ============================================================================
// Completion Handle
// ============================================================================

/// One-shot completion handle for a submitted job
pub struct JobResult<R> {
    pub(crate) rx: Receiver<Result<R, JobError>>,
    handle: JobHandle,
}

impl<R> JobResult<R> {
    pub(crate) fn new(rx: Receiver<Result<R, JobError>>, handle: JobHandle) -> Self {
        Self { rx, handle }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Take the result if the job has completed
    pub fn try_take(&self) -> Option<Result<R, JobError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(JobError::ResultLost)),
        }
    }

    /// Block until the job completes, without pumping deferred calls
    ///
    /// Only safe for jobs that never issue deferred calls; otherwise use
    /// [`super::JobRunner::run_until_complete`] on the owning thread.
    pub fn wait(self) -> Result<R, JobError> {
        self.rx.recv().unwrap_or(Err(JobError::ResultLost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let state = JobState::new(1, "job".to_string());
        state.raise_progress(0.4);
        state.raise_progress(0.2);
        assert_eq!(state.progress(), 0.4);
        state.raise_progress(7.0);
        assert_eq!(state.progress(), 1.0);
        state.raise_progress(f64::NAN);
        assert_eq!(state.progress(), 1.0);
    }

    #[test]
    fn test_handle_and_connection_share_state() {
        let (tx, _rx) = crossbeam::channel::unbounded::<DeferredTask<()>>();
        let conn = Connection::new(Arc::new(JobState::new(5, "first".to_string())), tx);
        let handle = conn.handle();

        conn.set_name("second");
        conn.set_progress(0.5);
        assert_eq!(handle.name(), "second");
        assert_eq!(handle.progress(), 0.5);
        assert_eq!(handle.id(), 5);

        assert!(!conn.cancellation_requested());
        handle.request_cancellation();
        assert!(conn.cancellation_requested());
    }

    #[test]
    fn test_deferred_call_resolves_to_error_when_runner_is_gone() {
        let (tx, rx) = crossbeam::channel::unbounded::<DeferredTask<u32>>();
        drop(rx);
        let conn = Connection::new(Arc::new(JobState::new(1, "orphan".to_string())), tx);
        assert!(matches!(conn.call(|n: &mut u32| *n + 1), Err(JobError::DeferredCallDropped)));
    }

    #[test]
    fn test_deferred_call_runs_on_receiving_side() {
        let (tx, rx) = crossbeam::channel::unbounded::<DeferredTask<u32>>();
        let conn = Connection::new(Arc::new(JobState::new(1, "job".to_string())), tx);
        let deferred = conn.run_sync(|n: &mut u32| {
            *n += 1;
            *n * 10
        });

        let mut ctx = 4u32;
        let task = rx.try_recv().unwrap();
        task(&mut ctx);

        assert_eq!(ctx, 5);
        assert_eq!(deferred.wait().unwrap(), 50);
    }
}

//! Hand-off between the analysis subsystem and the export pipeline
//!
//! Analysis completes tracks in whatever order it likes. Producers push
//! `TrackDone` events and eventually assert that nothing more is pending;
//! the pipeline pulls them one at a time.

use crate::types::TrackId;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One notification from the analysis subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisEvent {
    /// Analysis results for this track are available
    TrackDone(TrackId),
    /// No further events will arrive
    AllDone,
}

/// Requests analysis for a set of tracks
///
/// Implementations report completion through the queue they are handed,
/// from any thread, in any order, and call
/// [`AnalysisCompletionQueue::notify_all_done`] once nothing is pending.
pub trait AnalysisRequester: Send + Sync {
    fn request_analysis(&self, tracks: &BTreeSet<TrackId>, completion: AnalysisCompletionQueue);
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<TrackId>,
    all_done: bool,
}

/// Multi-producer, single-consumer queue of [`AnalysisEvent`]s
///
/// Clones share the same queue. `TrackDone` events queued before the
/// `AllDone` assertion are still delivered, in arrival order, before the
/// consumer sees `AllDone`.
#[derive(Clone, Default)]
pub struct AnalysisCompletionQueue {
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

impl AnalysisCompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: analysis for `track` finished
    pub fn notify_done(&self, track: TrackId) {
        let mut state = self.lock();
        if state.all_done {
            log::warn!("[analysis] TrackDone({}) arrived after AllDone, ignoring", track);
            return;
        }
        state.pending.push_back(track);
        self.inner.1.notify_one();
    }

    /// Producer: nothing more is pending. Idempotent.
    pub fn notify_all_done(&self) {
        let mut state = self.lock();
        state.all_done = true;
        self.inner.1.notify_all();
    }

    /// Consumer: block until the next event is available
    pub fn next(&self) -> AnalysisEvent {
        let mut state = self.lock();
        loop {
            if let Some(event) = Self::take(&mut state) {
                return event;
            }
            state = self.inner.1.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Consumer: like [`next`](Self::next) but gives up after `timeout`
    ///
    /// Returns `None` if nothing arrived in time.
    pub fn next_timeout(&self, timeout: Duration) -> Option<AnalysisEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(event) = Self::take(&mut state) {
                return Some(event);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .inner
                .1
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of `TrackDone` events waiting to be consumed
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(state: &mut QueueState) -> Option<AnalysisEvent> {
        match state.pending.pop_front() {
            Some(track) => Some(AnalysisEvent::TrackDone(track)),
            None if state.all_done => Some(AnalysisEvent::AllDone),
            None => None,
        }
    }
}

/// Requester for tracks whose analysis results are already available
///
/// Reports every requested track as done, in id order, then `AllDone`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreAnalyzed;

impl AnalysisRequester for PreAnalyzed {
    fn request_analysis(&self, tracks: &BTreeSet<TrackId>, completion: AnalysisCompletionQueue) {
        for &track in tracks {
            completion.notify_done(track);
        }
        completion.notify_all_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_events_arrive_in_order_then_all_done() {
        let queue = AnalysisCompletionQueue::new();
        queue.notify_done(TrackId(2));
        queue.notify_done(TrackId(1));
        queue.notify_all_done();

        assert_eq!(queue.next(), AnalysisEvent::TrackDone(TrackId(2)));
        assert_eq!(queue.next(), AnalysisEvent::TrackDone(TrackId(1)));
        assert_eq!(queue.next(), AnalysisEvent::AllDone);
    }

    #[test]
    fn test_repeated_all_done_never_blocks() {
        let queue = AnalysisCompletionQueue::new();
        queue.notify_all_done();
        queue.notify_all_done();

        assert_eq!(queue.next(), AnalysisEvent::AllDone);
        assert_eq!(queue.next(), AnalysisEvent::AllDone);
        assert_eq!(queue.next_timeout(Duration::ZERO), Some(AnalysisEvent::AllDone));
    }

    #[test]
    fn test_next_wakes_on_notify_from_other_thread() {
        let queue = AnalysisCompletionQueue::new();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.notify_done(TrackId(9));
            producer.notify_all_done();
        });

        assert_eq!(queue.next(), AnalysisEvent::TrackDone(TrackId(9)));
        assert_eq!(queue.next(), AnalysisEvent::AllDone);
        handle.join().unwrap();
    }

    #[test]
    fn test_next_timeout_returns_none_when_idle() {
        let queue = AnalysisCompletionQueue::new();
        let started = Instant::now();
        assert_eq!(queue.next_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_racing_producers_deliver_every_event() {
        let queue = AnalysisCompletionQueue::new();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = queue.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        q.notify_done(TrackId(p * 100 + i));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        queue.notify_all_done();

        let mut seen = BTreeSet::new();
        while let AnalysisEvent::TrackDone(id) = queue.next() {
            seen.insert(id);
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_late_track_done_is_dropped() {
        let queue = AnalysisCompletionQueue::new();
        queue.notify_all_done();
        queue.notify_done(TrackId(1));
        assert!(queue.is_empty());
        assert_eq!(queue.next(), AnalysisEvent::AllDone);
    }

    #[test]
    fn test_pre_analyzed_reports_everything() {
        let queue = AnalysisCompletionQueue::new();
        let tracks: BTreeSet<TrackId> = [TrackId(3), TrackId(1)].into_iter().collect();
        PreAnalyzed.request_analysis(&tracks, queue.clone());

        assert_eq!(queue.next(), AnalysisEvent::TrackDone(TrackId(1)));
        assert_eq!(queue.next(), AnalysisEvent::TrackDone(TrackId(3)));
        assert_eq!(queue.next(), AnalysisEvent::AllDone);
    }
}

//! Analysis Service
//!
//! Background service that checks the media files of the tracks an export
//! asks for and reports each readable one on the export's completion queue.
//!
//! ```text
//! ┌──────────────┐   Analyze    ┌─────────────────┐
//! │ExportPipeline│ ───────────► │ AnalysisService │
//! │              │ ◄─────────── │  (background)   │
//! └──────────────┘  TrackDone   └─────────────────┘
//!                   AllDone
//! ```
//!
//! Unreadable files are never reported; the export lists them as skipped.

use crate::export::{AnalysisCompletionQueue, AnalysisRequester};
use crate::types::TrackId;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use super::messages::{AnalysisReport, ServiceHandle};

// ============================================================================
// Commands
// ============================================================================

/// Commands for the AnalysisService
pub enum AnalysisCommand {
    /// Analyze a batch of tracks, reporting on `completion`
    Analyze {
        tracks: Vec<(TrackId, PathBuf)>,
        completion: AnalysisCompletionQueue,
        reply: Option<tokio::sync::oneshot::Sender<AnalysisReport>>,
    },

    /// Shutdown the service
    Shutdown,
}

// ============================================================================
// Service
// ============================================================================

/// Background service for track analysis
pub struct AnalysisService;

impl AnalysisService {
    /// Spawn the service in a background thread
    pub fn spawn() -> std::io::Result<ServiceHandle<AnalysisCommand>> {
        let (command_tx, command_rx) = channel::unbounded();

        let thread_handle = thread::Builder::new()
            .name("analysis".to_string())
            .spawn(move || Self::run(command_rx))?;

        Ok(ServiceHandle {
            command_tx,
            thread_handle: Some(thread_handle),
        })
    }

    /// Main service loop
    fn run(command_rx: Receiver<AnalysisCommand>) {
        log::info!("AnalysisService started");

        while let Ok(cmd) = command_rx.recv() {
            match cmd {
                AnalysisCommand::Analyze {
                    tracks,
                    completion,
                    reply,
                } => {
                    let report = Self::analyze_batch(tracks, &completion);
                    if let Some(tx) = reply {
                        let _ = tx.send(report);
                    }
                }

                AnalysisCommand::Shutdown => {
                    log::info!("AnalysisService shutting down");
                    break;
                }
            }
        }
    }

    fn analyze_batch(
        tracks: Vec<(TrackId, PathBuf)>,
        completion: &AnalysisCompletionQueue,
    ) -> AnalysisReport {
        let start = Instant::now();
        let total = tracks.len();
        let mut report = AnalysisReport::default();

        for (i, (track_id, path)) in tracks.into_iter().enumerate() {
            log::debug!("Analyzing track {} ({}/{})", track_id, i + 1, total);
            match probe_media_file(&path) {
                Ok(_) => {
                    completion.notify_done(track_id);
                    report.analyzed.push(track_id);
                }
                Err(e) => {
                    log::warn!("Cannot analyze track {} at {:?}: {}", track_id, path, e);
                    report.unreadable.push((track_id, path, e.to_string()));
                }
            }
        }
        completion.notify_all_done();

        log::info!(
            "Analysis complete: {}/{} tracks in {:?}",
            report.analyzed.len(),
            total,
            start.elapsed()
        );
        report
    }
}

/// Check that `path` is a non-empty, readable file and return its size
pub fn probe_media_file(path: &Path) -> std::io::Result<u64> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty file"));
    }
    let mut header = [0u8; 1];
    file.read_exact(&mut header)?;
    Ok(len)
}

// ============================================================================
// Client
// ============================================================================

/// [`AnalysisRequester`] that forwards requests to an [`AnalysisService`]
pub struct AnalysisClient {
    command_tx: Sender<AnalysisCommand>,
    locations: BTreeMap<TrackId, PathBuf>,
}

impl AnalysisClient {
    /// Create a client that resolves track ids through `locations`
    pub fn new(handle: &ServiceHandle<AnalysisCommand>, locations: BTreeMap<TrackId, PathBuf>) -> Self {
        Self {
            command_tx: handle.command_tx.clone(),
            locations,
        }
    }
}

impl AnalysisRequester for AnalysisClient {
    fn request_analysis(&self, tracks: &BTreeSet<TrackId>, completion: AnalysisCompletionQueue) {
        let batch: Vec<(TrackId, PathBuf)> = tracks
            .iter()
            .filter_map(|id| match self.locations.get(id) {
                Some(path) => Some((*id, path.clone())),
                None => {
                    log::warn!("No file location for track {}, it will not be analyzed", id);
                    None
                }
            })
            .collect();

        let cmd = AnalysisCommand::Analyze {
            tracks: batch,
            completion: completion.clone(),
            reply: None,
        };
        if self.command_tx.send(cmd).is_err() {
            log::error!("AnalysisService is not running, no tracks will be analyzed");
            completion.notify_all_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::AnalysisEvent;
    use std::time::Duration;

    fn drain(queue: &AnalysisCompletionQueue) -> Vec<AnalysisEvent> {
        let mut events = Vec::new();
        while let Some(event) = queue.next_timeout(Duration::from_secs(2)) {
            let done = event == AnalysisEvent::AllDone;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn test_unreadable_files_are_never_reported() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.mp3");
        let empty = dir.path().join("empty.mp3");
        std::fs::write(&good, b"ID3").unwrap();
        std::fs::write(&empty, b"").unwrap();

        let mut handle = AnalysisService::spawn().unwrap();
        let queue = AnalysisCompletionQueue::new();
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        handle
            .send(AnalysisCommand::Analyze {
                tracks: vec![
                    (TrackId(1), good),
                    (TrackId(2), empty),
                    (TrackId(3), dir.path().join("missing.mp3")),
                ],
                completion: queue.clone(),
                reply: Some(reply_tx),
            })
            .unwrap();

        let report = reply_rx.blocking_recv().unwrap();
        assert_eq!(report.analyzed, vec![TrackId(1)]);
        assert_eq!(report.unreadable.len(), 2);
        assert_eq!(
            drain(&queue),
            vec![AnalysisEvent::TrackDone(TrackId(1)), AnalysisEvent::AllDone]
        );

        handle.stop(AnalysisCommand::Shutdown);
        assert!(!handle.is_running());
    }

    #[test]
    fn test_client_skips_tracks_without_location() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.flac");
        std::fs::write(&file, b"fLaC").unwrap();

        let mut handle = AnalysisService::spawn().unwrap();
        let client = AnalysisClient::new(&handle, [(TrackId(4), file)].into_iter().collect());
        let queue = AnalysisCompletionQueue::new();
        client.request_analysis(&[TrackId(4), TrackId(5)].into_iter().collect(), queue.clone());

        assert_eq!(
            drain(&queue),
            vec![AnalysisEvent::TrackDone(TrackId(4)), AnalysisEvent::AllDone]
        );
        handle.stop(AnalysisCommand::Shutdown);
    }

    #[test]
    fn test_client_completes_when_service_is_gone() {
        let mut handle = AnalysisService::spawn().unwrap();
        let client = AnalysisClient::new(&handle, BTreeMap::new());
        handle.stop(AnalysisCommand::Shutdown);

        let queue = AnalysisCompletionQueue::new();
        client.request_analysis(&[TrackId(1)].into_iter().collect(), queue.clone());
        assert_eq!(drain(&queue), vec![AnalysisEvent::AllDone]);
    }
}

//! The export state machine
//!
//! One [`ExportPipeline`] drives one export inside a job. Every phase
//! transition and every loop iteration of the track and crate phases is a
//! cancellation checkpoint. Once the pipeline enters `Finalize` it commits
//! regardless of cancellation.

use super::analysis::{AnalysisCompletionQueue, AnalysisEvent, AnalysisRequester};
use super::ids::IdCorrelationMap;
use super::message::ExportProgress;
use super::metadata::TrackMetadata;
use super::{DestinationStore, ExportDestination, FileCopier, WorkSet};
use crate::copier::CopyError;
use crate::db::StoreError;
use crate::jobs::{Connection, JobError};
use crate::library::TrackSource;
use crate::types::{DestTrackId, TrackId};
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Phases, Settings, Outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportPhase {
    ComputeWorkSet,
    SetupDestination,
    ExportTracks,
    ExportCrates,
    Finalize,
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ComputeWorkSet => write!(f, "Computing work set"),
            Self::SetupDestination => write!(f, "Setting up destination"),
            Self::ExportTracks => write!(f, "Exporting tracks"),
            Self::ExportCrates => write!(f, "Exporting crates"),
            Self::Finalize => write!(f, "Finalizing"),
        }
    }
}

/// What to do when a single track cannot be exported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackFailurePolicy {
    /// Record the failure, skip the track and keep going
    #[default]
    Skip,
    /// Fail the whole export
    Abort,
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    /// Crate that receives every exported track; exported crates become
    /// its children. `None` exports crates at the top level.
    pub root_crate_name: Option<String>,
    /// Give up waiting for analysis after this long without any event.
    /// `None` waits forever.
    pub analysis_idle_timeout: Option<Duration>,
    /// How often a pipeline waiting on analysis checks for cancellation
    pub cancel_poll_interval: Duration,
    pub track_failure_policy: TrackFailurePolicy,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            root_crate_name: Some("Exported".to_string()),
            analysis_idle_timeout: Some(Duration::from_secs(600)),
            cancel_poll_interval: Duration::from_millis(100),
            track_failure_policy: TrackFailurePolicy::Skip,
        }
    }
}

/// Export errors
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Nothing to export")]
    NothingToExport,

    #[error("Destination database error: {0}")]
    Store(#[from] StoreError),

    #[error("Copy failed: {0}")]
    Copy(#[from] CopyError),

    #[error("Track {0} is no longer in the library")]
    TrackNotFound(TrackId),

    #[error("Library access failed: {0}")]
    Library(#[from] JobError),

    #[error("Failed to create music directory {path:?}: {source}")]
    MusicDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    /// Errors that concern one track only and fall under the
    /// [`TrackFailurePolicy`]
    pub fn is_track_local(&self) -> bool {
        matches!(self, Self::Copy(_) | Self::TrackNotFound(_))
    }
}

/// What an export did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    pub tracks_exported: usize,
    pub failed_tracks: Vec<(TrackId, String)>,
    /// Tracks analysis never reported
    pub skipped_tracks: Vec<TrackId>,
    pub crates_exported: usize,
    /// Crate memberships dropped because the track was not exported
    pub missing_memberships: usize,
    pub duration: Duration,
}

/// The three mutually exclusive ends of an export
#[derive(Debug, Clone, PartialEq)]
pub enum ExportOutcome {
    Finished(ExportSummary),
    /// Stopped early on request; the summary covers the work done so far
    Cancelled(ExportSummary),
    Failed(String),
}

impl ExportOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn summary(&self) -> Option<&ExportSummary> {
        match self {
            Self::Finished(s) | Self::Cancelled(s) => Some(s),
            Self::Failed(_) => None,
        }
    }
}

/// Steps completed out of a total fixed at construction
///
/// The total counts every track, every crate and the one-off database
/// setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCounter {
    done: usize,
    total: usize,
}

impl ProgressCounter {
    pub fn new(tracks: usize, crates: usize) -> Self {
        Self {
            done: 0,
            total: tracks + crates + 1,
        }
    }

    /// Count one more step and return the new fraction
    pub fn advance(&mut self) -> f64 {
        self.done = (self.done + 1).min(self.total);
        self.fraction()
    }

    pub fn fraction(&self) -> f64 {
        self.done as f64 / self.total as f64
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

enum Stop {
    Cancelled,
    Failed(ExportError),
}

impl From<ExportError> for Stop {
    fn from(e: ExportError) -> Self {
        Stop::Failed(e)
    }
}

impl From<StoreError> for Stop {
    fn from(e: StoreError) -> Self {
        Stop::Failed(e.into())
    }
}

impl From<JobError> for Stop {
    fn from(e: JobError) -> Self {
        Stop::Failed(e.into())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// One export run
pub struct ExportPipeline {
    destination: ExportDestination,
    work_set: WorkSet,
    store: Box<dyn DestinationStore>,
    copier: Arc<dyn FileCopier>,
    analysis: Arc<dyn AnalysisRequester>,
    id_map: Arc<IdCorrelationMap>,
    settings: ExportSettings,
    progress_tx: Option<Sender<ExportProgress>>,
}

impl ExportPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destination: ExportDestination,
        work_set: WorkSet,
        store: Box<dyn DestinationStore>,
        copier: Arc<dyn FileCopier>,
        analysis: Arc<dyn AnalysisRequester>,
        id_map: Arc<IdCorrelationMap>,
        settings: ExportSettings,
        progress_tx: Option<Sender<ExportProgress>>,
    ) -> Self {
        Self {
            destination,
            work_set,
            store,
            copier,
            analysis,
            id_map,
            settings,
            progress_tx,
        }
    }

    /// Run the export to completion on the calling (job) thread
    ///
    /// Library lookups are marshalled onto the runner's owning context via
    /// `conn`.
    pub fn run<C: TrackSource + 'static>(mut self, conn: &Connection<C>) -> ExportOutcome {
        let started = Instant::now();
        let mut summary = ExportSummary::default();
        let result = self.drive(conn, &mut summary);
        summary.duration = started.elapsed();

        let outcome = match result {
            Ok(()) => ExportOutcome::Finished(summary),
            Err(Stop::Cancelled) => ExportOutcome::Cancelled(summary),
            // The owner stops running deferred calls once it shuts a cancelled job down
            Err(Stop::Failed(ExportError::Library(JobError::DeferredCallDropped)))
                if conn.cancellation_requested() =>
            {
                log::info!("[export] Library calls dropped after cancellation was requested");
                ExportOutcome::Cancelled(summary)
            }
            Err(Stop::Failed(e)) => ExportOutcome::Failed(e.to_string()),
        };

        match &outcome {
            ExportOutcome::Finished(s) => {
                log::info!(
                    "[export] Finished: {} tracks, {} crates, {} failed, {} skipped in {:.1}s",
                    s.tracks_exported,
                    s.crates_exported,
                    s.failed_tracks.len(),
                    s.skipped_tracks.len(),
                    s.duration.as_secs_f64()
                );
                self.emit(ExportProgress::Finished {
                    duration: s.duration,
                    tracks_exported: s.tracks_exported,
                    crates_exported: s.crates_exported,
                    failed_tracks: s.failed_tracks.len(),
                });
            }
            ExportOutcome::Cancelled(s) => {
                log::warn!(
                    "[export] Cancelled after {} tracks; the library was only partially exported",
                    s.tracks_exported
                );
                self.emit(ExportProgress::Cancelled);
            }
            ExportOutcome::Failed(reason) => {
                log::error!("[export] Failed: {}", reason);
                self.emit(ExportProgress::Failed {
                    reason: reason.clone(),
                });
            }
        }
        outcome
    }

    fn drive<C: TrackSource + 'static>(
        &mut self,
        conn: &Connection<C>,
        summary: &mut ExportSummary,
    ) -> Result<(), Stop> {
        self.enter(conn, ExportPhase::ComputeWorkSet)?;
        if self.work_set.is_empty() {
            return Err(ExportError::NothingToExport.into());
        }
        let mut counter = ProgressCounter::new(self.work_set.tracks.len(), self.work_set.crates.len());
        self.emit(ExportProgress::Started {
            total_tracks: self.work_set.tracks.len(),
            total_crates: self.work_set.crates.len(),
        });

        self.enter(conn, ExportPhase::SetupDestination)?;
        self.setup_destination()?;
        conn.set_progress(counter.advance());

        self.enter(conn, ExportPhase::ExportTracks)?;
        self.export_tracks(conn, &mut counter, summary)?;

        self.enter(conn, ExportPhase::ExportCrates)?;
        self.export_crates(conn, &mut counter, summary)?;

        self.enter(conn, ExportPhase::Finalize)?;
        self.store.finalize()?;
        conn.set_progress(1.0);
        Ok(())
    }

    fn setup_destination(&mut self) -> Result<(), ExportError> {
        let music_dir = &self.destination.music_dir;
        std::fs::create_dir_all(music_dir).map_err(|source| ExportError::MusicDir {
            path: music_dir.clone(),
            source,
        })?;
        if self.store.exists() {
            log::info!("[export] Merging into existing database at {:?}", self.destination.database_dir);
        }
        self.store.create_or_open()?;
        Ok(())
    }

    fn export_tracks<C: TrackSource + 'static>(
        &mut self,
        conn: &Connection<C>,
        counter: &mut ProgressCounter,
        summary: &mut ExportSummary,
    ) -> Result<(), Stop> {
        let queue = AnalysisCompletionQueue::new();
        self.analysis.request_analysis(&self.work_set.tracks, queue.clone());

        let mut processed = BTreeSet::new();
        let mut exported = BTreeSet::new();
        let mut last_event = Instant::now();

        loop {
            check_cancelled(conn)?;

            let Some(event) = queue.next_timeout(self.settings.cancel_poll_interval) else {
                if let Some(limit) = self.settings.analysis_idle_timeout {
                    if last_event.elapsed() >= limit {
                        log::warn!(
                            "[export] No analysis results for {:?}, continuing without the remaining tracks",
                            limit
                        );
                        break;
                    }
                }
                continue;
            };
            last_event = Instant::now();

            let track_id = match event {
                AnalysisEvent::AllDone => break,
                AnalysisEvent::TrackDone(id) if !self.work_set.tracks.contains(&id) => {
                    log::debug!("[export] Ignoring analysis result for track {} outside this export", id);
                    continue;
                }
                AnalysisEvent::TrackDone(id) => id,
            };

            let first_time = processed.insert(track_id);
            if !first_time {
                log::debug!("[export] Track {} reported twice, re-exporting", track_id);
            }

            match self.export_track(conn, track_id) {
                Ok((dest_id, copied)) => {
                    if exported.insert(track_id) {
                        summary.tracks_exported += 1;
                        if first_time {
                            conn.set_progress(counter.advance());
                        } else {
                            log::info!("[export] Track {} exported after an earlier failure", track_id);
                            summary.failed_tracks.retain(|(id, _)| *id != track_id);
                        }
                        self.emit(ExportProgress::TrackExported {
                            track_id,
                            dest_id,
                            copied,
                            done: counter.done(),
                            total: counter.total(),
                        });
                    }
                }
                Err(e) if e.is_track_local() => {
                    log::warn!("[export] Track {} failed: {}", track_id, e);
                    if self.settings.track_failure_policy == TrackFailurePolicy::Abort {
                        return Err(Stop::Failed(e));
                    }
                    if first_time {
                        summary.failed_tracks.push((track_id, e.to_string()));
                        conn.set_progress(counter.advance());
                        self.emit(ExportProgress::TrackFailed {
                            track_id,
                            error: e.to_string(),
                        });
                    }
                }
                Err(e) => return Err(Stop::Failed(e)),
            }
        }

        summary.skipped_tracks = self.work_set.tracks.difference(&processed).copied().collect();
        if !summary.skipped_tracks.is_empty() {
            log::warn!(
                "[export] Analysis never reported {} tracks, they are not exported: {:?}",
                summary.skipped_tracks.len(),
                summary.skipped_tracks
            );
            self.emit(ExportProgress::TracksSkipped {
                track_ids: summary.skipped_tracks.clone(),
            });
        }
        Ok(())
    }

    /// Copy one track's media file and write its destination record
    fn export_track<C: TrackSource + 'static>(
        &mut self,
        conn: &Connection<C>,
        track_id: TrackId,
    ) -> Result<(DestTrackId, bool), ExportError> {
        let track = conn
            .call(move |library: &mut C| library.track(track_id))?
            .ok_or(ExportError::TrackNotFound(track_id))?;

        let filename = match track.file_extension() {
            Some(ext) => format!("{}.{}", track_id, ext),
            None => track_id.to_string(),
        };
        let destination = self.destination.music_dir.join(&filename);
        let copy = self
            .copier
            .copy_if_stale(&track.location, &destination, &self.destination.database_dir)?;

        let dest_id = self.store.find_or_create_track(&copy.relative_path)?;
        self.store
            .write_track_metadata(dest_id, &TrackMetadata::from_library(&track, &filename))?;
        self.id_map.insert(track_id, dest_id);

        log::debug!("[export] Track {} -> destination {} ({})", track_id, dest_id, copy.relative_path);
        Ok((dest_id, copy.copied))
    }

    fn export_crates<C: TrackSource + 'static>(
        &mut self,
        conn: &Connection<C>,
        counter: &mut ProgressCounter,
        summary: &mut ExportSummary,
    ) -> Result<(), Stop> {
        let root = match self.settings.root_crate_name.clone() {
            Some(name) => {
                let root = self.store.find_or_create_crate(&name, None)?;
                self.store
                    .set_crate_membership(root, &self.id_map.destination_ids())?;
                Some(root)
            }
            None => None,
        };

        let crates: Vec<_> = self.work_set.crates.iter().copied().collect();
        for crate_id in crates {
            check_cancelled(conn)?;

            let (name, members) = conn.call(move |library: &mut C| {
                (library.crate_name(crate_id), library.crate_track_ids(crate_id))
            })?;
            let Some(name) = name else {
                log::warn!("[export] Crate {} disappeared from the library, skipping", crate_id);
                conn.set_progress(counter.advance());
                continue;
            };

            let (dest_tracks, missing) = self.id_map.resolve(&members);
            if !missing.is_empty() {
                log::warn!(
                    "[export] Crate '{}' references {} tracks that were not exported: {:?}",
                    name,
                    missing.len(),
                    missing
                );
                summary.missing_memberships += missing.len();
            }

            let dest_id = self.store.find_or_create_crate(&name, root)?;
            self.store.set_crate_membership(dest_id, &dest_tracks)?;
            summary.crates_exported += 1;
            conn.set_progress(counter.advance());

            self.emit(ExportProgress::CrateExported {
                crate_id,
                dest_id,
                name,
                missing_tracks: missing.len(),
                done: counter.done(),
                total: counter.total(),
            });
        }
        Ok(())
    }

    fn enter<C>(&self, conn: &Connection<C>, phase: ExportPhase) -> Result<(), Stop> {
        check_cancelled(conn)?;
        log::info!("[export] {}", phase);
        conn.set_name(format!("Library export: {}", phase));
        self.emit(ExportProgress::PhaseStarted { phase });
        Ok(())
    }

    fn emit(&self, message: ExportProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(message);
        }
    }
}

fn check_cancelled<C>(conn: &Connection<C>) -> Result<(), Stop> {
    if conn.cancellation_requested() {
        Err(Stop::Cancelled)
    } else {
        Ok(())
    }
}

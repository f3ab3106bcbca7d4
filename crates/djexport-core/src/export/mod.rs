//! Library export pipeline
//!
//! An export copies the media files of a set of tracks into a music
//! directory, writes their metadata into a destination database and then
//! mirrors crate membership. It runs as one job on a
//! [`JobRunner`](crate::jobs::JobRunner):
//!
//! ```text
//! ComputeWorkSet → SetupDestination → ExportTracks → ExportCrates → Finalize
//!        └───────────────┴─────────────────┴──────────────┴──→ Cancelled
//! ```
//!
//! Tracks are exported as the analysis subsystem reports them done
//! ([`AnalysisCompletionQueue`]); each exported track is recorded in the
//! [`IdCorrelationMap`], which the crate phase reads to resolve membership.

mod analysis;
mod exporter;
mod ids;
mod message;
mod metadata;
mod pipeline;

#[cfg(test)]
mod test_support;

pub use analysis::{AnalysisCompletionQueue, AnalysisEvent, AnalysisRequester, PreAnalyzed};
pub use exporter::{ExportJob, LibraryExporter, SubmitError};
pub use ids::IdCorrelationMap;
pub use message::ExportProgress;
pub use metadata::{
    file_modified_ms, normalize_beatgrid, BeatgridMarker, HotCue, PadColor, TrackMetadata,
    HOT_CUE_SLOTS, PAD_COLORS,
};
pub use pipeline::{
    ExportError, ExportOutcome, ExportPhase, ExportPipeline, ExportSettings, ExportSummary,
    ProgressCounter, TrackFailurePolicy,
};

use crate::copier::CopyError;
use crate::db::StoreError;
use crate::library::WorkSetResolver;
use crate::types::{CrateId, DestCrateId, DestTrackId, TrackId};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

// ============================================================================
// Request & Work Set
// ============================================================================

/// Where an export writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDestination {
    /// Directory holding the destination database
    pub database_dir: PathBuf,
    /// Directory the media files are copied into
    pub music_dir: PathBuf,
}

impl ExportDestination {
    /// Destination under `base` using the configured directory names
    pub fn under(base: &Path, database_dir_name: &str, music_dir_name: &str) -> Self {
        Self {
            database_dir: base.join(database_dir_name),
            music_dir: base.join(music_dir_name),
        }
    }
}

/// Which part of the library to export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    WholeLibrary,
    SelectedCrates(BTreeSet<CrateId>),
}

/// One user-initiated export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub destination: Option<ExportDestination>,
    pub scope: ExportScope,
}

/// Tracks and crates one export covers, fixed at submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    pub tracks: BTreeSet<TrackId>,
    pub crates: BTreeSet<CrateId>,
}

impl WorkSet {
    /// Resolve `scope` against the library
    ///
    /// Selected crates without any track are left out.
    pub fn resolve(resolver: &(impl WorkSetResolver + ?Sized), scope: &ExportScope) -> Self {
        match scope {
            ExportScope::WholeLibrary => {
                let tracks = resolver.all_track_ids();
                let crates = resolver.crate_ids_containing(&tracks);
                Self { tracks, crates }
            }
            ExportScope::SelectedCrates(selected) => {
                let tracks = resolver.track_ids_in_crates(selected);
                let crates = resolver
                    .crate_ids_containing(&tracks)
                    .intersection(selected)
                    .copied()
                    .collect();
                Self { tracks, crates }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

// ============================================================================
// Destination Collaborators
// ============================================================================

/// The database an export writes into
///
/// `create_or_open` must be called before any other write; afterwards the
/// store itself acts as the open handle. Nothing is guaranteed to be
/// visible at the final location before `finalize` returns.
pub trait DestinationStore: Send {
    /// Whether a database already exists at the destination
    fn exists(&self) -> bool;

    /// Create the database, or open the existing one for merging
    fn create_or_open(&mut self) -> Result<(), StoreError>;

    /// Track stored under `relative_path`, created if missing
    fn find_or_create_track(&mut self, relative_path: &str) -> Result<DestTrackId, StoreError>;

    fn write_track_metadata(
        &mut self,
        track: DestTrackId,
        metadata: &TrackMetadata,
    ) -> Result<(), StoreError>;

    /// Crate called `name` under `parent`, created if missing
    fn find_or_create_crate(
        &mut self,
        name: &str,
        parent: Option<DestCrateId>,
    ) -> Result<DestCrateId, StoreError>;

    /// Replace the crate's membership with exactly `tracks`
    fn set_crate_membership(
        &mut self,
        crate_id: DestCrateId,
        tracks: &BTreeSet<DestTrackId>,
    ) -> Result<(), StoreError>;

    /// Commit everything written so far to the final location
    fn finalize(&mut self) -> Result<(), StoreError>;
}

/// Result of [`FileCopier::copy_if_stale`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Destination path relative to the directory passed as `relative_to`,
    /// with `/` separators
    pub relative_path: String,
    /// False when the destination was already up to date
    pub copied: bool,
}

/// Copies media files into the destination
pub trait FileCopier: Send + Sync {
    /// Copy `source` to `destination` unless the destination is at least as
    /// new as the source
    fn copy_if_stale(
        &self,
        source: &Path,
        destination: &Path,
        relative_to: &Path,
    ) -> Result<CopyOutcome, CopyError>;
}

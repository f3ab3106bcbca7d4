//! Export progress messages
//!
//! Sent from the export job to whoever holds the receiving end of the
//! progress channel (a dialog, or the CLI's pump loop):
//!
//! Started → PhaseStarted → TrackExported/TrackFailed → ... → CrateExported → Finished/Cancelled/Failed

use super::ExportPhase;
use crate::types::{CrateId, DestCrateId, DestTrackId, TrackId};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ExportProgress {
    /// Work set resolved, job running
    Started {
        total_tracks: usize,
        total_crates: usize,
    },

    /// The pipeline moved to a new phase
    PhaseStarted { phase: ExportPhase },

    /// A track was copied (if needed) and its metadata written
    TrackExported {
        track_id: TrackId,
        dest_id: DestTrackId,
        /// False when the media file was already up to date
        copied: bool,
        /// Steps done out of `total`, database setup included
        done: usize,
        total: usize,
    },

    /// A track could not be exported and was skipped
    TrackFailed { track_id: TrackId, error: String },

    /// Analysis finished without reporting these tracks
    TracksSkipped { track_ids: Vec<TrackId> },

    /// A crate and its membership were written
    CrateExported {
        crate_id: CrateId,
        dest_id: DestCrateId,
        name: String,
        /// Members left out because they were never exported
        missing_tracks: usize,
        done: usize,
        total: usize,
    },

    /// Everything committed
    Finished {
        duration: Duration,
        tracks_exported: usize,
        crates_exported: usize,
        failed_tracks: usize,
    },

    /// Export was cancelled by the user
    Cancelled,

    /// Export aborted with an error
    Failed { reason: String },
}

impl ExportProgress {
    /// Get a human-readable description of this progress message
    pub fn description(&self) -> String {
        match self {
            Self::Started {
                total_tracks,
                total_crates,
            } => format!(
                "Starting export of {} tracks and {} crates",
                total_tracks, total_crates
            ),
            Self::PhaseStarted { phase } => phase.to_string(),
            Self::TrackExported {
                track_id,
                copied,
                done,
                total,
                ..
            } => format!(
                "[{}/{}] Track {}{}",
                done,
                total,
                track_id,
                if *copied { "" } else { " (file up to date)" }
            ),
            Self::TrackFailed { track_id, error } => {
                format!("Failed: track {} - {}", track_id, error)
            }
            Self::TracksSkipped { track_ids } => {
                format!("{} tracks were never analyzed and were skipped", track_ids.len())
            }
            Self::CrateExported {
                name,
                missing_tracks,
                done,
                total,
                ..
            } => {
                if *missing_tracks == 0 {
                    format!("[{}/{}] Crate '{}'", done, total, name)
                } else {
                    format!(
                        "[{}/{}] Crate '{}' ({} tracks missing)",
                        done, total, name, missing_tracks
                    )
                }
            }
            Self::Finished {
                duration,
                tracks_exported,
                crates_exported,
                failed_tracks,
            } => {
                if *failed_tracks == 0 {
                    format!(
                        "Export complete: {} tracks, {} crates in {:.1}s",
                        tracks_exported,
                        crates_exported,
                        duration.as_secs_f64()
                    )
                } else {
                    format!(
                        "Export complete: {} tracks, {} crates, {} failed in {:.1}s",
                        tracks_exported,
                        crates_exported,
                        failed_tracks,
                        duration.as_secs_f64()
                    )
                }
            }
            Self::Cancelled => "Export cancelled; the library was only partially exported".to_string(),
            Self::Failed { reason } => format!("Export failed: {}", reason),
        }
    }

    /// Check if this is the last message of an export
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Cancelled | Self::Failed { .. }
        )
    }

    /// Get the progress fraction (0.0 to 1.0), where the message carries one
    pub fn progress_fraction(&self) -> Option<f64> {
        match self {
            Self::TrackExported { done, total, .. } | Self::CrateExported { done, total, .. } => {
                (*total > 0).then(|| *done as f64 / *total as f64)
            }
            Self::Finished { .. } => Some(1.0),
            Self::Started { .. } => Some(0.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_messages() {
        assert!(ExportProgress::Cancelled.is_terminal());
        assert!(ExportProgress::Failed { reason: "x".into() }.is_terminal());
        assert!(!ExportProgress::PhaseStarted { phase: ExportPhase::ExportTracks }.is_terminal());
    }

    #[test]
    fn test_progress_fraction() {
        let msg = ExportProgress::TrackExported {
            track_id: TrackId(1),
            dest_id: DestTrackId(1),
            copied: true,
            done: 2,
            total: 4,
        };
        assert_eq!(msg.progress_fraction(), Some(0.5));
        assert!(msg.description().starts_with("[2/4]"));
        assert_eq!(ExportProgress::Cancelled.progress_fraction(), None);
    }

    #[test]
    fn test_crate_description_mentions_missing_tracks() {
        let msg = ExportProgress::CrateExported {
            crate_id: CrateId(1),
            dest_id: DestCrateId(2),
            name: "House".into(),
            missing_tracks: 2,
            done: 3,
            total: 3,
        };
        assert_eq!(msg.description(), "[3/3] Crate 'House' (2 tracks missing)");
    }
}

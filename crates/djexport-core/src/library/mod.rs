//! Host library access
//!
//! The export pipeline never owns the host library. It sees it through two
//! traits: [`WorkSetResolver`] answers set questions before an export is
//! submitted, and [`TrackSource`] serves per-track and per-crate lookups
//! while the export runs. Both are implemented by the owning context of
//! the [`JobRunner`](crate::jobs::JobRunner), so calls from a job go
//! through deferred calls.

mod snapshot;

pub use snapshot::{LibraryCrate, LibrarySnapshot, SnapshotError};

use crate::types::{CrateId, TrackId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Set queries used to compute an export's work set
pub trait WorkSetResolver {
    fn all_track_ids(&self) -> BTreeSet<TrackId>;
    fn track_ids_in_crates(&self, crates: &BTreeSet<CrateId>) -> BTreeSet<TrackId>;
    fn crate_ids_containing(&self, tracks: &BTreeSet<TrackId>) -> BTreeSet<CrateId>;
}

/// Per-item lookups used while exporting
pub trait TrackSource {
    fn track(&self, id: TrackId) -> Option<LibraryTrack>;
    fn crate_name(&self, id: CrateId) -> Option<String>;
    fn crate_track_ids(&self, id: CrateId) -> BTreeSet<TrackId>;
}

// ============================================================================
// Track Data
// ============================================================================

/// A track as the host library knows it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryTrack {
    pub id: TrackId,
    /// Absolute path of the media file
    pub location: PathBuf,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub comment: Option<String>,
    pub composer: Option<String>,
    pub track_number: Option<i32>,
    pub year: Option<i32>,
    pub bpm: Option<f64>,
    pub key: Option<MusicalKey>,
    /// kbit/s
    pub bitrate: Option<i32>,
    pub sample_rate: Option<u32>,
    pub duration_secs: Option<f64>,
    pub beats: Option<BeatInfo>,
    /// Main cue position in samples
    pub main_cue: Option<f64>,
    pub hot_cues: Vec<LibraryHotCue>,
}

impl LibraryTrack {
    /// Lowercase file extension of the media file, if any
    pub fn file_extension(&self) -> Option<String> {
        self.location
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }

    /// Total length in samples, when duration and sample rate are known
    pub fn sample_count(&self) -> Option<i64> {
        match (self.duration_secs, self.sample_rate) {
            (Some(duration), Some(rate)) if duration > 0.0 => {
                Some((duration * f64::from(rate)).round() as i64)
            }
            _ => None,
        }
    }
}

/// Constant-tempo beat information, in samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatInfo {
    pub first_beat: f64,
    pub last_beat: f64,
    /// Beats from first to last, both included
    pub beat_count: i64,
}

/// A cue point stored on a library track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryHotCue {
    pub slot: i32,
    #[serde(default)]
    pub label: Option<String>,
    /// Position in samples
    pub position: f64,
}

/// The 24 major and minor keys
///
/// Serialized with short names (`C`, `F#m`, `Bb`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MusicalKey {
    #[serde(rename = "C")]
    CMajor,
    #[serde(rename = "Db")]
    DFlatMajor,
    #[serde(rename = "D")]
    DMajor,
    #[serde(rename = "Eb")]
    EFlatMajor,
    #[serde(rename = "E")]
    EMajor,
    #[serde(rename = "F")]
    FMajor,
    #[serde(rename = "F#")]
    FSharpMajor,
    #[serde(rename = "G")]
    GMajor,
    #[serde(rename = "Ab")]
    AFlatMajor,
    #[serde(rename = "A")]
    AMajor,
    #[serde(rename = "Bb")]
    BFlatMajor,
    #[serde(rename = "B")]
    BMajor,
    #[serde(rename = "Cm")]
    CMinor,
    #[serde(rename = "C#m")]
    CSharpMinor,
    #[serde(rename = "Dm")]
    DMinor,
    #[serde(rename = "Ebm")]
    EFlatMinor,
    #[serde(rename = "Em")]
    EMinor,
    #[serde(rename = "Fm")]
    FMinor,
    #[serde(rename = "F#m")]
    FSharpMinor,
    #[serde(rename = "Gm")]
    GMinor,
    #[serde(rename = "G#m")]
    GSharpMinor,
    #[serde(rename = "Am")]
    AMinor,
    #[serde(rename = "Bbm")]
    BFlatMinor,
    #[serde(rename = "Bm")]
    BMinor,
}

impl MusicalKey {
    pub const ALL: [MusicalKey; 24] = [
        Self::CMajor,
        Self::DFlatMajor,
        Self::DMajor,
        Self::EFlatMajor,
        Self::EMajor,
        Self::FMajor,
        Self::FSharpMajor,
        Self::GMajor,
        Self::AFlatMajor,
        Self::AMajor,
        Self::BFlatMajor,
        Self::BMajor,
        Self::CMinor,
        Self::CSharpMinor,
        Self::DMinor,
        Self::EFlatMinor,
        Self::EMinor,
        Self::FMinor,
        Self::FSharpMinor,
        Self::GMinor,
        Self::GSharpMinor,
        Self::AMinor,
        Self::BFlatMinor,
        Self::BMinor,
    ];

    /// Chromatic index: majors 1..=12 from C, minors 13..=24 from Cm
    pub fn index(self) -> i64 {
        Self::ALL.iter().position(|k| *k == self).map_or(0, |i| i as i64 + 1)
    }

    /// Inverse of [`index`](Self::index); 0 and out-of-range map to `None`
    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn is_minor(self) -> bool {
        self.index() > 12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_index_roundtrip() {
        for (i, key) in MusicalKey::ALL.iter().enumerate() {
            assert_eq!(key.index(), i as i64 + 1);
            assert_eq!(MusicalKey::from_index(key.index()), Some(*key));
        }
        assert_eq!(MusicalKey::from_index(0), None);
        assert_eq!(MusicalKey::from_index(25), None);
        assert!(MusicalKey::AMinor.is_minor());
        assert!(!MusicalKey::GMajor.is_minor());
    }

    #[test]
    fn test_key_short_names() {
        let key: MusicalKey = serde_yaml::from_str("F#m").unwrap();
        assert_eq!(key, MusicalKey::FSharpMinor);
        assert_eq!(serde_yaml::to_string(&MusicalKey::BFlatMajor).unwrap().trim(), "Bb");
    }

    #[test]
    fn test_sample_count_needs_duration_and_rate() {
        let mut track = LibraryTrack {
            duration_secs: Some(2.5),
            ..Default::default()
        };
        assert_eq!(track.sample_count(), None);
        track.sample_rate = Some(44100);
        assert_eq!(track.sample_count(), Some(110250));
    }

    #[test]
    fn test_file_extension_is_lowercased() {
        let track = LibraryTrack {
            location: PathBuf::from("/music/Song.MP3"),
            ..Default::default()
        };
        assert_eq!(track.file_extension().as_deref(), Some("mp3"));
    }
}

//! Destination-side track metadata
//!
//! Converts a [`LibraryTrack`] into the record written to the destination
//! database: tags, audio properties, a normalized beatgrid, main cue and
//! up to eight hot cues with the standard pad colours.

use crate::library::{BeatInfo, LibraryTrack};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Number of hot cue pads on the destination
pub const HOT_CUE_SLOTS: usize = 8;

/// Beat index the normalized grid starts at
pub const BEATGRID_FIRST_INDEX: i64 = -4;

// ============================================================================
// Pad Colours
// ============================================================================

/// RGB colour of a hot cue pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PadColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#RRGGBB`
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl fmt::Display for PadColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Default colour for each pad, by slot
pub const PAD_COLORS: [PadColor; HOT_CUE_SLOTS] = [
    PadColor::new(0xEA, 0xC5, 0x32),
    PadColor::new(0xEA, 0x8F, 0x32),
    PadColor::new(0xB8, 0x55, 0xBF),
    PadColor::new(0xBA, 0x2A, 0x41),
    PadColor::new(0x86, 0xC6, 0x4B),
    PadColor::new(0x20, 0xC6, 0x7C),
    PadColor::new(0x00, 0xA8, 0xB1),
    PadColor::new(0x15, 0x8E, 0xE2),
];

// ============================================================================
// Metadata Record
// ============================================================================

/// A beatgrid marker: beat `index` sits at `sample_offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatgridMarker {
    pub index: i64,
    pub sample_offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotCue {
    pub slot: u8,
    pub label: String,
    pub sample_offset: f64,
    pub color: PadColor,
}

/// Everything written for one destination track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub filename: String,
    pub file_extension: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub comment: Option<String>,
    pub composer: Option<String>,
    pub track_number: Option<i32>,
    pub year: Option<i32>,
    pub bpm: Option<f64>,
    /// Chromatic key index, see [`crate::library::MusicalKey::index`]
    pub key: Option<i64>,
    pub bitrate: Option<i32>,
    pub sample_rate: Option<u32>,
    pub sample_count: Option<i64>,
    /// Source file modification time, ms since the Unix epoch
    pub last_modified_ms: Option<i64>,
    pub main_cue: Option<f64>,
    pub beatgrid: Vec<BeatgridMarker>,
    pub hot_cues: Vec<HotCue>,
}

impl TrackMetadata {
    /// Build the destination record for `track`, exported as `filename`
    pub fn from_library(track: &LibraryTrack, filename: &str) -> Self {
        let sample_count = track.sample_count();
        Self {
            filename: filename.to_string(),
            file_extension: track.file_extension(),
            title: track.title.clone(),
            artist: track.artist.clone(),
            album: track.album.clone(),
            genre: track.genre.clone(),
            comment: track.comment.clone(),
            composer: track.composer.clone(),
            track_number: track.track_number,
            year: track.year,
            bpm: track.bpm,
            key: track.key.map(|k| k.index()),
            bitrate: track.bitrate,
            sample_rate: track.sample_rate,
            sample_count,
            last_modified_ms: file_modified_ms(&track.location),
            main_cue: track.main_cue,
            beatgrid: track
                .beats
                .map(|beats| normalize_beatgrid(&beats, sample_count))
                .unwrap_or_default(),
            hot_cues: hot_cues(track),
        }
    }
}

/// Modification time of a file in ms since the Unix epoch
pub fn file_modified_ms(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

/// Build a two-marker grid spanning the whole track
///
/// The first marker is moved back to beat index -4 and the last marker
/// forward to the first beat at or past the end of the track. When the
/// track length is unknown the last marker stays on the last beat.
/// Degenerate input (fewer than two beats, non-increasing positions)
/// yields no grid.
pub fn normalize_beatgrid(beats: &BeatInfo, sample_count: Option<i64>) -> Vec<BeatgridMarker> {
    if beats.beat_count < 2 || beats.last_beat <= beats.first_beat {
        return Vec::new();
    }

    let samples_per_beat = (beats.last_beat - beats.first_beat) / (beats.beat_count - 1) as f64;
    let at = |index: i64| BeatgridMarker {
        index,
        sample_offset: beats.first_beat + index as f64 * samples_per_beat,
    };

    let last_index = match sample_count {
        Some(count) => {
            let beats_to_end = ((count as f64 - beats.first_beat) / samples_per_beat).ceil() as i64;
            beats_to_end.max(BEATGRID_FIRST_INDEX + 1)
        }
        None => beats.beat_count - 1,
    };

    vec![at(BEATGRID_FIRST_INDEX), at(last_index)]
}

/// Hot cues on pads 0..8, first cue per slot wins
fn hot_cues(track: &LibraryTrack) -> Vec<HotCue> {
    let mut slots: [Option<HotCue>; HOT_CUE_SLOTS] = Default::default();
    for cue in &track.hot_cues {
        let Some(slot) = usize::try_from(cue.slot).ok().filter(|s| *s < HOT_CUE_SLOTS) else {
            log::debug!("[export] Track {}: skipping hot cue in slot {}", track.id, cue.slot);
            continue;
        };
        if slots[slot].is_some() {
            continue;
        }
        let label = cue
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Cue {}", slot + 1));
        slots[slot] = Some(HotCue {
            slot: slot as u8,
            label,
            sample_offset: cue.position,
            color: PAD_COLORS[slot],
        });
    }
    slots.into_iter().flatten().collect()
}

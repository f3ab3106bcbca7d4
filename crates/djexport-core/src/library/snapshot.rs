//! YAML-backed library snapshot for headless exports
//!
//! ```yaml
//! tracks:
//!   - id: 1
//!     location: music/intro.flac
//!     title: Intro
//!     bpm: 124.0
//!     key: Am
//! crates:
//!   - id: 10
//!     name: Warmup
//!     tracks: [1]
//! ```
//!
//! Relative track locations are resolved against the snapshot file's
//! directory.

use super::{LibraryTrack, TrackSource, WorkSetResolver};
use crate::types::{CrateId, TrackId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Snapshot loading errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Failed to read library snapshot {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid library snapshot: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Duplicate track id {0}")]
    DuplicateTrack(TrackId),

    #[error("Duplicate crate id {0}")]
    DuplicateCrate(CrateId),
}

/// A crate (playlist-like collection) in the host library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryCrate {
    pub id: CrateId,
    pub name: String,
    #[serde(default)]
    pub tracks: BTreeSet<TrackId>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct SnapshotFile {
    tracks: Vec<LibraryTrack>,
    crates: Vec<LibraryCrate>,
}

/// In-memory library loaded from a YAML file
#[derive(Debug, Clone, Default)]
pub struct LibrarySnapshot {
    tracks: BTreeMap<TrackId, LibraryTrack>,
    crates: BTreeMap<CrateId, LibraryCrate>,
}

impl LibrarySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot file
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut snapshot = Self::from_yaml(&contents)?;

        if let Some(base) = path.parent() {
            for track in snapshot.tracks.values_mut() {
                if track.location.is_relative() {
                    track.location = base.join(&track.location);
                }
            }
        }

        log::info!(
            "[library] Loaded {} tracks and {} crates from {:?}",
            snapshot.tracks.len(),
            snapshot.crates.len(),
            path
        );
        Ok(snapshot)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SnapshotError> {
        let file: SnapshotFile = serde_yaml::from_str(yaml)?;
        let mut snapshot = Self::new();
        for track in file.tracks {
            snapshot.add_track(track)?;
        }
        for library_crate in file.crates {
            snapshot.add_crate(library_crate)?;
        }
        Ok(snapshot)
    }

    pub fn to_yaml(&self) -> Result<String, SnapshotError> {
        let file = SnapshotFile {
            tracks: self.tracks.values().cloned().collect(),
            crates: self.crates.values().cloned().collect(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn add_track(&mut self, track: LibraryTrack) -> Result<(), SnapshotError> {
        if self.tracks.contains_key(&track.id) {
            return Err(SnapshotError::DuplicateTrack(track.id));
        }
        self.tracks.insert(track.id, track);
        Ok(())
    }

    /// Add a crate; member ids with no matching track are dropped
    pub fn add_crate(&mut self, mut library_crate: LibraryCrate) -> Result<(), SnapshotError> {
        if self.crates.contains_key(&library_crate.id) {
            return Err(SnapshotError::DuplicateCrate(library_crate.id));
        }
        let tracks = &self.tracks;
        library_crate.tracks.retain(|id| {
            let known = tracks.contains_key(id);
            if !known {
                log::warn!(
                    "[library] Crate '{}' references unknown track {}, dropping it",
                    library_crate.name,
                    id
                );
            }
            known
        });
        self.crates.insert(library_crate.id, library_crate);
        Ok(())
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn crates(&self) -> impl Iterator<Item = &LibraryCrate> {
        self.crates.values()
    }

    /// Media file locations for the given tracks
    pub fn locations(&self, ids: &BTreeSet<TrackId>) -> BTreeMap<TrackId, PathBuf> {
        ids.iter()
            .filter_map(|id| self.tracks.get(id).map(|t| (*id, t.location.clone())))
            .collect()
    }
}

impl WorkSetResolver for LibrarySnapshot {
    fn all_track_ids(&self) -> BTreeSet<TrackId> {
        self.tracks.keys().copied().collect()
    }

    fn track_ids_in_crates(&self, crates: &BTreeSet<CrateId>) -> BTreeSet<TrackId> {
        crates
            .iter()
            .filter_map(|id| self.crates.get(id))
            .flat_map(|c| c.tracks.iter().copied())
            .collect()
    }

    fn crate_ids_containing(&self, tracks: &BTreeSet<TrackId>) -> BTreeSet<CrateId> {
        self.crates
            .values()
            .filter(|c| !c.tracks.is_disjoint(tracks))
            .map(|c| c.id)
            .collect()
    }
}

impl TrackSource for LibrarySnapshot {
    fn track(&self, id: TrackId) -> Option<LibraryTrack> {
        self.tracks.get(&id).cloned()
    }

    fn crate_name(&self, id: CrateId) -> Option<String> {
        self.crates.get(&id).map(|c| c.name.clone())
    }

    fn crate_track_ids(&self, id: CrateId) -> BTreeSet<TrackId> {
        self.crates.get(&id).map(|c| c.tracks.clone()).unwrap_or_default()
    }
}

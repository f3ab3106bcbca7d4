//! Source-to-destination track id correlation

use crate::types::{DestTrackId, TrackId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

/// Maps library track ids to the destination track ids they were exported
/// as
///
/// Written by the track phase, read by the crate phase and by any progress
/// observer holding a reference.
#[derive(Debug, Default)]
pub struct IdCorrelationMap {
    entries: RwLock<HashMap<TrackId, DestTrackId>>,
}

impl IdCorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping, returning the previous destination id if `source`
    /// was already present
    pub fn insert(&self, source: TrackId, dest: DestTrackId) -> Option<DestTrackId> {
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source, dest);
        if let Some(prev) = previous.filter(|p| *p != dest) {
            log::warn!(
                "[export] Track {} remapped from destination {} to {}",
                source,
                prev,
                dest
            );
        }
        previous
    }

    pub fn get(&self, source: TrackId) -> Option<DestTrackId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a set of source ids, splitting into found destination ids
    /// and the source ids that have no mapping
    pub fn resolve(
        &self,
        sources: &BTreeSet<TrackId>,
    ) -> (BTreeSet<DestTrackId>, Vec<TrackId>) {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut found = BTreeSet::new();
        let mut missing = Vec::new();
        for source in sources {
            match entries.get(source) {
                Some(dest) => {
                    found.insert(*dest);
                }
                None => missing.push(*source),
            }
        }
        (found, missing)
    }

    /// All destination ids recorded so far
    pub fn destination_ids(&self) -> BTreeSet<DestTrackId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect()
    }
}

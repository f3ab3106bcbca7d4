//! [`DestinationStore`] backed by an [`EngineDb`]
//!
//! With staging enabled, the database is written in a temp directory: any
//! existing database files are copied there on open, and the staged files
//! are copied back over the real ones on finalize. Dropping the store
//! before finalize leaves the real destination untouched.

use super::{nullable_float, nullable_int, nullable_text, text, EngineDb, StoreError};
use crate::export::{DestinationStore, TrackMetadata};
use crate::types::{DestCrateId, DestTrackId};
use cozo::{DataValue, NamedRows};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Database file name inside the database directory
pub const DATABASE_FILE: &str = "m.db";

enum Location {
    Disk { database_dir: PathBuf, staged: bool },
    Memory,
}

enum State {
    Closed,
    Open {
        db: EngineDb,
        staging_dir: Option<TempDir>,
    },
    Finalized,
}

/// Exported library database
pub struct EngineLibrary {
    location: Location,
    state: State,
}

impl EngineLibrary {
    /// Store in `database_dir`, staged through a temp directory
    pub fn new(database_dir: impl Into<PathBuf>) -> Self {
        Self::with_staging(database_dir, true)
    }

    pub fn with_staging(database_dir: impl Into<PathBuf>, staged: bool) -> Self {
        Self {
            location: Location::Disk {
                database_dir: database_dir.into(),
                staged,
            },
            state: State::Closed,
        }
    }

    /// Store that lives in memory only (for testing)
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            state: State::Closed,
        }
    }

    fn db(&self) -> Result<&EngineDb, StoreError> {
        match &self.state {
            State::Open { db, .. } => Ok(db),
            _ => Err(StoreError::NotOpen),
        }
    }

    // ------------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------------

    pub fn track_count(&self) -> Result<usize, StoreError> {
        let result = self.db()?.run_query("?[count(id)] := *tracks{id}", BTreeMap::new())?;
        Ok(first_int(&result).unwrap_or(0) as usize)
    }

    pub fn track_relative_path(&self, track: DestTrackId) -> Result<Option<String>, StoreError> {
        let result = self.db()?.run_query(
            "?[relative_path] := *tracks{id, relative_path}, id = $id",
            crate::params!("id" => track.0),
        )?;
        Ok(first_str(&result))
    }

    /// Stored metadata for a track; beatgrid and hot cues included
    pub fn track_metadata(&self, track: DestTrackId) -> Result<Option<TrackMetadata>, StoreError> {
        let db = self.db()?;
        let result = db.run_query(
            r#"
            ?[filename, file_extension, title, artist, album, genre, comment, composer,
              track_number, year, bpm, key, bitrate, sample_rate, sample_count,
              last_modified_ms, main_cue] :=
                *tracks{id, filename, file_extension, title, artist, album, genre, comment,
                        composer, track_number, year, bpm, key, bitrate, sample_rate,
                        sample_count, last_modified_ms, main_cue},
                id = $id
        "#,
            crate::params!("id" => track.0),
        )?;
        let Some(row) = result.rows.first() else {
            return Ok(None);
        };

        let string = |i: usize| row.get(i).and_then(|v| v.get_str()).map(str::to_string);
        let int = |i: usize| row.get(i).and_then(|v| v.get_int());
        let float = |i: usize| row.get(i).and_then(|v| v.get_float());

        let mut metadata = TrackMetadata {
            filename: string(0).unwrap_or_default(),
            file_extension: string(1),
            title: string(2),
            artist: string(3),
            album: string(4),
            genre: string(5),
            comment: string(6),
            composer: string(7),
            track_number: int(8).and_then(|v| i32::try_from(v).ok()),
            year: int(9).and_then(|v| i32::try_from(v).ok()),
            bpm: float(10),
            key: int(11),
            bitrate: int(12).and_then(|v| i32::try_from(v).ok()),
            sample_rate: int(13).and_then(|v| u32::try_from(v).ok()),
            sample_count: int(14),
            last_modified_ms: int(15),
            main_cue: float(16),
            ..Default::default()
        };

        let grid = db.run_query(
            r#"
            ?[marker, beat_index, sample_offset] :=
                *beatgrids{track_id, marker, beat_index, sample_offset}, track_id = $id
            :order marker
        "#,
            crate::params!("id" => track.0),
        )?;
        metadata.beatgrid = grid
            .rows
            .iter()
            .filter_map(|row| {
                Some(crate::export::BeatgridMarker {
                    index: row.get(1)?.get_int()?,
                    sample_offset: row.get(2)?.get_float()?,
                })
            })
            .collect();

        let cues = db.run_query(
            r#"
            ?[slot, label, sample_offset, color] :=
                *hot_cues{track_id, slot, label, sample_offset, color}, track_id = $id
            :order slot
        "#,
            crate::params!("id" => track.0),
        )?;
        metadata.hot_cues = cues
            .rows
            .iter()
            .filter_map(|row| {
                Some(crate::export::HotCue {
                    slot: u8::try_from(row.get(0)?.get_int()?).ok()?,
                    label: row.get(1)?.get_str()?.to_string(),
                    sample_offset: row.get(2)?.get_float()?,
                    color: crate::export::PadColor::from_hex(row.get(3)?.get_str()?)?,
                })
            })
            .collect();

        Ok(Some(metadata))
    }

    /// Crate id by name and parent
    pub fn find_crate(
        &self,
        name: &str,
        parent: Option<DestCrateId>,
    ) -> Result<Option<DestCrateId>, StoreError> {
        let db = self.db()?;
        let result = match parent {
            Some(parent) => {
                let mut params = BTreeMap::new();
                params.insert("name".to_string(), text(name));
                params.insert("parent".to_string(), DataValue::from(parent.0));
                db.run_query(
                    r#"
                    ?[id] := *crates{id, name, parent_id}, name = $name, parent_id = $parent
                    :order id
                "#,
                    params,
                )?
            }
            None => {
                let mut params = BTreeMap::new();
                params.insert("name".to_string(), text(name));
                db.run_query(
                    r#"
                    ?[id] := *crates{id, name, parent_id}, name = $name, is_null(parent_id)
                    :order id
                "#,
                    params,
                )?
            }
        };
        Ok(first_int(&result).map(DestCrateId))
    }

    pub fn crate_parent(&self, crate_id: DestCrateId) -> Result<Option<DestCrateId>, StoreError> {
        let result = self.db()?.run_query(
            "?[parent_id] := *crates{id, parent_id}, id = $id",
            crate::params!("id" => crate_id.0),
        )?;
        Ok(first_int(&result).map(DestCrateId))
    }

    pub fn crate_track_ids(&self, crate_id: DestCrateId) -> Result<BTreeSet<DestTrackId>, StoreError> {
        let result = self.db()?.run_query(
            "?[track_id] := *crate_tracks{crate_id, track_id}, crate_id = $id",
            crate::params!("id" => crate_id.0),
        )?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.get_int()).map(DestTrackId))
            .collect())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn next_id(db: &EngineDb, relation: &str) -> Result<i64, StoreError> {
        let result = db.run_query(&format!("?[max(id)] := *{}{{id}}", relation), BTreeMap::new())?;
        Ok(first_int(&result).unwrap_or(0) + 1)
    }

    fn put_track(db: &EngineDb, id: DestTrackId, relative_path: &str, metadata: &TrackMetadata) -> Result<(), StoreError> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::from(id.0));
        params.insert("relative_path".to_string(), text(relative_path));
        params.insert("filename".to_string(), text(&metadata.filename));
        params.insert("file_extension".to_string(), nullable_text(metadata.file_extension.as_deref()));
        params.insert("title".to_string(), nullable_text(metadata.title.as_deref()));
        params.insert("artist".to_string(), nullable_text(metadata.artist.as_deref()));
        params.insert("album".to_string(), nullable_text(metadata.album.as_deref()));
        params.insert("genre".to_string(), nullable_text(metadata.genre.as_deref()));
        params.insert("comment".to_string(), nullable_text(metadata.comment.as_deref()));
        params.insert("composer".to_string(), nullable_text(metadata.composer.as_deref()));
        params.insert("track_number".to_string(), nullable_int(metadata.track_number.map(i64::from)));
        params.insert("year".to_string(), nullable_int(metadata.year.map(i64::from)));
        params.insert("bpm".to_string(), nullable_float(metadata.bpm));
        params.insert("key".to_string(), nullable_int(metadata.key));
        params.insert("bitrate".to_string(), nullable_int(metadata.bitrate.map(i64::from)));
        params.insert("sample_rate".to_string(), nullable_int(metadata.sample_rate.map(i64::from)));
        params.insert("sample_count".to_string(), nullable_int(metadata.sample_count));
        params.insert("last_modified_ms".to_string(), nullable_int(metadata.last_modified_ms));
        params.insert("main_cue".to_string(), nullable_float(metadata.main_cue));

        db.run_script(
            r#"
            ?[id, relative_path, filename, file_extension, title, artist, album, genre, comment,
              composer, track_number, year, bpm, key, bitrate, sample_rate, sample_count,
              last_modified_ms, main_cue] <- [[
                $id, $relative_path, $filename, $file_extension, $title, $artist, $album, $genre,
                $comment, $composer, $track_number, $year, $bpm, $key, $bitrate, $sample_rate,
                $sample_count, $last_modified_ms, $main_cue
            ]]
            :put tracks {id => relative_path, filename, file_extension, title, artist, album,
                         genre, comment, composer, track_number, year, bpm, key, bitrate,
                         sample_rate, sample_count, last_modified_ms, main_cue}
        "#,
            params,
        )?;
        Ok(())
    }

    fn replace_performance_data(db: &EngineDb, id: DestTrackId, metadata: &TrackMetadata) -> Result<(), StoreError> {
        let clear = [
            r#"
            ?[track_id, marker] := *beatgrids{track_id, marker}, track_id = $id
            :rm beatgrids {track_id, marker}
        "#,
            r#"
            ?[track_id, slot] := *hot_cues{track_id, slot}, track_id = $id
            :rm hot_cues {track_id, slot}
        "#,
            r#"
            ?[track_id, slot] := *loops{track_id, slot}, track_id = $id
            :rm loops {track_id, slot}
        "#,
        ];
        for script in clear {
            db.run_script(script, crate::params!("id" => id.0))?;
        }

        if !metadata.beatgrid.is_empty() {
            let rows: Vec<DataValue> = metadata
                .beatgrid
                .iter()
                .enumerate()
                .map(|(marker, m)| {
                    DataValue::List(vec![
                        DataValue::from(id.0),
                        DataValue::from(marker as i64),
                        DataValue::from(m.index),
                        DataValue::from(m.sample_offset),
                    ])
                })
                .collect();
            let mut params = BTreeMap::new();
            params.insert("rows".to_string(), DataValue::List(rows));
            db.run_script(
                r#"
                ?[track_id, marker, beat_index, sample_offset] <- $rows
                :put beatgrids {track_id, marker => beat_index, sample_offset}
            "#,
                params,
            )?;
        }

        if !metadata.hot_cues.is_empty() {
            let rows: Vec<DataValue> = metadata
                .hot_cues
                .iter()
                .map(|cue| {
                    DataValue::List(vec![
                        DataValue::from(id.0),
                        DataValue::from(i64::from(cue.slot)),
                        text(&cue.label),
                        DataValue::from(cue.sample_offset),
                        text(&cue.color.to_string()),
                    ])
                })
                .collect();
            let mut params = BTreeMap::new();
            params.insert("rows".to_string(), DataValue::List(rows));
            db.run_script(
                r#"
                ?[track_id, slot, label, sample_offset, color] <- $rows
                :put hot_cues {track_id, slot => label, sample_offset, color}
            "#,
                params,
            )?;
        }

        Ok(())
    }
}

impl DestinationStore for EngineLibrary {
    fn exists(&self) -> bool {
        match &self.location {
            Location::Disk { database_dir, .. } => database_dir.join(DATABASE_FILE).is_file(),
            Location::Memory => false,
        }
    }

    fn create_or_open(&mut self) -> Result<(), StoreError> {
        if matches!(self.state, State::Open { .. }) {
            return Ok(());
        }
        let existed = self.exists();

        let (db, staging_dir) = match &self.location {
            Location::Memory => (EngineDb::in_memory()?, None),
            Location::Disk {
                database_dir,
                staged: true,
            } => {
                let staging = tempfile::Builder::new().prefix("djexport-staging-").tempdir()?;
                if existed {
                    let copied = copy_files_in_dir(database_dir, staging.path())?;
                    log::info!("[export] Staged {} existing database files from {:?}", copied, database_dir);
                }
                let db = EngineDb::open(&staging.path().join(DATABASE_FILE))?;
                (db, Some(staging))
            }
            Location::Disk {
                database_dir,
                staged: false,
            } => {
                std::fs::create_dir_all(database_dir)?;
                (EngineDb::open(&database_dir.join(DATABASE_FILE))?, None)
            }
        };

        log::info!(
            "[export] {} destination database{}",
            if existed { "Opened existing" } else { "Created" },
            if staging_dir.is_some() { " (staged)" } else { "" }
        );
        self.state = State::Open { db, staging_dir };
        Ok(())
    }

    fn find_or_create_track(&mut self, relative_path: &str) -> Result<DestTrackId, StoreError> {
        let db = self.db()?;

        let mut params = BTreeMap::new();
        params.insert("path".to_string(), text(relative_path));
        let result = db.run_query(
            r#"
            ?[id] := *tracks{id, relative_path}, relative_path = $path
            :order id
        "#,
            params,
        )?;

        if result.rows.len() > 1 {
            log::warn!(
                "[export] {} destination tracks share path {}, using the first",
                result.rows.len(),
                relative_path
            );
        }
        if let Some(id) = first_int(&result) {
            return Ok(DestTrackId(id));
        }

        let id = DestTrackId(Self::next_id(db, "tracks")?);
        let filename = relative_path.rsplit('/').next().unwrap_or(relative_path);
        let placeholder = TrackMetadata {
            filename: filename.to_string(),
            ..Default::default()
        };
        Self::put_track(db, id, relative_path, &placeholder)?;
        log::debug!("[export] Created destination track {} for {}", id, relative_path);
        Ok(id)
    }

    fn write_track_metadata(&mut self, track: DestTrackId, metadata: &TrackMetadata) -> Result<(), StoreError> {
        let relative_path = self
            .track_relative_path(track)?
            .ok_or(StoreError::UnknownTrack(track))?;
        let db = self.db()?;
        Self::put_track(db, track, &relative_path, metadata)?;
        Self::replace_performance_data(db, track, metadata)
    }

    fn find_or_create_crate(&mut self, name: &str, parent: Option<DestCrateId>) -> Result<DestCrateId, StoreError> {
        if let Some(existing) = self.find_crate(name, parent)? {
            return Ok(existing);
        }

        let db = self.db()?;
        let id = Self::next_id(db, "crates")?;
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::from(id));
        params.insert("name".to_string(), text(name));
        params.insert("parent_id".to_string(), nullable_int(parent.map(|p| p.0)));
        db.run_script(
            r#"
            ?[id, name, parent_id] <- [[$id, $name, $parent_id]]
            :put crates {id => name, parent_id}
        "#,
            params,
        )?;
        log::debug!("[export] Created destination crate {} '{}'", id, name);
        Ok(DestCrateId(id))
    }

    fn set_crate_membership(&mut self, crate_id: DestCrateId, tracks: &BTreeSet<DestTrackId>) -> Result<(), StoreError> {
        let db = self.db()?;
        let known = db.run_query(
            "?[id] := *crates{id}, id = $id",
            crate::params!("id" => crate_id.0),
        )?;
        if known.rows.is_empty() {
            return Err(StoreError::UnknownCrate(crate_id));
        }

        db.run_script(
            r#"
            ?[crate_id, track_id] := *crate_tracks{crate_id, track_id}, crate_id = $id
            :rm crate_tracks {crate_id, track_id}
        "#,
            crate::params!("id" => crate_id.0),
        )?;

        if tracks.is_empty() {
            return Ok(());
        }
        let rows: Vec<DataValue> = tracks
            .iter()
            .map(|t| DataValue::List(vec![DataValue::from(crate_id.0), DataValue::from(t.0)]))
            .collect();
        let mut params = BTreeMap::new();
        params.insert("rows".to_string(), DataValue::List(rows));
        db.run_script(
            r#"
            ?[crate_id, track_id] <- $rows
            :put crate_tracks {crate_id, track_id}
        "#,
            params,
        )?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StoreError> {
        let (db, staging_dir) = match std::mem::replace(&mut self.state, State::Finalized) {
            State::Open { db, staging_dir } => (db, staging_dir),
            other => {
                self.state = other;
                return Err(StoreError::NotOpen);
            }
        };

        // Close the database before touching its files
        drop(db);

        if let (Some(staging), Location::Disk { database_dir, .. }) = (staging_dir, &self.location) {
            std::fs::create_dir_all(database_dir)?;
            let copied = copy_files_in_dir(staging.path(), database_dir)?;
            log::info!("[export] Committed {} database files to {:?}", copied, database_dir);
        }
        Ok(())
    }
}

/// Copy the regular files directly inside `src` into `dst`
fn copy_files_in_dir(src: &Path, dst: &Path) -> Result<usize, StoreError> {
    if !src.is_dir() {
        return Ok(0);
    }
    std::fs::create_dir_all(dst)?;

    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        std::fs::copy(entry.path(), dst.join(entry.file_name()))?;
        copied += 1;
    }
    Ok(copied)
}

fn first_int(result: &NamedRows) -> Option<i64> {
    result.rows.first().and_then(|row| row.first()).and_then(|v| v.get_int())
}

fn first_str(result: &NamedRows) -> Option<String> {
    result
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|v| v.get_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{BeatgridMarker, HotCue, PAD_COLORS};

    fn open_memory() -> EngineLibrary {
        let mut store = EngineLibrary::in_memory();
        store.create_or_open().unwrap();
        store
    }

    #[test]
    fn test_operations_require_open() {
        let mut store = EngineLibrary::in_memory();
        assert!(matches!(store.find_or_create_track("a.mp3"), Err(StoreError::NotOpen)));
        assert!(matches!(store.finalize(), Err(StoreError::NotOpen)));
    }

    #[test]
    fn test_find_or_create_track_is_idempotent() {
        let mut store = open_memory();
        let a = store.find_or_create_track("../music/1.mp3").unwrap();
        let b = store.find_or_create_track("../music/2.mp3").unwrap();
        let again = store.find_or_create_track("../music/1.mp3").unwrap();

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(store.track_count().unwrap(), 2);
        assert_eq!(store.track_relative_path(b).unwrap().as_deref(), Some("../music/2.mp3"));
    }

    #[test]
    fn test_write_metadata_replaces_grid_and_cues() {
        let mut store = open_memory();
        let id = store.find_or_create_track("../music/1.mp3").unwrap();

        let mut metadata = TrackMetadata {
            filename: "1.mp3".to_string(),
            title: Some("First".to_string()),
            bpm: Some(128.0),
            key: Some(22),
            beatgrid: vec![
                BeatgridMarker { index: -4, sample_offset: -1000.0 },
                BeatgridMarker { index: 100, sample_offset: 50000.0 },
            ],
            hot_cues: vec![HotCue {
                slot: 3,
                label: "Drop".to_string(),
                sample_offset: 4410.0,
                color: PAD_COLORS[3],
            }],
            ..Default::default()
        };
        store.write_track_metadata(id, &metadata).unwrap();

        let stored = store.track_metadata(id).unwrap().unwrap();
        assert_eq!(stored, metadata);

        metadata.hot_cues.clear();
        metadata.title = None;
        store.write_track_metadata(id, &metadata).unwrap();
        let stored = store.track_metadata(id).unwrap().unwrap();
        assert!(stored.hot_cues.is_empty());
        assert_eq!(stored.title, None);
        assert_eq!(stored.beatgrid.len(), 2);
        assert_eq!(store.track_relative_path(id).unwrap().as_deref(), Some("../music/1.mp3"));
    }

    #[test]
    fn test_write_metadata_for_unknown_track_fails() {
        let mut store = open_memory();
        let result = store.write_track_metadata(DestTrackId(99), &TrackMetadata::default());
        assert!(matches!(result, Err(StoreError::UnknownTrack(DestTrackId(99)))));
    }

    #[test]
    fn test_crates_are_scoped_by_parent() {
        let mut store = open_memory();
        let root = store.find_or_create_crate("Exported", None).unwrap();
        let child = store.find_or_create_crate("House", Some(root)).unwrap();
        let top_level = store.find_or_create_crate("House", None).unwrap();

        assert_ne!(child, top_level);
        assert_eq!(store.find_or_create_crate("House", Some(root)).unwrap(), child);
        assert_eq!(store.crate_parent(child).unwrap(), Some(root));
        assert_eq!(store.crate_parent(top_level).unwrap(), None);
    }

    #[test]
    fn test_set_membership_replaces_previous() {
        let mut store = open_memory();
        let t1 = store.find_or_create_track("1.mp3").unwrap();
        let t2 = store.find_or_create_track("2.mp3").unwrap();
        let c = store.find_or_create_crate("Mix", None).unwrap();

        store.set_crate_membership(c, &[t1, t2].into_iter().collect()).unwrap();
        assert_eq!(store.crate_track_ids(c).unwrap().len(), 2);

        store.set_crate_membership(c, &[t2].into_iter().collect()).unwrap();
        assert_eq!(store.crate_track_ids(c).unwrap(), [t2].into_iter().collect());

        assert!(matches!(
            store.set_crate_membership(DestCrateId(77), &BTreeSet::new()),
            Err(StoreError::UnknownCrate(_))
        ));
    }

    #[test]
    fn test_staged_store_touches_destination_only_on_finalize() {
        let dest = tempfile::tempdir().unwrap();
        let database_dir = dest.path().join("Engine Library");

        let mut store = EngineLibrary::new(&database_dir);
        assert!(!store.exists());
        store.create_or_open().unwrap();
        store.find_or_create_track("../music/1.mp3").unwrap();
        assert!(!database_dir.join(DATABASE_FILE).exists());

        store.finalize().unwrap();
        assert!(database_dir.join(DATABASE_FILE).is_file());

        // Reopen and merge
        let mut store = EngineLibrary::new(&database_dir);
        assert!(store.exists());
        store.create_or_open().unwrap();
        assert_eq!(store.track_count().unwrap(), 1);
        store.find_or_create_track("../music/2.mp3").unwrap();
        store.finalize().unwrap();

        let mut check = EngineLibrary::with_staging(&database_dir, false);
        check.create_or_open().unwrap();
        assert_eq!(check.track_count().unwrap(), 2);
    }

    #[test]
    fn test_dropping_staged_store_leaves_destination_untouched() {
        let dest = tempfile::tempdir().unwrap();
        let database_dir = dest.path().join("Engine Library");
        {
            let mut store = EngineLibrary::new(&database_dir);
            store.create_or_open().unwrap();
            store.find_or_create_track("1.mp3").unwrap();
        }
        assert!(!database_dir.exists());
    }
}

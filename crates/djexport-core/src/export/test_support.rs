//! Recording fakes for export tests

use super::*;
use crate::copier::{relative_path, CopyError};
use crate::db::StoreError;
use crate::library::{LibraryCrate, LibrarySnapshot, LibraryTrack};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Settings that keep tests fast: short polling, no watchdog
pub(crate) fn fast_settings(root: Option<&str>) -> ExportSettings {
    ExportSettings {
        root_crate_name: root.map(str::to_string),
        analysis_idle_timeout: None,
        cancel_poll_interval: Duration::from_millis(5),
        track_failure_policy: TrackFailurePolicy::Skip,
    }
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Debug, Clone, Default)]
pub(crate) struct Script(Vec<AnalysisEvent>);

impl Script {
    pub fn events(events: impl IntoIterator<Item = AnalysisEvent>) -> Self {
        Self(events.into_iter().collect())
    }
}

/// Replays a fixed event script whenever analysis is requested
#[derive(Default)]
pub(crate) struct ScriptedAnalysis {
    script: Script,
    requests: AtomicUsize,
}

impl ScriptedAnalysis {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl AnalysisRequester for ScriptedAnalysis {
    fn request_analysis(&self, _tracks: &BTreeSet<TrackId>, completion: AnalysisCompletionQueue) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        for event in &self.script.0 {
            match event {
                AnalysisEvent::TrackDone(id) => completion.notify_done(*id),
                AnalysisEvent::AllDone => completion.notify_all_done(),
            }
        }
    }
}

// ============================================================================
// Copier
// ============================================================================

/// Computes relative paths without touching the disk
#[derive(Default)]
pub(crate) struct FakeCopier {
    failing: Mutex<BTreeSet<String>>,
    failing_once: Mutex<BTreeSet<String>>,
}

impl FakeCopier {
    /// Fail every copy whose destination file is named after `track`
    pub fn fail_for(&self, track: TrackId) {
        self.failing.lock().unwrap().insert(track.to_string());
    }

    /// Fail only the next copy for `track`
    pub fn fail_once_for(&self, track: TrackId) {
        self.failing_once.lock().unwrap().insert(track.to_string());
    }
}

impl FileCopier for FakeCopier {
    fn copy_if_stale(
        &self,
        source: &Path,
        destination: &Path,
        relative_to: &Path,
    ) -> Result<CopyOutcome, CopyError> {
        let stem = destination
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let fail_once = self.failing_once.lock().unwrap().remove(&stem);
        if fail_once || self.failing.lock().unwrap().contains(&stem) {
            return Err(CopyError::SourceMissing(source.to_path_buf()));
        }
        Ok(CopyOutcome {
            relative_path: relative_path(destination, relative_to)?,
            copied: true,
        })
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoreCall {
    CreateOrOpen,
    FindTrack(String, DestTrackId),
    WriteTrack(DestTrackId),
    Crate(String, Option<DestCrateId>, DestCrateId),
    Membership(DestCrateId, BTreeSet<DestTrackId>),
    Finalize,
}

/// The kind of write about to hit a [`RecordingStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Track,
    TrackMetadata,
    Crate,
    Membership,
    Finalize,
}

type WriteHook = Box<dyn FnMut(WriteKind) + Send>;

#[derive(Default)]
struct StoreState {
    calls: Vec<StoreCall>,
    tracks: HashMap<String, DestTrackId>,
    crates: Vec<(String, Option<DestCrateId>, DestCrateId)>,
    memberships: HashMap<DestCrateId, BTreeSet<DestTrackId>>,
    next_id: i64,
    open: bool,
    finalized: bool,
    fail_writes: bool,
    before_write: Option<WriteHook>,
}

impl StoreState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn begin_write(&mut self, kind: WriteKind) -> Result<(), StoreError> {
        if let Some(hook) = self.before_write.as_mut() {
            hook(kind);
        }
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        if self.fail_writes {
            return Err(StoreError::Query("disk full".to_string()));
        }
        Ok(())
    }
}

/// In-memory store that records every call; clones share state
#[derive(Clone, Default)]
pub(crate) struct RecordingStore {
    state: Arc<Mutex<StoreState>>,
}

impl RecordingStore {
    fn with<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn fail_writes(&self) {
        self.with(|s| s.fail_writes = true);
    }

    /// Run `hook` at the start of every write, before it can fail
    pub fn before_write(&self, hook: impl FnMut(WriteKind) + Send + 'static) {
        self.with(|s| s.before_write = Some(Box::new(hook)));
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.with(|s| s.calls.clone())
    }

    pub fn finalized(&self) -> bool {
        self.with(|s| s.finalized)
    }

    pub fn crate_writes(&self) -> Vec<StoreCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, StoreCall::Crate(..) | StoreCall::Membership(..)))
            .collect()
    }

    pub fn crate_names(&self) -> Vec<String> {
        self.with(|s| s.crates.iter().map(|(name, _, _)| name.clone()).collect())
    }

    pub fn membership_of(&self, name: &str) -> BTreeSet<DestTrackId> {
        self.with(|s| {
            s.crates
                .iter()
                .find(|(n, _, _)| n == name)
                .and_then(|(_, _, id)| s.memberships.get(id).cloned())
                .unwrap_or_default()
        })
    }

    pub fn parent_name_of(&self, name: &str) -> Option<String> {
        self.with(|s| {
            let parent = s.crates.iter().find(|(n, _, _)| n == name)?.1?;
            s.crates
                .iter()
                .find(|(_, _, id)| *id == parent)
                .map(|(n, _, _)| n.clone())
        })
    }

    pub fn has_path_containing(&self, needle: &str) -> bool {
        self.with(|s| s.tracks.keys().any(|p| p.contains(needle)))
    }
}

impl DestinationStore for RecordingStore {
    fn exists(&self) -> bool {
        false
    }

    fn create_or_open(&mut self) -> Result<(), StoreError> {
        self.with(|s| {
            s.open = true;
            s.calls.push(StoreCall::CreateOrOpen);
        });
        Ok(())
    }

    fn find_or_create_track(&mut self, relative_path: &str) -> Result<DestTrackId, StoreError> {
        self.with(|s| {
            s.begin_write(WriteKind::Track)?;
            let id = match s.tracks.get(relative_path) {
                Some(id) => *id,
                None => {
                    let id = DestTrackId(s.next_id());
                    s.tracks.insert(relative_path.to_string(), id);
                    id
                }
            };
            s.calls.push(StoreCall::FindTrack(relative_path.to_string(), id));
            Ok(id)
        })
    }

    fn write_track_metadata(
        &mut self,
        track: DestTrackId,
        _metadata: &TrackMetadata,
    ) -> Result<(), StoreError> {
        self.with(|s| {
            s.begin_write(WriteKind::TrackMetadata)?;
            s.calls.push(StoreCall::WriteTrack(track));
            Ok(())
        })
    }

    fn find_or_create_crate(
        &mut self,
        name: &str,
        parent: Option<DestCrateId>,
    ) -> Result<DestCrateId, StoreError> {
        self.with(|s| {
            s.begin_write(WriteKind::Crate)?;
            let existing = s
                .crates
                .iter()
                .find(|(n, p, _)| n == name && *p == parent)
                .map(|(_, _, id)| *id);
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = DestCrateId(s.next_id());
                    s.crates.push((name.to_string(), parent, id));
                    id
                }
            };
            s.calls.push(StoreCall::Crate(name.to_string(), parent, id));
            Ok(id)
        })
    }

    fn set_crate_membership(
        &mut self,
        crate_id: DestCrateId,
        tracks: &BTreeSet<DestTrackId>,
    ) -> Result<(), StoreError> {
        self.with(|s| {
            s.begin_write(WriteKind::Membership)?;
            s.memberships.insert(crate_id, tracks.clone());
            s.calls.push(StoreCall::Membership(crate_id, tracks.clone()));
            Ok(())
        })
    }

    fn finalize(&mut self) -> Result<(), StoreError> {
        self.with(|s| {
            s.begin_write(WriteKind::Finalize)?;
            s.finalized = true;
            s.calls.push(StoreCall::Finalize);
            Ok(())
        })
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// A small library wired to recording collaborators
pub(crate) struct Fixture {
    pub library: LibrarySnapshot,
    pub work_set: WorkSet,
    pub destination: ExportDestination,
    pub store: RecordingStore,
    pub copier: Arc<FakeCopier>,
    pub analysis: Arc<ScriptedAnalysis>,
    pub id_map: Arc<IdCorrelationMap>,
    progress_tx: Sender<ExportProgress>,
    progress_rx: Receiver<ExportProgress>,
    seen: Mutex<Vec<ExportProgress>>,
    _dir: tempfile::TempDir,
}

impl Fixture {
    /// Tracks 1 and 2; crate 10 ("Crate 10") holds track 1 only
    pub fn two_tracks_one_crate(script: Script) -> Self {
        let mut library = LibrarySnapshot::new();
        for (id, ext) in [(1, "mp3"), (2, "flac")] {
            library
                .add_track(LibraryTrack {
                    id: TrackId(id),
                    location: PathBuf::from(format!("/source/{}.{}", id, ext)),
                    title: Some(format!("Track {}", id)),
                    ..Default::default()
                })
                .unwrap();
        }
        library
            .add_crate(LibraryCrate {
                id: CrateId(10),
                name: "Crate 10".to_string(),
                tracks: [TrackId(1)].into_iter().collect(),
            })
            .unwrap();

        let work_set = WorkSet::resolve(&library, &ExportScope::WholeLibrary);
        let dir = tempfile::tempdir().unwrap();
        let destination = ExportDestination::under(dir.path(), "Engine Library", "music");
        let (progress_tx, progress_rx) = channel::unbounded();

        Self {
            library,
            work_set,
            destination,
            store: RecordingStore::default(),
            copier: Arc::new(FakeCopier::default()),
            analysis: Arc::new(ScriptedAnalysis::new(script)),
            id_map: Arc::new(IdCorrelationMap::new()),
            progress_tx,
            progress_rx,
            seen: Mutex::new(Vec::new()),
            _dir: dir,
        }
    }

    pub fn pipeline(&self, settings: ExportSettings) -> ExportPipeline {
        ExportPipeline::new(
            self.destination.clone(),
            self.work_set.clone(),
            Box::new(self.store.clone()),
            self.copier.clone(),
            self.analysis.clone(),
            self.id_map.clone(),
            settings,
            Some(self.progress_tx.clone()),
        )
    }

    /// Every progress message sent so far
    pub fn messages(&self) -> Vec<ExportProgress> {
        let mut seen = self.seen.lock().unwrap();
        seen.extend(self.progress_rx.try_iter());
        seen.clone()
    }

    pub fn progress_fractions(&self) -> Vec<f64> {
        self.messages()
            .iter()
            .filter_map(ExportProgress::progress_fraction)
            .collect()
    }
}

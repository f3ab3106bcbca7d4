//! Submitting exports
//!
//! [`LibraryExporter`] validates an [`ExportRequest`], resolves its work
//! set on the caller's thread and hands an [`ExportPipeline`] to the job
//! runner. Only one export runs at a time.

use super::analysis::AnalysisRequester;
use super::ids::IdCorrelationMap;
use super::message::ExportProgress;
use super::pipeline::{ExportOutcome, ExportPipeline, ExportSettings};
use super::{DestinationStore, ExportDestination, ExportRequest, FileCopier, WorkSet};
use crate::jobs::{JobError, JobHandle, JobResult, JobRunner};
use crate::library::{TrackSource, WorkSetResolver};
use crossbeam::channel::{self, Receiver};
use std::sync::Arc;

/// Why an export was not started
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("No export destination selected")]
    NoDestination,

    #[error("Nothing to export")]
    NothingToExport,

    #[error("An export is already running")]
    ExportInProgress,

    #[error("Failed to start export job: {0}")]
    Job(#[from] JobError),
}

/// A running export
pub struct ExportJob {
    pub handle: JobHandle,
    pub result: JobResult<ExportOutcome>,
    /// Filled in as tracks are exported
    pub id_map: Arc<IdCorrelationMap>,
    pub progress_rx: Receiver<ExportProgress>,
}

/// Starts exports and keeps track of the one in flight
pub struct LibraryExporter {
    copier: Arc<dyn FileCopier>,
    analysis: Arc<dyn AnalysisRequester>,
    settings: ExportSettings,
    active: Option<JobHandle>,
}

impl LibraryExporter {
    pub fn new(
        copier: Arc<dyn FileCopier>,
        analysis: Arc<dyn AnalysisRequester>,
        settings: ExportSettings,
    ) -> Self {
        Self {
            copier,
            analysis,
            settings,
            active: None,
        }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    /// Whether the last submitted export is still running
    pub fn is_exporting(&self) -> bool {
        self.active.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn active_job(&self) -> Option<&JobHandle> {
        self.active.as_ref()
    }

    /// Request cancellation of the running export, if any
    pub fn cancel(&self) {
        if let Some(handle) = self.active.as_ref().filter(|h| !h.is_finished()) {
            log::info!("[export] Cancelling export job {}", handle.id());
            handle.request_cancellation();
        }
    }

    /// Validate `request` and start the export on `runner`
    ///
    /// `library` is only read here, to resolve the work set; the job itself
    /// reaches the library through deferred calls. `open_store` builds the
    /// destination store for the requested destination.
    pub fn submit_export<C, S>(
        &mut self,
        runner: &JobRunner<C>,
        library: &C,
        request: ExportRequest,
        open_store: S,
    ) -> Result<ExportJob, SubmitError>
    where
        C: WorkSetResolver + TrackSource + 'static,
        S: FnOnce(&ExportDestination) -> Box<dyn DestinationStore>,
    {
        if self.is_exporting() {
            return Err(SubmitError::ExportInProgress);
        }
        let destination = request.destination.ok_or(SubmitError::NoDestination)?;

        let work_set = WorkSet::resolve(library, &request.scope);
        if work_set.is_empty() {
            log::info!("[export] Nothing to export for {:?}", request.scope);
            return Err(SubmitError::NothingToExport);
        }
        log::info!(
            "[export] Exporting {} tracks and {} crates to {:?}",
            work_set.tracks.len(),
            work_set.crates.len(),
            destination.database_dir
        );

        let store = open_store(&destination);
        let id_map = Arc::new(IdCorrelationMap::new());
        let (progress_tx, progress_rx) = channel::unbounded();
        let name = format!("Export to {}", destination.database_dir.display());

        let pipeline = ExportPipeline::new(
            destination,
            work_set,
            store,
            self.copier.clone(),
            self.analysis.clone(),
            id_map.clone(),
            self.settings.clone(),
            Some(progress_tx),
        );
        let (handle, result) = runner.submit(name, move |conn| pipeline.run(&conn))?;
        self.active = Some(handle.clone());

        Ok(ExportJob {
            handle,
            result,
            id_map,
            progress_rx,
        })
    }
}

//! Background services for djexport-core
//!
//! Message-driven services that run long operations on their own threads.
//! Each is spawned with `spawn()`, returns a [`ServiceHandle`] and is
//! driven through a command channel; a client wraps the handle for the
//! code that needs the service.
//!
//! # Services
//!
//! - [`AnalysisService`] - Checks media files and reports analyzed tracks
//!
//! # Usage
//!
//! ```no_run
//! use djexport_core::services::{AnalysisClient, AnalysisCommand, AnalysisService};
//! use std::collections::BTreeMap;
//!
//! let mut handle = AnalysisService::spawn().unwrap();
//! let client = AnalysisClient::new(&handle, BTreeMap::new());
//! // hand `client` to a LibraryExporter ...
//! handle.stop(AnalysisCommand::Shutdown);
//! ```

mod analysis;
mod messages;

pub use analysis::{probe_media_file, AnalysisClient, AnalysisCommand, AnalysisService};
pub use messages::{AnalysisReport, ServiceHandle};

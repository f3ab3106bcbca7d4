//! djexport Core - Library export to Engine-style DJ databases
//!
//! Jobs run on worker threads and reach the host library through deferred
//! calls executed by the host ([`jobs`]). The export pipeline ([`export`])
//! is one such job: it copies media files, writes a destination database
//! ([`db`]) and mirrors crate membership.

pub mod config;
pub mod copier;
pub mod db;
pub mod export;
pub mod jobs;
pub mod library;
pub mod services;
pub mod types;

pub use types::*;

//! Message types shared by the background services

use crossbeam::channel::{SendError, Sender};
use std::path::PathBuf;
use std::thread::JoinHandle;

use crate::types::TrackId;

// ============================================================================
// Analysis Results
// ============================================================================

/// What one analysis batch found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    /// Tracks reported done, in the order they were analyzed
    pub analyzed: Vec<TrackId>,
    /// Tracks that could not be read, with the reason
    pub unreadable: Vec<(TrackId, PathBuf, String)>,
}

impl AnalysisReport {
    pub fn total(&self) -> usize {
        self.analyzed.len() + self.unreadable.len()
    }
}

// ============================================================================
// Service Handle
// ============================================================================

/// Handle for communicating with a background service
pub struct ServiceHandle<Cmd> {
    /// Channel for sending commands to the service
    pub command_tx: Sender<Cmd>,
    /// Thread handle for the service
    pub thread_handle: Option<JoinHandle<()>>,
}

impl<Cmd> ServiceHandle<Cmd> {
    /// Send a command to the service
    pub fn send(&self, cmd: Cmd) -> Result<(), SendError<Cmd>> {
        self.command_tx.send(cmd)
    }

    /// Check if the service is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Send `shutdown` and wait for the service thread to exit
    pub fn stop(&mut self, shutdown: Cmd) {
        let _ = self.command_tx.send(shutdown);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Service thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn test_report_total() {
        let report = AnalysisReport {
            analyzed: vec![TrackId(1), TrackId(2)],
            unreadable: vec![(TrackId(3), PathBuf::from("/x.mp3"), "gone".into())],
        };
        assert_eq!(report.total(), 3);
    }

    #[test]
    fn test_stop_joins_thread() {
        let (command_tx, command_rx) = channel::unbounded::<u8>();
        let thread_handle = std::thread::spawn(move || {
            let _ = command_rx.recv();
        });
        let mut handle = ServiceHandle {
            command_tx,
            thread_handle: Some(thread_handle),
        };
        assert!(handle.is_running());
        handle.stop(0);
        assert!(!handle.is_running());
    }
}

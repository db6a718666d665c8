//! Append-only line logger with a broadcaster fan-out.
//!
//! [`SharedLogger`] is the system of record for enforcement decisions
//! (`file.open`, `proc.exec`, `net.send`, `http.request`, `mcp.call`,
//! `secret.activation` log lines). It is deliberately separate from the
//! `tracing` diagnostics the rest of the workspace uses for its own health,
//! because policy-decision log lines must survive a logging-level filter
//! change.

use std::fs::File;
use std::io::Write as _;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel used for fan-out. Slow subscribers fall
/// behind and miss entries rather than backpressuring writers.
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("logger has not been initialized with a writer or broadcaster")]
    Uninitialized,
    #[error("failed to write log line: {0}")]
    Io(#[from] std::io::Error),
}

struct LoggerState {
    file: Option<File>,
    broadcaster: broadcast::Sender<String>,
}

/// Thread-safe append-only logger. Cloning shares the same underlying state.
#[derive(Clone)]
pub struct SharedLogger {
    state: std::sync::Arc<Mutex<LoggerState>>,
}

impl Default for SharedLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedLogger {
    /// Creates a logger with no file sink; writes still broadcast.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: std::sync::Arc::new(Mutex::new(LoggerState {
                file: None,
                broadcaster: tx,
            })),
        }
    }

    /// Creates a logger that also appends every line to `file`.
    pub fn with_file(file: File) -> Self {
        let logger = Self::new();
        {
            let mut state = logger.state.lock().unwrap_or_else(|p| p.into_inner());
            state.file = Some(file);
        }
        logger
    }

    /// Subscribes to the live fan-out of written lines (newline-stripped).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.broadcaster.subscribe()
    }

    /// Hot-swaps the fan-out target. Existing subscribers of the old
    /// broadcaster keep receiving entries already in flight; new calls to
    /// `subscribe` attach to the new one.
    pub fn set_broadcaster(&self, broadcaster: broadcast::Sender<String>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.broadcaster = broadcaster;
    }

    /// Appends a single line, adding a trailing newline if missing, flushes
    /// the file sink when present, then broadcasts the newline-stripped
    /// entry to all subscribers.
    pub fn write(&self, line: &str) -> Result<(), LoggerError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(file) = state.file.as_mut() {
            file.write_all(line.as_bytes())?;
            if !line.ends_with('\n') {
                file.write_all(b"\n")?;
            }
            file.flush()?;
        }

        let entry = line.trim_end_matches('\n').to_string();
        // No subscribers is not an error: the line is still durable on disk.
        let _ = state.broadcaster.send(entry);
        Ok(())
    }

    /// Flushes and closes the file sink. Subsequent `write` calls still
    /// broadcast but no longer persist to disk.
    pub fn close(&self) -> Result<(), LoggerError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut file) = state.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Writes through an optionally-absent logger handle, matching the "nil
/// handle" `ErrUninitialized` case from the enforcement spec: callers that
/// hold `Option<SharedLogger>` (e.g. before attach) use this instead of
/// unwrapping.
pub fn write_through(logger: Option<&SharedLogger>, line: &str) -> Result<(), LoggerError> {
    match logger {
        Some(logger) => logger.write(line),
        None => Err(LoggerError::Uninitialized),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::io::Read;

    #[test]
    fn write_appends_newline_and_flushes() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp file");
        let logger = SharedLogger::with_file(tmp.reopen().expect("reopen"));
        logger.write("event=file.open decision=allowed").unwrap();
        logger.write("event=proc.exec decision=denied\n").unwrap();
        logger.close().unwrap();

        let mut contents = String::new();
        std::fs::File::open(tmp.path())
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(
            contents,
            "event=file.open decision=allowed\nevent=proc.exec decision=denied\n"
        );
    }

    #[tokio::test]
    async fn broadcast_fans_out_newline_stripped_entries() {
        let logger = SharedLogger::new();
        let mut rx1 = logger.subscribe();
        let mut rx2 = logger.subscribe();

        logger.write("event=net.send decision=allowed\n").unwrap();

        assert_eq!(rx1.recv().await.unwrap(), "event=net.send decision=allowed");
        assert_eq!(rx2.recv().await.unwrap(), "event=net.send decision=allowed");
    }

    #[tokio::test]
    async fn set_broadcaster_hot_swaps_fan_out() {
        let logger = SharedLogger::new();
        let mut old_rx = logger.subscribe();

        let (new_tx, mut new_rx) = broadcast::channel(16);
        logger.set_broadcaster(new_tx);

        logger.write("event=mcp.call outcome=denied").unwrap();

        assert_eq!(new_rx.recv().await.unwrap(), "event=mcp.call outcome=denied");
        // The old receiver's channel was replaced, not closed mid-flight;
        // it simply never sees entries written after the swap.
        assert!(old_rx.try_recv().is_err());
    }

    #[test]
    fn write_without_file_still_succeeds() {
        let logger = SharedLogger::new();
        assert!(logger.write("event=secret.activation").is_ok());
    }

    #[test]
    fn write_through_nil_handle_errors() {
        let err = write_through(None, "event=file.open").unwrap_err();
        assert!(matches!(err, LoggerError::Uninitialized));
    }
}

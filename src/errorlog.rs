//! Error-sample persistence (section 6, optional, gated on `debug.enabled`):
//! an append-only JSON-lines file per UTC day under `debug.logDir`, written
//! by a small non-blocking task fed over an `mpsc` channel.
//!
//! Adapted from the teacher's `storage::Storage` (same "own task, own
//! `mpsc::Receiver`, append-and-flush per line" shape) but repurposed from
//! persisting every proxied event to persisting only classified errors, and
//! rotated by calendar day instead of once per process session.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSample {
    pub request_id: Option<String>,
    pub classification: String,
    pub message: String,
    pub timestamp_ms: u128,
}

pub struct ErrorLog {
    log_dir: PathBuf,
    rx: mpsc::Receiver<ErrorSample>,
}

impl ErrorLog {
    fn new(log_dir: PathBuf, rx: mpsc::Receiver<ErrorSample>) -> Self {
        Self { log_dir, rx }
    }

    fn file_path(&self) -> PathBuf {
        self.log_dir.join(format!("errors-{}.jsonl", Utc::now().format("%Y-%m-%d")))
    }

    async fn run(mut self) {
        if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
            tracing::error!("failed to create error-sample log directory: {}", e);
            return;
        }

        while let Some(sample) = self.rx.recv().await {
            if let Err(e) = self.write(&sample) {
                tracing::warn!("failed to persist error sample: {}", e);
            }
        }
    }

    fn write(&self, sample: &ErrorSample) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(self.file_path())?;
        let json = serde_json::to_string(sample).unwrap_or_else(|_| "{}".to_string());
        writeln!(file, "{json}")?;
        file.flush()
    }
}

/// Spawns the writer task and returns the handle to feed it. `None` when the
/// feature is disabled (`debug.enabled` is false or no `logDir` is set),
/// which callers treat as "don't bother recording samples."
pub fn spawn(enabled: bool, log_dir: Option<PathBuf>) -> Option<mpsc::Sender<ErrorSample>> {
    let log_dir = if enabled { log_dir? } else { return None };
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(ErrorLog::new(log_dir, rx).run());
    Some(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_is_none_when_disabled() {
        assert!(spawn(false, Some(PathBuf::from("/tmp/x"))).is_none());
    }

    #[test]
    fn spawn_is_none_without_a_log_dir() {
        assert!(spawn(true, None).is_none());
    }
}

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strata_core::event::{EventBus, ExecutionEvent};

/// JSONL event log.
///
/// Subscribes to the event bus and appends one JSON object per event to
/// `{log_dir}/{timestamp}.jsonl`. Every line is flushed as it is written,
/// so a crash loses at most the event in flight.
pub struct EventLogger {
    log_path: PathBuf,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a ExecutionEvent,
}

impl EventLogger {
    pub fn new(log_dir: &Path) -> Self {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        Self {
            log_path: log_dir.join(format!("{}.jsonl", timestamp)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Subscribe now and write in the background until `cancel` fires or
    /// the bus closes. Events published after this call are never missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<ExecutionEvent>, cancel: CancellationToken) {
        if let Some(dir) = self.log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                error!(error = %e, "Failed to create log directory");
                return;
            }
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %self.log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %self.log_path.display(), "Event log started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Event log cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        let entry = LogEntry {
                            timestamp: Utc::now().to_rfc3339(),
                            event: &event,
                        };
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Event log lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed, event log stopping");
                        break;
                    }
                },
            }
        }

        writer.flush().await.ok();
        debug!(path = %self.log_path.display(), "Event log finished");
    }
}

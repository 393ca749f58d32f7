//! Per-prediction watcher.
//!
//! One task per in-flight prediction drives the response-file rendezvous:
//! it wakes on IPC OUTPUT notifications or a poll timer, reads and deletes
//! `response-<id>-<epoch>.json` snapshots, post-processes outputs, sends
//! non-terminal webhooks, and delivers the single terminal response on the
//! pending's channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::paths;
use crate::pending::PendingPrediction;
use crate::prediction::{PredictionResponse, PredictionStatus};
use crate::upload::Uploader;
use crate::webhook::WebhookEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct Watcher {
    pub(crate) pending: Arc<PendingPrediction>,
    pub(crate) working_dir: PathBuf,
    pub(crate) uploader: Arc<Uploader>,
    /// Effective upload base: the request's output-file prefix wins over the
    /// manager-wide upload URL. `None` means outputs are inlined as data URLs.
    pub(crate) upload_url: Option<String>,
}

impl Watcher {
    /// Drive the rendezvous until a terminal response or cancellation. The
    /// pending's `watcher_done` latch closes on exit, whichever way we leave.
    pub(crate) async fn run(self) {
        self.watch().await;
        self.pending.close_watcher_done();
    }

    async fn watch(&self) {
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.pending.cancel_token().cancelled() => return,
                _ = self.pending.output_notify.notified() => {
                    self.process_response_files().await;
                    poll.reset();
                }
                _ = poll.tick() => {
                    self.process_response_files().await;
                }
            }
            if self.pending.status().is_completed() {
                return;
            }
        }
    }

    /// Scan the working directory for this prediction's response snapshots,
    /// oldest epoch first. Snapshots for other predictions are ignored.
    async fn process_response_files(&self) {
        let entries = match std::fs::read_dir(&self.working_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    dir = %self.working_dir.display(),
                    error = %e,
                    "failed to scan working directory"
                );
                return;
            }
        };

        let mut snapshots: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(epoch) = parse_response_filename(name, self.pending.id()) {
                snapshots.push((epoch, entry.path()));
            }
        }
        snapshots.sort();

        for (_, path) in snapshots {
            self.handle_single_response(&path).await;
            if self.pending.status().is_completed() {
                break;
            }
        }
    }

    async fn handle_single_response(&self, path: &Path) {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read response file");
                return;
            }
        };
        let mut response: PredictionResponse = match serde_json::from_slice(&raw) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding undecodable response file");
                let _ = std::fs::remove_file(path);
                return;
            }
        };

        response.populate_from_request(self.pending.request());
        if response.logs.is_empty() {
            response.logs = self.pending.lock().response.logs.clone();
        }

        // Delete before further processing so a slow pass never reads the
        // same snapshot twice.
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove response file");
        }

        if !response.output.is_null() {
            let mut cache = self.pending.lock().output_cache.clone();
            let mut consumed = Vec::new();
            let upload = self
                .upload_url
                .as_deref()
                .map(|base| (self.uploader.as_ref(), base));

            match paths::process_output(
                &mut response.output,
                upload,
                self.pending.id(),
                &mut cache,
                &mut consumed,
            )
            .await
            {
                Ok(()) => {
                    for consumed_path in &consumed {
                        if let Err(e) = std::fs::remove_file(consumed_path) {
                            tracing::debug!(
                                path = %consumed_path.display(),
                                error = %e,
                                "failed to unlink consumed output file"
                            );
                        }
                    }
                }
                Err(e) => {
                    response.status = PredictionStatus::Failed;
                    response.error = format!("output processing failed: {e}");
                }
            }
            self.pending.lock().output_cache = cache;
        }

        // Workers may report `starting`; callers only ever see `processing`.
        if response.status == PredictionStatus::Starting {
            response.status = PredictionStatus::Processing;
        }

        let (previous, snapshot) = {
            let mut state = self.pending.lock();
            let previous = state.response.status;
            state.response = response;
            if state.response.status.is_completed() {
                state.response.finalize();
            }
            (previous, state.response.clone())
        };

        if snapshot.status.is_completed() {
            self.pending.safe_send(snapshot);
            self.pending.safe_close();
            self.pending.unlink_input_paths();
        } else if snapshot.status == PredictionStatus::Processing {
            let event = if previous == PredictionStatus::Starting {
                WebhookEvent::Start
            } else if !snapshot.output.is_null() {
                WebhookEvent::Output
            } else {
                WebhookEvent::Logs
            };
            self.pending
                .webhook
                .send(event, self.pending.request(), &snapshot);
        }
    }
}

/// `response-<prediction_id>-<epoch>.json` -> epoch. Anything else is None.
fn parse_response_filename(name: &str, prediction_id: &str) -> Option<u64> {
    let stem = name.strip_prefix("response-")?.strip_suffix(".json")?;
    let (id, epoch) = stem.rsplit_once('-')?;
    if id != prediction_id || epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    epoch.parse().ok()
}

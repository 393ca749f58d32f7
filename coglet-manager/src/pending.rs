//! Per-in-flight-prediction state.
//!
//! A `PendingPrediction` is shared between the runner (log and output
//! routing), its watcher (response updates and delivery), and the manager
//! (crash fail-out and shutdown). All three coordinate through the
//! pending's own lock; the result channel is bounded to one element and
//! delivery is at-most-once by construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::prediction::{PredictionRequest, PredictionResponse, PredictionStatus};
use crate::webhook::WebhookSender;

pub struct PendingPrediction {
    request: PredictionRequest,
    is_async: bool,
    state: Mutex<PendingState>,
    /// Bounds the watcher's lifetime. Derived from the manager's context,
    /// deliberately decoupled from any caller context.
    cancel: CancellationToken,
    /// Posted by the runner on IPC OUTPUT events.
    pub(crate) output_notify: Notify,
    watcher_done: CancellationToken,
    terminal_webhook_sent: AtomicBool,
    pub(crate) webhook: Arc<WebhookSender>,
}

pub(crate) struct PendingState {
    pub(crate) response: PredictionResponse,
    /// Source path -> already-processed replacement, so each output file is
    /// uploaded or encoded at most once per prediction.
    pub(crate) output_cache: HashMap<String, String>,
    /// Temp files created by input path rewriting, unlinked on completion.
    pub(crate) input_paths: Vec<PathBuf>,
    sender: Option<mpsc::Sender<PredictionResponse>>,
    receiver: Option<mpsc::Receiver<PredictionResponse>>,
}

impl PendingPrediction {
    pub(crate) fn new(
        request: PredictionRequest,
        webhook: Arc<WebhookSender>,
        parent: &CancellationToken,
        is_async: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let response = PredictionResponse::starting(&request);

        Arc::new(Self {
            request,
            is_async,
            state: Mutex::new(PendingState {
                response,
                output_cache: HashMap::new(),
                input_paths: Vec::new(),
                sender: Some(tx),
                receiver: Some(rx),
            }),
            cancel: parent.child_token(),
            output_notify: Notify::new(),
            watcher_done: CancellationToken::new(),
            terminal_webhook_sent: AtomicBool::new(false),
            webhook,
        })
    }

    pub fn request(&self) -> &PredictionRequest {
        &self.request
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub(crate) fn is_async(&self) -> bool {
        self.is_async
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap()
    }

    pub fn response(&self) -> PredictionResponse {
        self.lock().response.clone()
    }

    pub fn status(&self) -> PredictionStatus {
        self.lock().response.status
    }

    pub(crate) fn with_response(&self, f: impl FnOnce(&mut PredictionResponse)) {
        f(&mut self.lock().response);
    }

    /// Append one log line, returning a response snapshot for webhooks.
    pub(crate) fn append_log(&self, line: &str) -> PredictionResponse {
        let mut state = self.lock();
        state.response.logs.push(line.to_string());
        state.response.clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn notify_output(&self) {
        self.output_notify.notify_one();
    }

    pub(crate) fn watcher_done(&self) -> &CancellationToken {
        &self.watcher_done
    }

    pub(crate) fn close_watcher_done(&self) {
        self.watcher_done.cancel();
    }

    /// Flip the terminal-webhook flag; true exactly once.
    pub(crate) fn mark_terminal_webhook(&self) -> bool {
        self.terminal_webhook_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Non-blocking send on the result channel. Refuses to send when the
    /// channel was already closed; a full buffer drops the value. Always
    /// followed by [`safe_close`](Self::safe_close), so callers treat
    /// closure with no value as "already delivered or cancelled".
    pub(crate) fn safe_send(&self, response: PredictionResponse) -> bool {
        let state = self.lock();
        match &state.sender {
            Some(sender) => sender.try_send(response).is_ok(),
            None => false,
        }
    }

    /// Close the result channel. Idempotent.
    pub(crate) fn safe_close(&self) {
        let mut state = self.lock();
        state.sender = None;
    }

    /// Take the receiving half; the forwarding task owns it afterwards.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<PredictionResponse>> {
        self.lock().receiver.take()
    }

    pub(crate) fn add_input_paths(&self, paths: Vec<PathBuf>) {
        self.lock().input_paths.extend(paths);
    }

    /// Unlink any temp input files created by path rewriting.
    pub(crate) fn unlink_input_paths(&self) {
        let paths = std::mem::take(&mut self.lock().input_paths);
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "failed to unlink input file");
            }
        }
    }
}

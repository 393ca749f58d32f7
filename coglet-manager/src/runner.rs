//! Worker subprocess lifecycle.
//!
//! A runner owns exactly one worker subprocess and its pending map. The
//! worker is a black box honouring the filesystem rendezvous protocol:
//! `config.json` and `request-<id>.json` written by the runner,
//! `openapi.json`, `setup_result.json`, and `response-<id>-<epoch>.json`
//! written by the worker, plus `cancel-<id>` as a zero-byte cancel signal.
//! Status strings (READY/BUSY/OUTPUT) arrive out-of-band via `handle_ipc`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::CogConfig;
use crate::env;
use crate::error::{Error, Result};
use crate::paths;
use crate::pending::PendingPrediction;
use crate::prediction::{
    PredictionResponse, PredictionStatus, SetupResult, SetupStatus,
};
use crate::schema::InputSchema;
use crate::upload::Uploader;
use crate::webhook::WebhookEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    Starting,
    SetupFailed,
    Ready,
    Busy,
    /// Terminal.
    Defunct,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::SetupFailed => "SETUP_FAILED",
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Defunct => "DEFUNCT",
        };
        f.write_str(s)
    }
}

/// Filesystem and identity context for one runner.
pub struct RunnerContext {
    pub id: String,
    /// The worker's cwd and the request/response rendezvous directory.
    pub working_dir: PathBuf,
    /// Scratch space for rewritten inputs; deleted on cleanup.
    pub tmp_dir: PathBuf,
    pub uploader: Option<Arc<Uploader>>,
    /// Isolated UID the worker runs under, when isolation is enabled.
    pub uid: Option<u32>,
    /// Extra directories swept for UID-owned files on cleanup.
    pub cleanup_directories: Vec<PathBuf>,
}

impl RunnerContext {
    /// Remove the temp directory and, under setUID isolation, sweep the
    /// cleanup directories for files the worker's UID left behind.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.tmp_dir) {
            tracing::debug!(dir = %self.tmp_dir.display(), error = %e, "failed to remove tmp dir");
        }
        let Some(uid) = self.uid else { return };
        for root in &self.cleanup_directories {
            sweep_uid_owned(root, uid, &[&self.working_dir, &self.tmp_dir]);
        }
    }
}

/// Remove every non-symlink entry under `root` owned by `uid`, never
/// leaving `root` and never descending into the skipped subtrees.
fn sweep_uid_owned(root: &Path, uid: u32, skip: &[&Path]) {
    use std::os::unix::fs::MetadataExt;

    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !skip.iter().any(|s| entry.path() == *s));

    let mut doomed: Vec<(PathBuf, bool)> = Vec::new();
    for entry in walker {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_symlink() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        if metadata.uid() == uid {
            doomed.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }

    for (path, is_dir) in doomed {
        let result = if is_dir {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), error = %e, "uid sweep removal failed");
        }
    }
}

/// `setup_result.json` as written by the worker. Absence means success.
#[derive(Debug, Deserialize)]
struct SetupResultFile {
    status: SetupStatus,
    #[serde(default)]
    schema: Option<serde_json::Value>,
    #[serde(default)]
    logs: String,
}

pub(crate) struct RunnerOptions {
    pub ctx: RunnerContext,
    pub command: Vec<String>,
    pub procedure_hash: Option<String>,
    pub env_set: HashMap<String, String>,
    pub env_unset: Vec<String>,
    pub cleanup_timeout: Duration,
    pub force_shutdown: CancellationToken,
    pub http: reqwest::Client,
}

pub struct Runner {
    ctx: RunnerContext,
    /// The procedure source URL this runner was configured from; the
    /// grouping key for reuse. `None` for the default runner.
    procedure_hash: Option<String>,
    command: Vec<String>,
    env_set: HashMap<String, String>,
    env_unset: Vec<String>,
    cleanup_timeout: Duration,
    force_shutdown: CancellationToken,
    http: reqwest::Client,
    created_at: DateTime<Utc>,

    state: Mutex<RunnerState>,

    stopped: CancellationToken,
    ready_for_shutdown: CancellationToken,
    setup_complete: CancellationToken,
    log_capture_complete: CancellationToken,
    process_exited: CancellationToken,
    /// Single-token gate for post-kill verification.
    cleanup_slot: Semaphore,
    shutdown_when_idle: AtomicBool,
    killed: AtomicBool,
}

struct RunnerState {
    status: RunnerStatus,
    pending: HashMap<String, Arc<PendingPrediction>>,
    schema_raw: Option<String>,
    schema: Option<InputSchema>,
    setup_result: Option<SetupResult>,
    /// Pre-setup and unattributed worker output, kept for crash reports.
    logs: Vec<String>,
    max_concurrency: usize,
    pid: Option<i32>,
    child: Option<Child>,
}

impl Runner {
    pub(crate) fn new(options: RunnerOptions) -> Arc<Self> {
        Arc::new(Self {
            ctx: options.ctx,
            procedure_hash: options.procedure_hash,
            command: options.command,
            env_set: options.env_set,
            env_unset: options.env_unset,
            cleanup_timeout: options.cleanup_timeout,
            force_shutdown: options.force_shutdown,
            http: options.http,
            created_at: Utc::now(),
            state: Mutex::new(RunnerState {
                status: RunnerStatus::Starting,
                pending: HashMap::new(),
                schema_raw: None,
                schema: None,
                setup_result: None,
                logs: Vec::new(),
                max_concurrency: 1,
                pid: None,
                child: None,
            }),
            stopped: CancellationToken::new(),
            ready_for_shutdown: CancellationToken::new(),
            setup_complete: CancellationToken::new(),
            log_capture_complete: CancellationToken::new(),
            process_exited: CancellationToken::new(),
            cleanup_slot: Semaphore::new(1),
            shutdown_when_idle: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn working_dir(&self) -> &Path {
        &self.ctx.working_dir
    }

    pub fn status(&self) -> RunnerStatus {
        self.state.lock().unwrap().status
    }

    pub fn procedure_hash(&self) -> Option<&str> {
        self.procedure_hash.as_deref()
    }

    pub(crate) fn uploader(&self) -> Option<Arc<Uploader>> {
        self.ctx.uploader.clone()
    }

    pub fn schema_raw(&self) -> Option<String> {
        self.state.lock().unwrap().schema_raw.clone()
    }

    pub fn setup_result(&self) -> Option<SetupResult> {
        self.state.lock().unwrap().setup_result.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().pending.is_empty()
    }

    /// Room for another prediction on a live worker.
    pub fn has_capacity(&self) -> bool {
        let state = self.state.lock().unwrap();
        !matches!(state.status, RunnerStatus::Defunct)
            && state.pending.len() < state.max_concurrency
    }

    pub(crate) fn setup_complete(&self) -> &CancellationToken {
        &self.setup_complete
    }

    pub(crate) fn ready_for_shutdown(&self) -> &CancellationToken {
        &self.ready_for_shutdown
    }

    pub(crate) fn log_capture_complete(&self) -> &CancellationToken {
        &self.log_capture_complete
    }

    pub(crate) fn process_exited(&self) -> &CancellationToken {
        &self.process_exited
    }

    pub fn cleanup_in_progress(&self) -> bool {
        self.cleanup_slot.available_permits() == 0
    }

    pub async fn wait_for_stop(&self) {
        self.stopped.cancelled().await;
    }

    /// Spawn the worker subprocess. Requires status `Starting`.
    ///
    /// The worker gets its own process group so signalling the leader
    /// reaches all descendants, and runs under the isolated UID when one
    /// was allocated.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.status != RunnerStatus::Starting {
                return Err(Error::InvalidRunnerStatus(state.status));
            }
        }
        if self.command.is_empty() {
            return Err(Error::NoCommand);
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .current_dir(&self.ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("COG_LOG_LEVEL", env::worker_log_level())
            .process_group(0);
        for key in &self.env_unset {
            cmd.env_remove(key);
        }
        for (key, value) in &self.env_set {
            cmd.env(key, value);
        }
        if let Some(uid) = self.ctx.uid {
            cmd.uid(uid);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().map(|p| p as i32);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut state = self.state.lock().unwrap();
            state.pid = pid;
            state.child = Some(child);
        }
        self.spawn_log_capture(stdout, stderr);

        tracing::info!(runner = %self.ctx.id, ?pid, "worker subprocess started");
        Ok(())
    }

    /// Read the project config, write `config.json` for the worker, and
    /// record the runner's concurrency limit. Gated on `COG_WAIT_FILE`
    /// when set (10ms poll, cancellable).
    pub async fn config(&self, cancel: &CancellationToken) -> Result<CogConfig> {
        if let Some(wait_file) = env::wait_file() {
            while !wait_file.exists() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Canceled),
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }

        let cog = CogConfig::read(&self.ctx.working_dir)?;
        let predict = cog.predict_config()?;
        let payload = serde_json::to_vec_pretty(&predict)?;
        std::fs::write(self.ctx.working_dir.join("config.json"), payload)?;

        self.state.lock().unwrap().max_concurrency = predict.max_concurrency;
        Ok(cog)
    }

    /// The IPC state machine. Unknown statuses are logged and ignored.
    pub fn handle_ipc(&self, status: &str) {
        match status {
            "READY" => self.handle_ready(),
            "BUSY" => {
                let mut state = self.state.lock().unwrap();
                if state.status != RunnerStatus::Defunct {
                    state.status = RunnerStatus::Busy;
                }
            }
            "OUTPUT" => {
                let pendings: Vec<_> = {
                    let state = self.state.lock().unwrap();
                    state.pending.values().cloned().collect()
                };
                for pending in pendings {
                    pending.notify_output();
                }
            }
            other => {
                tracing::debug!(runner = %self.ctx.id, status = other, "ignoring unknown ipc status");
            }
        }
    }

    fn handle_ready(&self) {
        let idle_and_ready = {
            let mut state = self.state.lock().unwrap();
            if state.status == RunnerStatus::Starting {
                match std::fs::read_to_string(self.ctx.working_dir.join("openapi.json")) {
                    Ok(raw) => match InputSchema::parse(&raw) {
                        Ok(schema) => {
                            state.schema = Some(schema);
                            state.schema_raw = Some(raw);
                        }
                        Err(e) => {
                            tracing::warn!(runner = %self.ctx.id, error = %e, "failed to parse openapi.json");
                        }
                    },
                    Err(e) => {
                        tracing::debug!(runner = %self.ctx.id, error = %e, "no openapi.json");
                    }
                }

                let file: Option<SetupResultFile> =
                    std::fs::read(self.ctx.working_dir.join("setup_result.json"))
                        .ok()
                        .and_then(|raw| serde_json::from_slice(&raw).ok());

                let (setup_status, logs) = match file {
                    Some(file) => {
                        if state.schema.is_none()
                            && let Some(schema_value) = file.schema
                            && let Ok(schema) = InputSchema::parse(&schema_value.to_string())
                        {
                            state.schema_raw = Some(schema_value.to_string());
                            state.schema = Some(schema);
                        }
                        let logs = if file.logs.is_empty() {
                            join_lines(&state.logs)
                        } else {
                            file.logs
                        };
                        (file.status, logs)
                    }
                    None => (SetupStatus::Succeeded, join_lines(&state.logs)),
                };

                state.setup_result = Some(SetupResult {
                    status: setup_status,
                    started_at: Some(self.created_at),
                    completed_at: Some(Utc::now()),
                    logs,
                });
                state.status = if setup_status == SetupStatus::Succeeded {
                    RunnerStatus::Ready
                } else {
                    RunnerStatus::SetupFailed
                };
                self.setup_complete.cancel();
            } else if state.status != RunnerStatus::Defunct {
                state.status = RunnerStatus::Ready;
            }
            state.status == RunnerStatus::Ready && state.pending.is_empty()
        };

        if idle_and_ready && self.shutdown_when_idle.load(Ordering::Acquire) {
            self.ready_for_shutdown.cancel();
        }
    }

    pub(crate) fn register_pending(&self, pending: Arc<PendingPrediction>) {
        self.state
            .lock()
            .unwrap()
            .pending
            .insert(pending.id().to_string(), pending);
    }

    pub(crate) fn remove_pending(&self, prediction_id: &str) {
        let idle_and_ready = {
            let mut state = self.state.lock().unwrap();
            state.pending.remove(prediction_id);
            state.status == RunnerStatus::Ready && state.pending.is_empty()
        };
        if idle_and_ready && self.shutdown_when_idle.load(Ordering::Acquire) {
            self.ready_for_shutdown.cancel();
        }
    }

    pub(crate) fn find_pending(&self, prediction_id: &str) -> Option<Arc<PendingPrediction>> {
        self.state.lock().unwrap().pending.get(prediction_id).cloned()
    }

    /// Hand a pre-allocated prediction to the worker: rewrite input paths,
    /// write `request-<id>.json`, and return the response channel with an
    /// initial `starting` response.
    pub async fn predict(
        &self,
        request_id: &str,
    ) -> Result<(mpsc::Receiver<PredictionResponse>, PredictionResponse)> {
        let (pending, schema) = {
            let state = self.state.lock().unwrap();
            let pending = state
                .pending
                .get(request_id)
                .cloned()
                .ok_or(Error::PredictionNotFound)?;
            (pending, state.schema.clone())
        };
        if pending.id() != request_id {
            return Err(Error::PredictionNotFound);
        }

        let mut request = pending.request().clone();
        match schema {
            Some(schema) => {
                // One cache across both passes: a repeated source string
                // resolves to the same temp file.
                let mut rewrite_cache = HashMap::new();
                let mut created = Vec::new();
                let rewritten = paths::base64_to_input(
                    &mut request.input,
                    &schema,
                    &self.ctx.tmp_dir,
                    &mut rewrite_cache,
                    &mut created,
                )
                .await;
                let rewritten = match rewritten {
                    Ok(()) => {
                        paths::url_to_input(
                            &mut request.input,
                            &schema,
                            &self.ctx.tmp_dir,
                            &self.http,
                            &mut rewrite_cache,
                            &mut created,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                pending.add_input_paths(created);
                rewritten?;
            }
            None => {
                tracing::warn!(
                    runner = %self.ctx.id,
                    prediction_id = request_id,
                    error = %Error::SchemaNotAvailable,
                    "request proceeds without input rewrites"
                );
            }
        }

        let payload = serde_json::to_vec(&request)?;
        tokio::fs::write(
            self.ctx.working_dir.join(format!("request-{request_id}.json")),
            payload,
        )
        .await?;

        let receiver = pending.take_receiver().ok_or(Error::PredictionNotFound)?;
        let response = PredictionResponse::starting(pending.request());
        Ok((receiver, response))
    }

    /// Signal cancellation to the worker by dropping a zero-byte
    /// `cancel-<id>` file. Cooperative: the worker decides when to emit the
    /// terminal response.
    pub fn cancel(&self, prediction_id: &str) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if !state.pending.contains_key(prediction_id) {
                return Err(Error::PredictionNotFound);
            }
        }
        std::fs::write(
            self.ctx.working_dir.join(format!("cancel-{prediction_id}")),
            b"",
        )?;
        Ok(())
    }

    /// Request shutdown once the runner drains. Closes `ready_for_shutdown`
    /// immediately when already idle.
    pub fn graceful_shutdown(&self) {
        self.shutdown_when_idle.store(true, Ordering::Release);
        let idle_and_ready = {
            let state = self.state.lock().unwrap();
            state.status == RunnerStatus::Ready && state.pending.is_empty()
        };
        if idle_and_ready {
            self.ready_for_shutdown.cancel();
        }
    }

    /// Graceful stop: fail out pending predictions, signal the process
    /// group, clean up the runner context. Idempotent once `Defunct`.
    pub fn stop(&self) {
        let (pendings, pid) = {
            let mut state = self.state.lock().unwrap();
            if state.status == RunnerStatus::Defunct {
                return;
            }
            state.status = RunnerStatus::Defunct;
            let pendings: Vec<_> = state.pending.drain().map(|(_, p)| p).collect();
            (pendings, state.pid)
        };

        for pending in pendings {
            fail_pending(&pending, "runner stopped", &[]);
        }

        if !self.process_exited.is_cancelled()
            && let Some(pid) = pid
            && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGTERM)
        {
            tracing::warn!(runner = %self.ctx.id, error = %e, "failed to signal worker process group");
        }

        self.ctx.cleanup();
        self.stopped.cancel();
    }

    /// Forced termination, at most once. In procedure mode the kill is
    /// gated on the cleanup slot and followed by post-kill verification.
    pub fn force_kill(self: &Arc<Self>) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pid = { self.state.lock().unwrap().pid };
        let Some(pid) = pid else { return };
        if self.process_exited.is_cancelled() {
            return;
        }

        if self.procedure_hash.is_none() {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::warn!(runner = %self.ctx.id, error = %e, "force kill failed");
                self.state.lock().unwrap().status = RunnerStatus::Defunct;
            }
            return;
        }

        let Ok(permit) = self.cleanup_slot.try_acquire() else {
            // Another kill already holds the token.
            return;
        };
        permit.forget();

        match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                let runner = Arc::clone(self);
                tokio::spawn(async move {
                    runner.verify_process_cleanup(pid).await;
                });
            }
            Err(e) => {
                self.cleanup_slot.add_permits(1);
                self.state.lock().unwrap().status = RunnerStatus::Defunct;
                tracing::warn!(runner = %self.ctx.id, error = %e, "force kill failed");
            }
        }
    }

    /// Hold the cleanup token until the runner stops; if the grace period
    /// elapses first, trigger the process-wide force shutdown.
    async fn verify_process_cleanup(&self, pid: i32) {
        tokio::select! {
            _ = self.stopped.cancelled() => {}
            _ = tokio::time::sleep(self.cleanup_timeout) => {
                tracing::error!(
                    runner = %self.ctx.id,
                    pid,
                    timeout_secs = self.cleanup_timeout.as_secs(),
                    "worker did not stop in time; triggering force shutdown"
                );
                self.force_shutdown.cancel();
            }
        }
        self.cleanup_slot.add_permits(1);
    }

    // ------------------------------------------------------------------
    // Crash handling (driven by the manager's per-runner monitor task)
    // ------------------------------------------------------------------

    pub(crate) fn take_child(&self) -> Option<Child> {
        self.state.lock().unwrap().child.take()
    }

    pub(crate) fn pid(&self) -> Option<i32> {
        self.state.lock().unwrap().pid
    }

    pub(crate) fn mark_process_exited(&self) {
        self.process_exited.cancel();
    }

    pub(crate) fn mark_defunct(&self) {
        self.state.lock().unwrap().status = RunnerStatus::Defunct;
    }

    pub(crate) fn captured_logs(&self) -> Vec<String> {
        self.state.lock().unwrap().logs.clone()
    }

    /// Fail out every pending prediction, delivering a synthesised failure
    /// carrying the captured logs, and cancel their watchers.
    pub(crate) fn fail_all_pending(&self, error: &str, crash_logs: &[String]) {
        let pendings: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.pending.drain().map(|(_, p)| p).collect()
        };
        for pending in pendings {
            tracing::warn!(
                runner = %self.ctx.id,
                prediction_id = %pending.id(),
                "failing prediction: {error}"
            );
            fail_pending(&pending, error, crash_logs);
        }
    }

    // ------------------------------------------------------------------
    // Log capture
    // ------------------------------------------------------------------

    fn spawn_log_capture(
        self: &Arc<Self>,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) {
        let mut scanners = Vec::new();
        if let Some(stream) = stdout {
            let runner = Arc::clone(self);
            scanners.push(tokio::spawn(scan_stream(runner, stream, false)));
        }
        if let Some(stream) = stderr {
            let runner = Arc::clone(self);
            scanners.push(tokio::spawn(scan_stream(runner, stream, true)));
        }

        let latch = self.log_capture_complete.clone();
        tokio::spawn(async move {
            for scanner in scanners {
                let _ = scanner.await;
            }
            latch.cancel();
        });
    }

    /// Route one captured line.
    ///
    /// `[pid=<id>] <msg>` lines belong to that prediction. Other lines
    /// belong to the sole live sync prediction once setup has succeeded,
    /// and to the runner-level buffer otherwise. `[coglet]` runtime chatter
    /// is never captured.
    fn capture_line(&self, line: &str, from_stderr: bool) {
        if let Some(rest) = line.strip_prefix("[pid=")
            && let Some((prediction_id, message)) = rest.split_once("] ")
        {
            let pending = self.find_pending(prediction_id);
            if let Some(pending) = pending {
                let snapshot = pending.append_log(message);
                // No logs webhook until the prediction has started; the
                // watcher sends `start` on the starting->processing
                // transition and these must not outrun it.
                if snapshot.status != PredictionStatus::Starting {
                    pending
                        .webhook
                        .send(WebhookEvent::Logs, pending.request(), &snapshot);
                }
                if from_stderr {
                    tracing::warn!(target: "coglet::prediction", prediction_id, "{message}");
                } else {
                    tracing::info!(target: "coglet::prediction", prediction_id, "{message}");
                }
                return;
            }
        }

        if line.contains("[coglet]") {
            tracing::trace!(target: "coglet::worker", "{line}");
            return;
        }

        let routed = {
            let state = self.state.lock().unwrap();
            let setup_succeeded = matches!(
                &state.setup_result,
                Some(result) if result.status == SetupStatus::Succeeded
            );
            if setup_succeeded {
                let mut sync_pendings = state.pending.values().filter(|p| !p.is_async());
                match (sync_pendings.next(), sync_pendings.next()) {
                    (Some(pending), None) => Some(Arc::clone(pending)),
                    _ => None,
                }
            } else {
                None
            }
        };

        match routed {
            Some(pending) => {
                let snapshot = pending.append_log(line);
                pending
                    .webhook
                    .send(WebhookEvent::Logs, pending.request(), &snapshot);
            }
            None => {
                let mut state = self.state.lock().unwrap();
                state.logs.push(line.to_string());
                if let Some(result) = state.setup_result.as_mut() {
                    result.logs.push_str(line);
                    result.logs.push('\n');
                }
                tracing::info!(target: "coglet::user", "{line}");
            }
        }
    }
}

async fn scan_stream<R: AsyncRead + Unpin>(runner: Arc<Runner>, stream: R, from_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        runner.capture_line(&line, from_stderr);
    }
}

/// Deliver a synthesised terminal failure on a pending and cancel its
/// watcher. Shared by stop and crash fail-out.
fn fail_pending(pending: &Arc<PendingPrediction>, error: &str, extra_logs: &[String]) {
    let response = {
        let mut state = pending.lock();
        if !state.response.status.is_completed() {
            state.response.status = PredictionStatus::Failed;
            state.response.error = error.to_string();
            state.response.logs.extend(extra_logs.iter().cloned());
            state.response.finalize();
        }
        state.response.clone()
    };
    pending.safe_send(response);
    pending.safe_close();
    pending.unlink_input_paths();
    pending.cancel();
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut joined = lines.join("\n");
    joined.push('\n');
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::PredictionRequest;
    use crate::webhook::{WebhookConfig, WebhookSender};

    fn test_runner(dir: &Path, command: Vec<String>) -> Arc<Runner> {
        let tmp_dir = dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        Runner::new(RunnerOptions {
            ctx: RunnerContext {
                id: "runner01".to_string(),
                working_dir: dir.to_path_buf(),
                tmp_dir,
                uploader: None,
                uid: None,
                cleanup_directories: Vec::new(),
            },
            command,
            procedure_hash: None,
            env_set: HashMap::new(),
            env_unset: Vec::new(),
            cleanup_timeout: Duration::from_secs(10),
            force_shutdown: CancellationToken::new(),
            http: reqwest::Client::new(),
        })
    }

    fn make_pending(id: &str) -> Arc<PendingPrediction> {
        let request = PredictionRequest {
            id: id.to_string(),
            input: serde_json::json!({"prompt": "hi"}),
            created_at: Some(Utc::now()),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        PendingPrediction::new(
            request,
            Arc::new(WebhookSender::new(WebhookConfig::default())),
            &CancellationToken::new(),
            false,
        )
    }

    #[test]
    fn status_wire_form() {
        assert_eq!(
            serde_json::to_string(&RunnerStatus::SetupFailed).unwrap(),
            "\"SETUP_FAILED\""
        );
        assert_eq!(RunnerStatus::Defunct.to_string(), "DEFUNCT");
    }

    #[tokio::test]
    async fn ready_without_files_assumes_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);

        runner.handle_ipc("READY");
        assert_eq!(runner.status(), RunnerStatus::Ready);
        assert!(runner.setup_complete().is_cancelled());
        let setup = runner.setup_result().unwrap();
        assert_eq!(setup.status, SetupStatus::Succeeded);
    }

    #[tokio::test]
    async fn ready_with_failed_setup_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("setup_result.json"),
            r#"{"status": "failed", "logs": "boom"}"#,
        )
        .unwrap();
        let runner = test_runner(dir.path(), vec![]);

        runner.handle_ipc("READY");
        assert_eq!(runner.status(), RunnerStatus::SetupFailed);
        assert!(runner.setup_complete().is_cancelled());
        assert_eq!(runner.setup_result().unwrap().logs, "boom");
    }

    #[tokio::test]
    async fn ready_parses_openapi_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("openapi.json"),
            r#"{"components": {"schemas": {"Input": {"properties": {
                "image": {"type": "string", "format": "uri"}}}}}}"#,
        )
        .unwrap();
        let runner = test_runner(dir.path(), vec![]);

        runner.handle_ipc("READY");
        assert!(runner.schema_raw().is_some());
    }

    #[tokio::test]
    async fn busy_and_unknown_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);

        runner.handle_ipc("BUSY");
        assert_eq!(runner.status(), RunnerStatus::Busy);

        runner.handle_ipc("WAT");
        assert_eq!(runner.status(), RunnerStatus::Busy);
    }

    #[tokio::test]
    async fn defunct_survives_late_ipc() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);
        runner.stop();

        runner.handle_ipc("READY");
        assert_eq!(runner.status(), RunnerStatus::Defunct);
        runner.handle_ipc("BUSY");
        assert_eq!(runner.status(), RunnerStatus::Defunct);
    }

    #[tokio::test]
    async fn cancel_writes_cancel_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);
        runner.register_pending(make_pending("abc"));

        runner.cancel("abc").unwrap();
        assert!(dir.path().join("cancel-abc").exists());

        let err = runner.cancel("unknown");
        assert!(matches!(err, Err(Error::PredictionNotFound)));
    }

    #[tokio::test]
    async fn predict_writes_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);
        runner.register_pending(make_pending("abc"));

        let (_rx, initial) = runner.predict("abc").await.unwrap();
        assert_eq!(initial.status, PredictionStatus::Starting);
        assert_eq!(initial.id, "abc");

        let raw = std::fs::read(dir.path().join("request-abc.json")).unwrap();
        let request: PredictionRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(request.id, "abc");
        assert_eq!(request.input, serde_json::json!({"prompt": "hi"}));
    }

    #[tokio::test]
    async fn predict_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);
        let err = runner.predict("nope").await;
        assert!(matches!(err, Err(Error::PredictionNotFound)));
    }

    #[tokio::test]
    async fn stop_fails_out_pending_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);
        let pending = make_pending("abc");
        let mut rx = pending.take_receiver().unwrap();
        runner.register_pending(Arc::clone(&pending));

        runner.stop();
        assert_eq!(runner.status(), RunnerStatus::Defunct);
        assert!(runner.is_idle());

        let response = rx.recv().await.unwrap();
        assert_eq!(response.status, PredictionStatus::Failed);
        assert_eq!(response.error, "runner stopped");
        assert!(rx.recv().await.is_none());

        // Idempotent.
        runner.stop();
    }

    #[tokio::test]
    async fn start_requires_starting_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec!["sleep".to_string(), "30".to_string()]);
        runner.handle_ipc("READY");

        let err = runner.start();
        assert!(matches!(err, Err(Error::InvalidRunnerStatus(RunnerStatus::Ready))));
    }

    #[tokio::test]
    async fn start_requires_a_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);
        assert!(matches!(runner.start(), Err(Error::NoCommand)));
    }

    #[tokio::test]
    async fn start_and_stop_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec!["sleep".to_string(), "30".to_string()]);

        runner.start().unwrap();
        let mut child = runner.take_child().unwrap();

        runner.stop();
        assert_eq!(runner.status(), RunnerStatus::Defunct);
        tokio::time::timeout(Duration::from_secs(5), runner.wait_for_stop())
            .await
            .unwrap();

        // SIGTERM to the process group reaps the worker.
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn config_reads_yaml_and_writes_config_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cog.yaml"),
            "predict: predict.py:Predictor\nconcurrency:\n  max: 3\n",
        )
        .unwrap();
        let runner = test_runner(dir.path(), vec![]);

        let cog = runner.config(&CancellationToken::new()).await.unwrap();
        assert_eq!(cog.concurrency.max, 3);

        let raw = std::fs::read(dir.path().join("config.json")).unwrap();
        let written: crate::config::PredictConfig = serde_json::from_slice(&raw).unwrap();
        assert_eq!(written.module_name, "predict");
        assert_eq!(written.predictor_name, "Predictor");
        assert_eq!(written.max_concurrency, 3);

        // Capacity follows the config.
        runner.register_pending(make_pending("a"));
        runner.register_pending(make_pending("b"));
        assert!(runner.has_capacity());
        runner.register_pending(make_pending("c"));
        assert!(!runner.has_capacity());
    }

    #[tokio::test]
    async fn capture_line_routes_pid_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);
        let pending = make_pending("abc");
        runner.register_pending(Arc::clone(&pending));

        runner.capture_line("[pid=abc] hello from predict", false);
        assert_eq!(
            pending.response().logs,
            vec!["hello from predict".to_string()]
        );

        // Unknown pid tags and coglet chatter never reach the pending.
        runner.capture_line("[pid=zzz] orphan line", false);
        runner.capture_line("[coglet] internal runtime detail", false);
        assert_eq!(pending.response().logs.len(), 1);
        // The orphan line lands in the runner buffer instead.
        assert_eq!(runner.captured_logs(), vec!["[pid=zzz] orphan line".to_string()]);
    }

    #[tokio::test]
    async fn pid_tagged_logs_webhook_waits_for_processing() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);

        let request = PredictionRequest {
            id: "abc".to_string(),
            webhook: Some(server.uri()),
            ..Default::default()
        };
        let config = WebhookConfig {
            response_interval: Duration::ZERO,
            ..Default::default()
        };
        let pending = PendingPrediction::new(
            request,
            Arc::new(WebhookSender::new(config)),
            &CancellationToken::new(),
            false,
        );
        runner.register_pending(Arc::clone(&pending));

        // Captured but not webhooked while the prediction is still starting.
        runner.capture_line("[pid=abc] warming up", false);
        assert_eq!(pending.response().logs, vec!["warming up".to_string()]);

        pending.with_response(|r| r.status = PredictionStatus::Processing);
        runner.capture_line("[pid=abc] generating", false);

        // Give the fire-and-forget send a beat before verification.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn capture_line_routes_untagged_lines_to_sole_sync_pending() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(dir.path(), vec![]);

        // Pre-setup: buffered at the runner level.
        runner.capture_line("loading weights", false);
        assert_eq!(runner.captured_logs(), vec!["loading weights".to_string()]);

        runner.handle_ipc("READY");
        assert_eq!(runner.setup_result().unwrap().logs, "loading weights\n");

        let pending = make_pending("abc");
        runner.register_pending(Arc::clone(&pending));
        runner.capture_line("print output", false);
        assert_eq!(pending.response().logs, vec!["print output".to_string()]);
    }
}

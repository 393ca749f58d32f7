//! The fleet: capacity accounting, runner allocation and eviction, request
//! routing, crash recovery, and shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{CogConfig, ManagerConfig};
use crate::error::{Error, Result};
use crate::id;
use crate::metrics;
use crate::pending::PendingPrediction;
use crate::prediction::{
    PredictionRequest, PredictionResponse, PredictionStatus, SetupResult,
};
use crate::procedure;
use crate::runner::{Runner, RunnerContext, RunnerOptions, RunnerStatus};
use crate::uid;
use crate::upload::Uploader;
use crate::watcher::Watcher;
use crate::webhook::{WebhookConfig, WebhookSender};
use crate::env;

const DEFAULT_RUNNER_ID: &str = "default";

/// Deadline on runner assignment, including setup of a fresh procedure
/// runner for sync requests.
const ASSIGN_DEADLINE: Duration = Duration::from_secs(10);

/// How long the crash monitor waits for log capture to drain before
/// failing out pending predictions.
const LOG_CAPTURE_GRACE: Duration = Duration::from_secs(1);

/// How long `force_kill_all` waits for crash monitors to drain.
const MONITOR_DRAIN: Duration = Duration::from_millis(200);

/// Schema served in procedure mode; per-procedure workers are configured
/// from the request itself, so the surface is static.
const PROCEDURE_SCHEMA: &str = r#"{
  "openapi": "3.0.2",
  "info": {"title": "Cog", "version": "0.1.0"},
  "components": {
    "schemas": {
      "Input": {
        "type": "object",
        "title": "Input",
        "properties": {
          "replicate_weights": {"type": "string", "format": "uri", "title": "Replicate Weights"}
        }
      },
      "Output": {"title": "Output"}
    }
  }
}"#;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Concurrency {
    pub max: usize,
    pub current: usize,
}

/// Token-channel capacity semaphore. The token balance is the ground truth
/// for predictions in flight.
struct Capacity {
    tokens_tx: mpsc::Sender<()>,
    tokens_rx: std::sync::Mutex<mpsc::Receiver<()>>,
    max: usize,
    available: AtomicUsize,
}

impl Capacity {
    fn new(max: usize) -> Self {
        let (tokens_tx, tokens_rx) = mpsc::channel(max);
        for _ in 0..max {
            tokens_tx
                .try_send(())
                .expect("capacity channel sized to hold all tokens");
        }
        Self {
            tokens_tx,
            tokens_rx: std::sync::Mutex::new(tokens_rx),
            max,
            available: AtomicUsize::new(max),
        }
    }

    /// Non-blocking claim; false means no capacity.
    fn claim(&self) -> bool {
        let claimed = self.tokens_rx.lock().unwrap().try_recv().is_ok();
        if claimed {
            self.available.fetch_sub(1, Ordering::AcqRel);
        }
        claimed
    }

    fn release(&self) {
        if self.tokens_tx.try_send(()).is_ok() {
            self.available.fetch_add(1, Ordering::AcqRel);
        } else {
            tracing::error!("capacity token released with a full channel");
        }
    }

    fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }
}

pub struct Manager {
    cfg: ManagerConfig,
    /// Fixed-length fleet; empty slots are `None`.
    fleet: tokio::sync::Mutex<Vec<Option<Arc<Runner>>>>,
    capacity: Capacity,
    webhook: Arc<WebhookSender>,
    uploader: Arc<Uploader>,
    http: reqwest::Client,
    monitors: TaskTracker,
    /// Parent context for every pending prediction, deliberately decoupled
    /// from caller contexts so a disconnect never cancels a prediction.
    root: CancellationToken,
    stopped: CancellationToken,
    stopping: AtomicBool,
}

impl Manager {
    pub async fn new(cfg: ManagerConfig) -> Result<Arc<Self>> {
        let max = fleet_size(&cfg);
        std::fs::create_dir_all(&cfg.working_directory)?;

        let manager = Arc::new(Self {
            fleet: tokio::sync::Mutex::new(vec![None; max]),
            capacity: Capacity::new(max),
            webhook: Arc::new(WebhookSender::new(WebhookConfig::default())),
            uploader: Arc::new(Uploader::new()),
            http: reqwest::Client::new(),
            monitors: TaskTracker::new(),
            root: CancellationToken::new(),
            stopped: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            cfg,
        });

        // In-place model serving gets its one runner up front; procedure
        // runners are created on demand.
        if !manager.cfg.use_procedure_mode {
            manager.create_default_runner().await?;
        }
        Ok(manager)
    }

    pub fn concurrency(&self) -> Concurrency {
        Concurrency {
            max: self.capacity.max,
            current: self.capacity.max - self.capacity.available(),
        }
    }

    pub fn available_capacity(&self) -> usize {
        self.capacity.available()
    }

    /// Submit a prediction and block until its terminal response.
    pub async fn predict_sync(self: &Arc<Self>, request: PredictionRequest) -> Result<PredictionResponse> {
        self.predict(request, false).await
    }

    /// Submit a prediction and return the initial `starting` response; the
    /// terminal response is delivered via webhook.
    pub async fn predict_async(self: &Arc<Self>, request: PredictionRequest) -> Result<PredictionResponse> {
        self.predict(request, true).await
    }

    async fn predict(
        self: &Arc<Self>,
        mut request: PredictionRequest,
        is_async: bool,
    ) -> Result<PredictionResponse> {
        if request.id.is_empty() {
            request.id = id::prediction_id();
        }

        if !self.capacity.claim() {
            return Err(Error::NoCapacity);
        }

        let assigned = tokio::time::timeout(
            ASSIGN_DEADLINE,
            self.assign_req_to_runner(&request, is_async),
        )
        .await;
        let (runner, pending) = match assigned {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.capacity.release();
                return Err(e);
            }
            Err(_) => {
                self.capacity.release();
                return Err(Error::RunnerSetupTimeout);
            }
        };

        tokio::select! {
            _ = runner.setup_complete().cancelled() => {}
            _ = pending.cancel_token().cancelled() => {
                self.capacity.release();
                return Err(Error::Canceled);
            }
        }

        if runner.status() == RunnerStatus::SetupFailed {
            // The watcher finaliser still drives the webhook path; the
            // caller gets the sentinel and must not wait for a response.
            self.capacity.release();
            return Err(Error::AsyncPrediction);
        }

        let (receiver, initial) = match runner.predict(&request.id).await {
            Ok(pair) => pair,
            Err(e) => {
                pending.with_response(|response| {
                    response.status = PredictionStatus::Failed;
                    response.error = e.to_string();
                });
                pending.cancel();
                self.capacity.release();
                return Err(e);
            }
        };

        // The forwarding task owns the capacity token from here: it is
        // released when the terminal response fires, whoever sends it.
        let (forward_tx, mut forward_rx) = mpsc::channel::<PredictionResponse>(1);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut receiver = receiver;
            let response = receiver.recv().await;
            manager.capacity.release();
            if let Some(response) = response {
                let _ = forward_tx.try_send(response);
            }
        });

        if is_async {
            Ok(initial)
        } else {
            match forward_rx.recv().await {
                Some(response) => Ok(response),
                // Channel closed with no value: already delivered or
                // cancelled. Fall back to the pending's final state.
                None => Ok(pending.response()),
            }
        }
    }

    /// Pick or create the runner for a request and pre-allocate its
    /// pending prediction.
    async fn assign_req_to_runner(
        self: &Arc<Self>,
        request: &PredictionRequest,
        is_async: bool,
    ) -> Result<(Arc<Runner>, Arc<PendingPrediction>)> {
        if !self.cfg.use_procedure_mode {
            let runner = {
                let fleet = self.fleet.lock().await;
                fleet[0].clone()
            };
            let runner = runner.ok_or(Error::RunnerNotFound)?;
            let pending = self.allocate_prediction(&runner, request, is_async);
            return Ok((runner, pending));
        }

        let source = request
            .procedure_source_url
            .clone()
            .ok_or(Error::MissingProcedureSource)?;

        // Reuse a warm runner configured from the same procedure.
        {
            let fleet = self.fleet.lock().await;
            for runner in fleet.iter().flatten() {
                if runner.procedure_hash() == Some(source.as_str()) && runner.has_capacity() {
                    let pending = self.allocate_prediction(runner, request, is_async);
                    return Ok((Arc::clone(runner), pending));
                }
            }
        }

        let runner = self.allocate_runner_slot(&source).await?;
        let pending = self.allocate_prediction(&runner, request, is_async);

        // Sync requests block on the fresh runner's setup window (bounded
        // by the caller's assignment deadline).
        if !is_async {
            tokio::select! {
                _ = runner.setup_complete().cancelled() => {}
                _ = pending.cancel_token().cancelled() => return Err(Error::Canceled),
            }
        }
        Ok((runner, pending))
    }

    /// Find a slot for a new procedure runner: the first empty one, or one
    /// holding an idle or defunct runner to evict.
    async fn allocate_runner_slot(self: &Arc<Self>, source: &str) -> Result<Arc<Runner>> {
        let mut fleet = self.fleet.lock().await;

        let index = fleet.iter().position(Option::is_none).or_else(|| {
            fleet.iter().position(|slot| {
                slot.as_ref().is_some_and(|runner| {
                    (runner.status() == RunnerStatus::Ready && runner.is_idle())
                        || runner.status() == RunnerStatus::Defunct
                })
            })
        });
        let Some(index) = index else {
            return Err(Error::NoEmptySlot);
        };

        if let Some(evicted) = fleet[index].take() {
            tracing::info!(runner = %evicted.id(), "evicting runner to free a slot");
            evicted.stop();
        }

        let runner_id = id::runner_id();
        let working_dir = procedure::materialize(
            source,
            &runner_id,
            &self.cfg.working_directory,
            &self.http,
        )
        .await?;
        let runner = self.build_runner(runner_id, working_dir, Some(source.to_string()))?;

        runner.start()?;
        self.spawn_monitor(&runner);
        let cog = runner.config(&self.root).await?;
        metrics::spawn_boot_report(Arc::clone(&runner), &cog, self.http.clone());

        fleet[index] = Some(Arc::clone(&runner));
        Ok(runner)
    }

    async fn create_default_runner(self: &Arc<Self>) -> Result<()> {
        let runner = self.build_runner(
            DEFAULT_RUNNER_ID.to_string(),
            self.cfg.working_directory.clone(),
            None,
        )?;
        runner.start()?;
        self.spawn_monitor(&runner);
        let cog = runner.config(&self.root).await?;
        metrics::spawn_boot_report(Arc::clone(&runner), &cog, self.http.clone());

        self.fleet.lock().await[0] = Some(runner);
        Ok(())
    }

    fn build_runner(
        &self,
        runner_id: String,
        working_dir: PathBuf,
        procedure_hash: Option<String>,
    ) -> Result<Arc<Runner>> {
        let tmp_dir = std::env::temp_dir().join(format!("coglet-{runner_id}"));
        std::fs::create_dir_all(&tmp_dir)?;

        // Isolation applies to per-procedure workers only, and only when
        // the process runs as root inside a container.
        let worker_uid = (procedure_hash.is_some() && env::isolation_enabled()).then(|| {
            uid::free_uid().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to the nobody uid");
                uid::NOBODY_UID
            })
        });

        let command = vec![
            self.cfg.python_command.clone(),
            "-u".to_string(),
            "-m".to_string(),
            "coglet".to_string(),
            "--name".to_string(),
            runner_id.clone(),
            "--ipc-url".to_string(),
            self.cfg.ipc_url.clone(),
            "--working-dir".to_string(),
            working_dir.display().to_string(),
        ];

        Ok(Runner::new(RunnerOptions {
            ctx: RunnerContext {
                id: runner_id,
                working_dir,
                tmp_dir,
                uploader: self.cfg.upload_url.as_ref().map(|_| Arc::clone(&self.uploader)),
                uid: worker_uid,
                cleanup_directories: self.cfg.cleanup_directories.clone(),
            },
            command,
            procedure_hash,
            env_set: self.cfg.env_set.clone(),
            env_unset: self.cfg.env_unset.clone(),
            cleanup_timeout: self.cfg.cleanup_timeout,
            force_shutdown: self.cfg.force_shutdown.clone(),
            http: self.http.clone(),
        }))
    }

    /// Pre-allocate the pending prediction and spawn its watcher. The
    /// watcher-exit finaliser runs strictly in order: finalize response,
    /// remove from the runner map, terminal webhook, one-shot stop,
    /// context cancel.
    fn allocate_prediction(
        self: &Arc<Self>,
        runner: &Arc<Runner>,
        request: &PredictionRequest,
        is_async: bool,
    ) -> Arc<PendingPrediction> {
        let mut request = request.clone();
        let now = Utc::now();
        if request.created_at.is_none() {
            request.created_at = Some(now);
        }
        if request.started_at.is_none() {
            request.started_at = Some(now);
        }

        let upload_url = request
            .output_file_prefix
            .clone()
            .or_else(|| self.cfg.upload_url.clone());

        let pending = PendingPrediction::new(request, Arc::clone(&self.webhook), &self.root, is_async);
        runner.register_pending(Arc::clone(&pending));

        let watcher = Watcher {
            pending: Arc::clone(&pending),
            working_dir: runner.working_dir().to_path_buf(),
            // The runner carries its own uploader handle when the manager
            // is configured for uploads; per-request prefixes fall back to
            // the shared client.
            uploader: runner
                .uploader()
                .unwrap_or_else(|| Arc::clone(&self.uploader)),
            upload_url,
        };

        let manager = Arc::clone(self);
        let runner = Arc::clone(runner);
        let finalized = Arc::clone(&pending);
        tokio::spawn(async move {
            watcher.run().await;
            manager.finalize_prediction(runner, finalized).await;
        });

        pending
    }

    async fn finalize_prediction(
        self: Arc<Self>,
        runner: Arc<Runner>,
        pending: Arc<PendingPrediction>,
    ) {
        pending.with_response(PredictionResponse::finalize);

        // Removal happens before the webhook send so a receiver starting a
        // new request on the same procedure observes the freed slot.
        runner.remove_pending(pending.id());

        if pending.mark_terminal_webhook() {
            let response = pending.response();
            if response.status.is_completed() {
                self.webhook.send_terminal(pending.request(), &response).await;
            }
            self.webhook.forget(pending.id());
        }

        if self.cfg.one_shot {
            runner.stop();
            let exited = tokio::time::timeout(
                self.cfg.cleanup_timeout,
                runner.process_exited().cancelled(),
            )
            .await;
            if exited.is_err() {
                runner.force_kill();
            }
        }

        pending.cancel();
    }

    /// One monitor task per runner subprocess: await exit, drain log
    /// capture, fail out the pending map, then evict (procedure mode) or
    /// mark the runner defunct.
    fn spawn_monitor(self: &Arc<Self>, runner: &Arc<Runner>) {
        let manager = Arc::clone(self);
        let runner = Arc::clone(runner);
        self.monitors.spawn(async move {
            let Some(mut child) = runner.take_child() else {
                return;
            };
            let exit = child.wait().await;
            runner.mark_process_exited();
            tracing::info!(runner = %runner.id(), ?exit, "worker subprocess exited");

            let _ = tokio::time::timeout(
                LOG_CAPTURE_GRACE,
                runner.log_capture_complete().cancelled(),
            )
            .await;

            let crash_logs = runner.captured_logs();
            runner.fail_all_pending("prediction failed", &crash_logs);

            if manager.cfg.use_procedure_mode {
                manager.evict(&runner).await;
            } else {
                runner.mark_defunct();
            }
        });
    }

    async fn evict(&self, runner: &Arc<Runner>) {
        {
            let mut fleet = self.fleet.lock().await;
            for slot in fleet.iter_mut() {
                if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, runner)) {
                    *slot = None;
                }
            }
        }
        runner.stop();
    }

    /// Write the cancel file for a prediction, wherever it lives.
    pub async fn cancel_prediction(&self, prediction_id: &str) -> Result<()> {
        let fleet = self.fleet.lock().await;
        for runner in fleet.iter().flatten() {
            match runner.cancel(prediction_id) {
                Err(Error::PredictionNotFound) => continue,
                result => return result,
            }
        }
        Err(Error::PredictionNotFound)
    }

    /// Route a worker status string to its runner.
    pub async fn handle_runner_ipc(&self, runner_name: &str, status: &str) -> Result<()> {
        let runner = {
            let fleet = self.fleet.lock().await;
            fleet
                .iter()
                .flatten()
                .find(|r| r.id() == runner_name)
                .cloned()
        };
        let runner = runner.ok_or(Error::RunnerNotFound)?;
        runner.handle_ipc(status);
        Ok(())
    }

    pub async fn status(&self) -> RunnerStatus {
        if !self.cfg.use_procedure_mode {
            return self
                .fleet
                .lock()
                .await
                .first()
                .and_then(Option::as_ref)
                .map(|r| r.status())
                .unwrap_or(RunnerStatus::Starting);
        }

        let cleaning = {
            let fleet = self.fleet.lock().await;
            fleet.iter().flatten().any(|r| r.cleanup_in_progress())
        };
        if cleaning || self.capacity.available() == 0 {
            RunnerStatus::Busy
        } else {
            RunnerStatus::Ready
        }
    }

    pub async fn schema(&self) -> Option<String> {
        if self.cfg.use_procedure_mode {
            return Some(PROCEDURE_SCHEMA.to_string());
        }
        let fleet = self.fleet.lock().await;
        fleet.first().and_then(Option::as_ref).and_then(|r| r.schema_raw())
    }

    pub async fn setup_result(&self) -> Option<SetupResult> {
        if self.cfg.use_procedure_mode {
            return Some(SetupResult::succeeded());
        }
        let fleet = self.fleet.lock().await;
        fleet.first().and_then(Option::as_ref).and_then(|r| r.setup_result())
    }

    /// Graceful shutdown, single-shot: broadcast, wait for each runner to
    /// drain (bounded by the grace period), then stop them.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        let snapshot: Vec<Arc<Runner>> = {
            let fleet = self.fleet.lock().await;
            fleet.iter().flatten().cloned().collect()
        };
        for runner in &snapshot {
            runner.graceful_shutdown();
        }

        let grace = self.cfg.runner_shutdown_grace_period;
        futures::future::join_all(snapshot.iter().map(|runner| async move {
            tokio::select! {
                _ = runner.ready_for_shutdown().cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }
            runner.stop();
        }))
        .await;

        self.stopped.cancel();
    }

    /// Forced termination of every runner, then a bounded wait for the
    /// crash monitors to drain.
    pub async fn force_kill_all(&self) {
        let snapshot: Vec<Arc<Runner>> = {
            let fleet = self.fleet.lock().await;
            fleet.iter().flatten().cloned().collect()
        };
        for runner in &snapshot {
            runner.force_kill();
        }

        self.monitors.close();
        let _ = tokio::time::timeout(MONITOR_DRAIN, self.monitors.wait()).await;
    }

    pub async fn wait_for_stop(&self) {
        self.stopped.cancelled().await;
    }
}

/// Fleet capacity: the config file's concurrency limit for in-place model
/// serving (1 on any read error), one for one-shot, otherwise the
/// configured cap or `4 x CPUs`.
fn fleet_size(cfg: &ManagerConfig) -> usize {
    if !cfg.use_procedure_mode {
        return CogConfig::read(&cfg.working_directory)
            .map(|c| c.concurrency.max)
            .unwrap_or(1)
            .max(1);
    }
    if cfg.one_shot {
        return 1;
    }
    cfg.max_runners
        .unwrap_or_else(|| {
            4 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
        .max(1)
}

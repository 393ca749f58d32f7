//! One-shot runner boot metrics.
//!
//! When `COG_METRICS_ENDPOINT` is set, each runner reports a single payload
//! once its setup window closes: the setup outcome and timing plus the
//! project's build flags. Fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{BuildConfig, CogConfig};
use crate::env;
use crate::prediction::SetupStatus;
use crate::runner::Runner;

#[derive(Debug, Serialize)]
struct BootMetrics {
    runner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    setup_status: Option<SetupStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    setup_time_seconds: Option<f64>,
    build: BuildConfig,
}

pub(crate) fn spawn_boot_report(runner: Arc<Runner>, config: &CogConfig, client: reqwest::Client) {
    let Some(endpoint) = env::metrics_endpoint() else {
        return;
    };
    let build = config.build;

    tokio::spawn(async move {
        runner.setup_complete().cancelled().await;

        let setup = runner.setup_result();
        let payload = BootMetrics {
            runner: runner.id().to_string(),
            setup_status: setup.as_ref().map(|s| s.status),
            setup_time_seconds: setup.and_then(|s| match (s.started_at, s.completed_at) {
                (Some(started), Some(completed)) => {
                    Some((completed - started).num_milliseconds() as f64 / 1000.0)
                }
                _ => None,
            }),
            build,
        };

        let result = client
            .post(&endpoint)
            .timeout(Duration::from_secs(5))
            .json(&payload)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to report runner boot metrics");
        }
    });
}

//! Manager configuration and the project config file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub const COG_CONFIG_FILE: &str = "cog.yaml";

/// Top-level manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub use_procedure_mode: bool,
    pub one_shot: bool,
    /// Fleet size cap in procedure mode; `None` means `4 x CPUs`.
    pub max_runners: Option<usize>,
    pub working_directory: PathBuf,
    /// Where workers report IPC status strings (passed on the command line).
    pub ipc_url: String,
    pub upload_url: Option<String>,
    pub python_command: String,
    pub env_set: HashMap<String, String>,
    pub env_unset: Vec<String>,
    /// Directories swept for files owned by a runner's isolated UID.
    pub cleanup_directories: Vec<PathBuf>,
    pub cleanup_timeout: Duration,
    pub runner_shutdown_grace_period: Duration,
    /// Process-wide signal fired when post-kill verification gives up.
    pub force_shutdown: CancellationToken,
}

impl ManagerConfig {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            use_procedure_mode: false,
            one_shot: false,
            max_runners: None,
            working_directory: working_directory.into(),
            ipc_url: String::new(),
            upload_url: None,
            python_command: "python3".to_string(),
            env_set: HashMap::new(),
            env_unset: Vec::new(),
            cleanup_directories: Vec::new(),
            cleanup_timeout: Duration::from_secs(10),
            runner_shutdown_grace_period: Duration::from_secs(30),
            force_shutdown: CancellationToken::new(),
        }
    }

    pub fn with_procedure_mode(mut self) -> Self {
        self.use_procedure_mode = true;
        self
    }

    /// Only meaningful in procedure mode: stop the runner after every
    /// prediction and pin the fleet to a single slot.
    pub fn with_one_shot(mut self, one_shot: bool) -> Self {
        self.one_shot = one_shot;
        self
    }

    pub fn with_max_runners(mut self, n: usize) -> Self {
        self.max_runners = Some(n);
        self
    }

    pub fn with_ipc_url(mut self, url: impl Into<String>) -> Self {
        self.ipc_url = url.into();
        self
    }

    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    pub fn with_python_command(mut self, cmd: impl Into<String>) -> Self {
        self.python_command = cmd.into();
        self
    }
}

/// The project config file. Only three fields matter to the manager;
/// everything else belongs to the build tooling and is ignored here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CogConfig {
    #[serde(default)]
    pub predict: Option<String>,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_concurrency")]
    pub max: usize,
}

fn default_max_concurrency() -> usize {
    1
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max: 1 }
    }
}

/// Build flags copied into the runner-metrics payload.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub fast: bool,
    #[serde(default)]
    pub cog_runtime: bool,
}

impl CogConfig {
    pub fn read(working_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(working_dir.join(COG_CONFIG_FILE))?;
        serde_yaml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Derive the worker-facing predict configuration from the `predict`
    /// reference, e.g. `"predict.py:Predictor"`.
    pub fn predict_config(&self) -> Result<PredictConfig> {
        let reference = self
            .predict
            .as_deref()
            .ok_or_else(|| Error::Config("missing predict field".to_string()))?;

        let mut parts = reference.split(':');
        let (module, symbol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(module), Some(symbol), None) if !module.is_empty() && !symbol.is_empty() => {
                (module, symbol)
            }
            _ => {
                return Err(Error::Config(format!(
                    "invalid predict reference {reference:?}: expected \"<module>:<Symbol>\""
                )));
            }
        };

        Ok(PredictConfig {
            module_name: module.trim_end_matches(".py").to_string(),
            predictor_name: symbol.to_string(),
            max_concurrency: self.concurrency.max,
        })
    }
}

/// `config.json` payload written into the working directory for the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictConfig {
    pub module_name: String,
    pub predictor_name: String,
    pub max_concurrency: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let cfg: CogConfig = serde_yaml::from_str("predict: predict.py:Predictor\n").unwrap();
        assert_eq!(cfg.predict.as_deref(), Some("predict.py:Predictor"));
        assert_eq!(cfg.concurrency.max, 1);
        assert!(!cfg.build.gpu);
    }

    #[test]
    fn parses_concurrency_and_build() {
        let cfg: CogConfig = serde_yaml::from_str(
            "predict: app/model.py:Model\nconcurrency:\n  max: 4\nbuild:\n  gpu: true\n  fast: true\n",
        )
        .unwrap();
        assert_eq!(cfg.concurrency.max, 4);
        assert!(cfg.build.gpu);
        assert!(cfg.build.fast);
        assert!(!cfg.build.cog_runtime);
    }

    #[test]
    fn ignores_unknown_fields() {
        let cfg: CogConfig =
            serde_yaml::from_str("predict: p.py:P\nimage: r8.im/foo\ntrain: t.py:T\n").unwrap();
        assert_eq!(cfg.predict.as_deref(), Some("p.py:P"));
    }

    #[test]
    fn predict_config_splits_reference() {
        let cfg: CogConfig = serde_yaml::from_str("predict: predict.py:Predictor\n").unwrap();
        let pc = cfg.predict_config().unwrap();
        assert_eq!(pc.module_name, "predict");
        assert_eq!(pc.predictor_name, "Predictor");
        assert_eq!(pc.max_concurrency, 1);
    }

    #[test]
    fn predict_config_rejects_malformed_references() {
        for bad in ["predict.py", "a:b:c", ":Predictor", "predict.py:"] {
            let cfg = CogConfig {
                predict: Some(bad.to_string()),
                ..Default::default()
            };
            assert!(cfg.predict_config().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn predict_config_serializes_for_worker() {
        let pc = PredictConfig {
            module_name: "predict".to_string(),
            predictor_name: "Predictor".to_string(),
            max_concurrency: 2,
        };
        insta::assert_json_snapshot!(pc, @r#"
        {
          "module_name": "predict",
          "predictor_name": "Predictor",
          "max_concurrency": 2
        }
        "#);
    }
}

//! Prediction requests, responses, and setup results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::webhook::WebhookEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    #[default]
    Starting,
    Processing,
    Succeeded,
    Canceled,
    Failed,
}

impl PredictionStatus {
    /// Terminal statuses: the prediction will never change again.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Succeeded,
    Failed,
}

/// Outcome of the window between process start and the first READY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResult {
    pub status: SetupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
}

impl SetupResult {
    pub fn succeeded() -> Self {
        Self {
            status: SetupStatus::Succeeded,
            started_at: None,
            completed_at: None,
            logs: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_events_filter: Option<Vec<WebhookEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    /// Grouping key for runner reuse. Internal; never forwarded to workers.
    #[serde(skip)]
    pub procedure_source_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Ordered log lines in memory; one newline-joined string on the wire.
    #[serde(default, with = "joined_lines", skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PredictionResponse {
    /// Initial `starting` response for a freshly accepted request.
    pub fn starting(request: &PredictionRequest) -> Self {
        let mut response = Self {
            status: PredictionStatus::Starting,
            ..Default::default()
        };
        response.populate_from_request(request);
        response
    }

    /// Overwrite the request-derived fields. Response files written by the
    /// worker carry none of these reliably.
    pub fn populate_from_request(&mut self, request: &PredictionRequest) {
        self.id = request.id.clone();
        self.input = request.input.clone();
        self.created_at = request.created_at;
        self.started_at = request.started_at;
    }

    /// Stamp completion on a terminal response.
    ///
    /// Sets `completed_at` iff previously empty and `metrics.predict_time`
    /// iff previously absent. A no-op for non-terminal responses, so it is
    /// safe to call more than once.
    pub fn finalize(&mut self) {
        if !self.status.is_completed() {
            return;
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        if !self.metrics.contains_key("predict_time")
            && let (Some(started), Some(completed)) = (self.started_at, self.completed_at)
        {
            let secs = (completed - started).num_nanoseconds().unwrap_or(0) as f64 / 1e9;
            self.metrics
                .insert("predict_time".to_string(), serde_json::json!(secs));
        }
    }

}

/// Wire form of the `logs` field: lines joined with `\n`, trailing newline
/// when non-empty. The trailing empty split element is dropped on decode.
mod joined_lines {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(lines: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        let mut joined = lines.join("\n");
        if !joined.is_empty() {
            joined.push('\n');
        }
        serializer.serialize_str(&joined)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let mut lines: Vec<String> = raw.split('\n').map(str::to_string).collect();
        if lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminal_set() {
        assert!(!PredictionStatus::Starting.is_completed());
        assert!(!PredictionStatus::Processing.is_completed());
        assert!(PredictionStatus::Succeeded.is_completed());
        assert!(PredictionStatus::Canceled.is_completed());
        assert!(PredictionStatus::Failed.is_completed());
    }

    #[test]
    fn status_wire_form_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&PredictionStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::from_str::<PredictionStatus>("\"canceled\"").unwrap(),
            PredictionStatus::Canceled
        );
    }

    #[test]
    fn logs_round_trip() {
        let response = PredictionResponse {
            id: "abc".to_string(),
            logs: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };

        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["logs"], serde_json::json!("a\nb\n"));

        let decoded: PredictionResponse = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.logs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_logs_omitted_on_wire() {
        let response = PredictionResponse {
            id: "abc".to_string(),
            ..Default::default()
        };
        let wire = serde_json::to_value(&response).unwrap();
        assert!(wire.get("logs").is_none());

        let decoded: PredictionResponse = serde_json::from_value(wire).unwrap();
        assert!(decoded.logs.is_empty());
    }

    #[test]
    fn logs_with_embedded_empty_line_survive() {
        let response = PredictionResponse {
            logs: vec!["a".to_string(), String::new(), "b".to_string()],
            ..Default::default()
        };
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["logs"], serde_json::json!("a\n\nb\n"));

        let decoded: PredictionResponse = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.logs.len(), 3);
    }

    #[test]
    fn finalize_stamps_completed_at_and_predict_time() {
        let started = "2024-01-01T00:00:00Z".parse().unwrap();
        let mut response = PredictionResponse {
            status: PredictionStatus::Succeeded,
            started_at: Some(started),
            ..Default::default()
        };

        response.finalize();
        assert!(response.completed_at.is_some());
        let predict_time = response.metrics["predict_time"].as_f64().unwrap();
        assert!(predict_time >= 0.0);
    }

    #[test]
    fn finalize_is_idempotent() {
        let started = "2024-01-01T00:00:00Z".parse().unwrap();
        let completed = "2024-01-01T00:00:02Z".parse().unwrap();
        let mut response = PredictionResponse {
            status: PredictionStatus::Succeeded,
            started_at: Some(started),
            completed_at: Some(completed),
            ..Default::default()
        };

        response.finalize();
        assert_eq!(response.completed_at, Some(completed));
        assert_eq!(response.metrics["predict_time"], serde_json::json!(2.0));

        let snapshot = response.clone();
        response.finalize();
        assert_eq!(response.completed_at, snapshot.completed_at);
        assert_eq!(response.metrics, snapshot.metrics);
    }

    #[test]
    fn finalize_ignores_non_terminal() {
        let mut response = PredictionResponse {
            status: PredictionStatus::Processing,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        response.finalize();
        assert!(response.completed_at.is_none());
        assert!(!response.metrics.contains_key("predict_time"));
    }

    #[test]
    fn finalize_preserves_existing_predict_time() {
        let mut response = PredictionResponse {
            status: PredictionStatus::Succeeded,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        response
            .metrics
            .insert("predict_time".to_string(), serde_json::json!(1.25));
        response.finalize();
        assert_eq!(response.metrics["predict_time"], serde_json::json!(1.25));
    }

    #[test]
    fn starting_echoes_request_fields() {
        let request = PredictionRequest {
            id: "abc".to_string(),
            input: serde_json::json!({"prompt": "hi"}),
            created_at: Some(Utc::now()),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let response = PredictionResponse::starting(&request);
        assert_eq!(response.id, "abc");
        assert_eq!(response.status, PredictionStatus::Starting);
        assert_eq!(response.input, request.input);
        assert_eq!(response.created_at, request.created_at);
    }

    #[test]
    fn procedure_source_url_never_serialized() {
        let request = PredictionRequest {
            id: "abc".to_string(),
            procedure_source_url: Some("file:///src".to_string()),
            ..Default::default()
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert!(wire.get("procedure_source_url").is_none());
    }
}

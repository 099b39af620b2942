//! # MLflow Tracking
//!
//! Minimal blocking client for the MLflow REST API 2.0. Images and model
//! files are uploaded through the tracking server's artifact proxy
//! (`mlflow-artifacts:` URIs).

use std::fs;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{Result, TrackingError};
use crate::tracker::{Metrics, Tracker, flatten_params, now_millis};

const BACKEND: &str = "mlflow";
const API: &str = "api/2.0/mlflow";
const ARTIFACT_API: &str = "api/2.0/mlflow-artifacts/artifacts";
const PROXY_SCHEME: &str = "mlflow-artifacts:/";
/// Server-side limit on params per `log-batch` call.
const MAX_PARAMS_PER_BATCH: usize = 100;
const MAX_PARAM_VALUE_LEN: usize = 500;

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreatedExperiment {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunEnvelope {
    run: Run,
}

#[derive(Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
    #[serde(default)]
    artifact_uri: String,
}

/// An open MLflow run.
pub struct MlflowTracker {
    client: Client,
    base_url: String,
    experiment_id: String,
    run_id: String,
    artifact_uri: String,
    finished: bool,
}

impl MlflowTracker {
    /// Get or create `experiment` and start a run in it.
    pub fn start(base_url: &str, experiment: &str, run_name: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("semseg/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let experiment_id = Self::resolve_experiment(&client, &base_url, experiment)?;
        let body = json!({
            "experiment_id": experiment_id,
            "run_name": run_name,
            "start_time": now_millis(),
        });
        let resp = send(
            client.post(format!("{base_url}/{API}/runs/create")).json(&body),
            "runs/create",
        )?;
        let run: RunEnvelope = resp.json()?;

        info!(
            experiment,
            experiment_id = %experiment_id,
            run_id = %run.run.info.run_id,
            "mlflow run started"
        );
        Ok(Self {
            client,
            base_url,
            experiment_id,
            run_id: run.run.info.run_id,
            artifact_uri: run.run.info.artifact_uri,
            finished: false,
        })
    }

    fn resolve_experiment(client: &Client, base_url: &str, name: &str) -> Result<String> {
        let resp = client
            .get(format!("{base_url}/{API}/experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()?;
        if resp.status().is_success() {
            let found: ExperimentEnvelope = resp.json()?;
            return Ok(found.experiment.experiment_id);
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(status_error(resp, "experiments/get-by-name"));
        }

        debug!(name, "creating mlflow experiment");
        let resp = send(
            client
                .post(format!("{base_url}/{API}/experiments/create"))
                .json(&json!({ "name": name })),
            "experiments/create",
        )?;
        let created: CreatedExperiment = resp.json()?;
        Ok(created.experiment_id)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(TrackingError::Finished(BACKEND.into()));
        }
        Ok(())
    }

    /// PUT `path` to `<run artifacts>/<key>/<file name>`.
    fn upload(&self, key: &str, path: &Path, content_type: &str) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TrackingError::Protocol {
                backend: BACKEND,
                reason: format!("artifact path has no file name: {}", path.display()),
            })?;
        let url = artifact_upload_url(&self.base_url, &self.artifact_uri, key, file_name)?;
        let bytes = fs::read(path)?;
        send(
            self.client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes),
            "mlflow-artifacts",
        )?;
        debug!(key, file = file_name, "artifact uploaded");
        Ok(())
    }

    fn log_batch(&self, body: Value) -> Result<()> {
        send(
            self.client
                .post(format!("{}/{API}/runs/log-batch", self.base_url))
                .json(&body),
            "runs/log-batch",
        )?;
        Ok(())
    }
}

impl Tracker for MlflowTracker {
    fn name(&self) -> &str {
        BACKEND
    }

    fn log_config(&mut self, config: &Value) -> Result<()> {
        self.ensure_open()?;
        let params: Vec<Value> = flatten_params(config)
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "value": truncate(&value, MAX_PARAM_VALUE_LEN) }))
            .collect();
        for chunk in params.chunks(MAX_PARAMS_PER_BATCH) {
            self.log_batch(json!({ "run_id": self.run_id, "params": chunk }))?;
        }
        Ok(())
    }

    fn set_tags(&mut self, tags: &[(&str, &str)]) -> Result<()> {
        self.ensure_open()?;
        let tags: Vec<Value> = tags
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        self.log_batch(json!({ "run_id": self.run_id, "tags": tags }))
    }

    fn log_metrics(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        self.ensure_open()?;
        if metrics.is_empty() {
            return Ok(());
        }
        let timestamp = now_millis();
        let metrics: Vec<Value> = metrics
            .iter()
            .map(|(key, value)| {
                json!({ "key": key, "value": value, "timestamp": timestamp, "step": step })
            })
            .collect();
        self.log_batch(json!({ "run_id": self.run_id, "metrics": metrics }))
    }

    fn log_image(&mut self, key: &str, path: &Path, _step: u64) -> Result<()> {
        self.ensure_open()?;
        self.upload(key, path, "image/png")
    }

    fn log_artifact(&mut self, key: &str, path: &Path) -> Result<()> {
        self.ensure_open()?;
        self.upload(key, path, "application/octet-stream")
    }

    fn finish(&mut self) -> Result<()> {
        self.ensure_open()?;
        send(
            self.client
                .post(format!("{}/{API}/runs/update", self.base_url))
                .json(&json!({
                    "run_id": self.run_id,
                    "status": "FINISHED",
                    "end_time": now_millis(),
                })),
            "runs/update",
        )?;
        self.finished = true;
        info!(run_id = %self.run_id, "mlflow run finished");
        Ok(())
    }
}

/// Upload URL for an artifact proxied by the tracking server.
pub fn artifact_upload_url(
    base_url: &str,
    artifact_uri: &str,
    key: &str,
    file_name: &str,
) -> Result<String> {
    let rest = artifact_uri
        .strip_prefix(PROXY_SCHEME)
        .ok_or_else(|| TrackingError::Protocol {
            backend: BACKEND,
            reason: format!("artifact store {artifact_uri:?} is not served by the tracking server"),
        })?;
    let rest = rest.trim_matches('/');
    Ok(format!("{base_url}/{ARTIFACT_API}/{rest}/{key}/{file_name}"))
}

fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

fn send(request: reqwest::blocking::RequestBuilder, endpoint: &str) -> Result<Response> {
    let resp = request.send()?;
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(status_error(resp, endpoint))
    }
}

fn status_error(resp: Response, endpoint: &str) -> TrackingError {
    let status = resp.status().as_u16();
    let body = resp.text().unwrap_or_default();
    TrackingError::Status {
        backend: BACKEND,
        endpoint: endpoint.to_string(),
        status,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_upload_url() {
        let url = artifact_upload_url(
            "http://127.0.0.1:5000",
            "mlflow-artifacts:/1/abc123/artifacts",
            "predictions",
            "train-predictions.png",
        )
        .unwrap();
        assert_eq!(
            url,
            "http://127.0.0.1:5000/api/2.0/mlflow-artifacts/artifacts/1/abc123/artifacts/predictions/train-predictions.png"
        );
    }

    #[test]
    fn test_artifact_upload_url_rejects_local_store() {
        let err = artifact_upload_url("http://x", "file:///tmp/mlruns/1/abc/artifacts", "k", "f.png");
        assert!(matches!(err, Err(TrackingError::Protocol { .. })));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ééé", 3), "é");
    }
}

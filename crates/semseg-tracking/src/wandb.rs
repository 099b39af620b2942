//! # Weights & Biases Tracking
//!
//! Blocking client speaking the same endpoints as the official SDK: runs are
//! created and updated through the GraphQL `upsertBucket` mutation, history
//! rows are streamed to the run's `file_stream` endpoint, and media and
//! model files are uploaded to signed URLs from `createRunFiles`.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::{Result, TrackingError};
use crate::tracker::{Metrics, Tracker, generate_run_id, now_millis};

const BACKEND: &str = "wandb";
pub const DEFAULT_BASE_URL: &str = "https://api.wandb.ai";
pub const API_KEY_ENV: &str = "WANDB_API_KEY";
const HISTORY_FILE: &str = "wandb-history.jsonl";
const SUMMARY_FILE: &str = "wandb-summary.json";

const UPSERT_BUCKET: &str = r#"
mutation UpsertBucket($id: String, $name: String, $project: String, $entity: String, $displayName: String, $config: JSONString, $tags: [String!]) {
  upsertBucket(input: {id: $id, name: $name, modelName: $project, entityName: $entity, displayName: $displayName, config: $config, tags: $tags}) {
    bucket { id name project { name entity { name } } }
  }
}
"#;

const CREATE_RUN_FILES: &str = r#"
mutation CreateRunFiles($entity: String!, $project: String!, $run: String!, $files: [String!]!) {
  createRunFiles(input: {entityName: $entity, projectName: $project, runName: $run, files: $files}) {
    files { name uploadUrl }
  }
}
"#;

/// Connection settings for a W&B server.
#[derive(Debug, Clone)]
pub struct WandbSettings {
    pub base_url: String,
    pub api_key: String,
    pub entity: Option<String>,
}

impl WandbSettings {
    /// Read the API key from `WANDB_API_KEY`.
    pub fn from_env(base_url: Option<&str>, entity: Option<&str>) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| TrackingError::MissingCredentials(API_KEY_ENV.into()))?;
        Ok(Self {
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            api_key,
            entity: entity.map(str::to_string),
        })
    }
}

/// An open W&B run.
pub struct WandbTracker {
    client: Client,
    settings: WandbSettings,
    entity: String,
    project: String,
    run_id: String,
    /// GraphQL node id, needed to update the run later.
    bucket_id: Option<String>,
    tags: Vec<String>,
    history_offset: usize,
    summary: Map<String, Value>,
    started: Instant,
    finished: bool,
}

impl WandbTracker {
    /// Create a run named `display_name` in `project`.
    pub fn start(settings: WandbSettings, project: &str, display_name: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("semseg/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let run_id = generate_run_id();

        let mut tracker = Self {
            client,
            entity: settings.entity.clone().unwrap_or_default(),
            settings,
            project: project.to_string(),
            run_id,
            bucket_id: None,
            tags: Vec::new(),
            history_offset: 0,
            summary: Map::new(),
            started: Instant::now(),
            finished: false,
        };

        let data = tracker.upsert(json!({ "displayName": display_name }))?;
        let bucket = &data["upsertBucket"]["bucket"];
        tracker.bucket_id = bucket["id"].as_str().map(str::to_string);
        if let Some(entity) = bucket["project"]["entity"]["name"].as_str() {
            tracker.entity = entity.to_string();
        }
        if tracker.entity.is_empty() {
            return Err(protocol("server did not report an entity for the run"));
        }

        info!(
            entity = %tracker.entity,
            project,
            run_id = %tracker.run_id,
            "wandb run started"
        );
        Ok(tracker)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_url(&self) -> String {
        let app = self.settings.base_url.replace("://api.", "://");
        format!("{app}/{}/{}/runs/{}", self.entity, self.project, self.run_id)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth("api", Some(&self.settings.api_key))
    }

    fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let request = self
            .client
            .post(format!("{}/graphql", self.settings.base_url))
            .json(&json!({ "query": query, "variables": variables }));
        let resp = self.authed(request).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TrackingError::Status {
                backend: BACKEND,
                endpoint: "graphql".into(),
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }
        let mut body: Value = resp.json()?;
        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(protocol(format!("graphql errors: {errors}")));
        }
        Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    /// `upsertBucket` with the run identity filled in plus `extra` variables.
    fn upsert(&self, extra: Value) -> Result<Value> {
        let entity = (!self.entity.is_empty()).then_some(self.entity.as_str());
        let mut variables = json!({
            "id": self.bucket_id,
            "name": self.run_id,
            "project": self.project,
            "entity": entity,
        });
        if let (Some(vars), Value::Object(extra)) = (variables.as_object_mut(), extra) {
            vars.extend(extra);
        }
        self.graphql(UPSERT_BUCKET, variables)
    }

    fn file_stream(&self, body: Value) -> Result<()> {
        let url = format!(
            "{}/files/{}/{}/{}/file_stream",
            self.settings.base_url, self.entity, self.project, self.run_id
        );
        let resp = self.authed(self.client.post(url).json(&body)).send()?;
        if !resp.status().is_success() {
            return Err(TrackingError::Status {
                backend: BACKEND,
                endpoint: "file_stream".into(),
                status: resp.status().as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn push_history(&mut self, step: u64, mut row: Map<String, Value>) -> Result<()> {
        row.insert("_step".into(), json!(step));
        row.insert("_runtime".into(), json!(self.started.elapsed().as_secs_f64()));
        row.insert("_timestamp".into(), json!(now_millis() as f64 / 1000.0));
        for (key, value) in &row {
            if !key.starts_with('_') {
                self.summary.insert(key.clone(), value.clone());
            }
        }
        let line = Value::Object(row).to_string();

        self.file_stream(json!({
            "files": {
                HISTORY_FILE: { "offset": self.history_offset, "content": [line] },
                SUMMARY_FILE: { "offset": 0, "content": [Value::Object(self.summary.clone()).to_string()] },
            }
        }))?;
        self.history_offset += 1;
        Ok(())
    }

    /// Register `remote` with the run and PUT the file to its signed URL.
    /// Returns the uploaded size in bytes.
    fn upload_file(&self, remote: &str, path: &Path) -> Result<usize> {
        let data = self.graphql(
            CREATE_RUN_FILES,
            json!({
                "entity": self.entity,
                "project": self.project,
                "run": self.run_id,
                "files": [remote],
            }),
        )?;
        let upload_url = data["createRunFiles"]["files"]
            .as_array()
            .and_then(|files| files.iter().find(|f| f["name"] == remote))
            .and_then(|f| f["uploadUrl"].as_str())
            .ok_or_else(|| protocol(format!("no upload url returned for {remote}")))?
            .to_string();

        let bytes = fs::read(path)?;
        let size = bytes.len();
        let resp = self.client.put(&upload_url).body(bytes).send()?;
        if !resp.status().is_success() {
            return Err(TrackingError::Status {
                backend: BACKEND,
                endpoint: "file upload".into(),
                status: resp.status().as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }
        Ok(size)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(TrackingError::Finished(BACKEND.into()));
        }
        Ok(())
    }
}

impl Tracker for WandbTracker {
    fn name(&self) -> &str {
        BACKEND
    }

    fn log_config(&mut self, config: &Value) -> Result<()> {
        self.ensure_open()?;
        self.upsert(json!({ "config": wandb_config(config).to_string() }))?;
        Ok(())
    }

    /// W&B tags are plain labels; only the values are kept.
    fn set_tags(&mut self, tags: &[(&str, &str)]) -> Result<()> {
        self.ensure_open()?;
        for (_, value) in tags {
            if !self.tags.iter().any(|t| t == value) {
                self.tags.push(value.to_string());
            }
        }
        self.upsert(json!({ "tags": self.tags }))?;
        Ok(())
    }

    fn log_metrics(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        self.ensure_open()?;
        if metrics.is_empty() {
            return Ok(());
        }
        let row = metrics.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
        self.push_history(step, row)
    }

    fn log_image(&mut self, key: &str, path: &Path, step: u64) -> Result<()> {
        self.ensure_open()?;
        let file_name = file_name(path)?;
        let remote = format!("media/images/{key}_{step}_{file_name}");
        let size = self.upload_file(&remote, path)?;
        debug!(key, remote = %remote, "image uploaded");

        let mut row = Map::new();
        row.insert(
            key.to_string(),
            json!({ "_type": "image-file", "path": remote, "size": size, "format": "png" }),
        );
        self.push_history(step, row)
    }

    fn log_artifact(&mut self, key: &str, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let remote = format!("artifacts/{key}/{}", file_name(path)?);
        let size = self.upload_file(&remote, path)?;
        debug!(key, remote = %remote, size, "artifact uploaded");
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.file_stream(json!({ "complete": true, "exitcode": 0 }))?;
        self.finished = true;
        info!(url = %self.run_url(), "wandb run finished");
        Ok(())
    }
}

/// W&B stores each top-level config key as `{"value": ...}`.
pub fn wandb_config(config: &Value) -> Value {
    let mut out = Map::new();
    match config {
        Value::Object(map) => {
            for (key, value) in map {
                out.insert(key.clone(), json!({ "value": value }));
            }
        }
        other => {
            out.insert("config".into(), json!({ "value": other }));
        }
    }
    Value::Object(out)
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| protocol(format!("upload path has no file name: {}", path.display())))
}

fn protocol(reason: impl Into<String>) -> TrackingError {
    TrackingError::Protocol {
        backend: BACKEND,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_wraps_top_level_keys() {
        let cfg = json!({ "experiment": { "name": "sem" }, "loss": { "name": "dice" } });
        let wrapped = wandb_config(&cfg);
        assert_eq!(wrapped["experiment"]["value"]["name"], "sem");
        assert_eq!(wrapped["loss"]["value"]["name"], "dice");
    }

    #[test]
    fn test_run_url_points_at_app_host() {
        let tracker = WandbTracker {
            client: Client::new(),
            settings: WandbSettings {
                base_url: DEFAULT_BASE_URL.into(),
                api_key: "k".into(),
                entity: None,
            },
            entity: "lab".into(),
            project: "sem-seg".into(),
            run_id: "abcd1234".into(),
            bucket_id: None,
            tags: Vec::new(),
            history_offset: 0,
            summary: Map::new(),
            started: Instant::now(),
            finished: true,
        };
        assert_eq!(tracker.run_url(), "https://wandb.ai/lab/sem-seg/runs/abcd1234");
        let mut tracker = tracker;
        assert!(matches!(
            tracker.log_metrics(0, &Metrics::new()),
            Err(TrackingError::Finished(_))
        ));
    }
}

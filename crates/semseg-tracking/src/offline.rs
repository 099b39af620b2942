//! Filesystem-backed tracking for runs without network access.
//!
//! Layout per run:
//!
//! ```text
//! <root>/<backend>/<run-id>/meta.json
//! <root>/<backend>/<run-id>/metrics.jsonl
//! <root>/<backend>/<run-id>/media/<key>/<file>
//! <root>/<backend>/<run-id>/artifacts/<key>/<file>
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::error::{Result, TrackingError};
use crate::tracker::{Metrics, Tracker, generate_run_id, now_millis};

/// Run metadata persisted as `meta.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub backend: String,
    pub experiment: String,
    pub run_id: String,
    pub run_name: String,
    pub status: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub tags: Vec<(String, String)>,
    pub config: Value,
}

pub struct OfflineTracker {
    name: String,
    dir: PathBuf,
    meta: RunMeta,
    metrics: BufWriter<File>,
}

impl OfflineTracker {
    /// Create `<root>/<backend>/<run-id>/`.
    pub fn start(root: &Path, backend: &str, experiment: &str, run_name: &str) -> Result<Self> {
        let run_id = generate_run_id();
        let dir = root.join(backend).join(&run_id);
        fs::create_dir_all(dir.join("media"))?;

        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;

        let tracker = Self {
            name: format!("{backend}-offline"),
            dir,
            meta: RunMeta {
                backend: backend.to_string(),
                experiment: experiment.to_string(),
                run_id,
                run_name: run_name.to_string(),
                status: "RUNNING".into(),
                start_time: now_millis(),
                end_time: None,
                tags: Vec::new(),
                config: Value::Null,
            },
            metrics: BufWriter::new(metrics),
        };
        tracker.write_meta()?;
        info!(dir = %tracker.dir.display(), "offline run started");
        Ok(tracker)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    fn write_meta(&self) -> Result<()> {
        let file = File::create(self.dir.join("meta.json"))?;
        serde_json::to_writer_pretty(file, &self.meta)?;
        Ok(())
    }

    /// Copy `path` into `<run>/<section>/<key>/`; returns the file name.
    fn store(&self, section: &str, key: &str, path: &Path) -> Result<String> {
        let file_name = path.file_name().ok_or_else(|| TrackingError::Protocol {
            backend: "offline",
            reason: format!("path has no file name: {}", path.display()),
        })?;
        let target = self.dir.join(section).join(key);
        fs::create_dir_all(&target)?;
        fs::copy(path, target.join(file_name))?;
        Ok(file_name.to_string_lossy().into_owned())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.meta.end_time.is_some() {
            return Err(TrackingError::Finished(self.name.clone()));
        }
        Ok(())
    }
}

impl Tracker for OfflineTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn log_config(&mut self, config: &Value) -> Result<()> {
        self.ensure_open()?;
        self.meta.config = config.clone();
        self.write_meta()
    }

    fn set_tags(&mut self, tags: &[(&str, &str)]) -> Result<()> {
        self.ensure_open()?;
        for (key, value) in tags {
            self.meta.tags.retain(|(k, _)| k != key);
            self.meta.tags.push((key.to_string(), value.to_string()));
        }
        self.write_meta()
    }

    fn log_metrics(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        self.ensure_open()?;
        let line = json!({ "step": step, "timestamp": now_millis(), "metrics": metrics });
        writeln!(self.metrics, "{line}")?;
        Ok(())
    }

    fn log_image(&mut self, key: &str, path: &Path, step: u64) -> Result<()> {
        self.ensure_open()?;
        let file_name = self.store("media", key, path)?;
        let line = json!({
            "step": step,
            "timestamp": now_millis(),
            "image": { "key": key, "file": file_name },
        });
        writeln!(self.metrics, "{line}")?;
        Ok(())
    }

    fn log_artifact(&mut self, key: &str, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let file_name = self.store("artifacts", key, path)?;
        info!(key, file = %file_name, "artifact stored");
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.metrics.flush()?;
        self.meta.status = "FINISHED".into();
        self.meta.end_time = Some(now_millis());
        self.write_meta()
    }
}

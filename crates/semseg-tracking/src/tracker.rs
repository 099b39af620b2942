//! # Tracker Interface
//!
//! Every tracking destination (MLflow, W&B, offline files, the fan-out
//! composite) implements [`Tracker`]. Handles are passed explicitly to the
//! code that logs; there is no process-global "active run".

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::Result;

/// Named scalar values logged at one step.
pub type Metrics = BTreeMap<String, f64>;

/// A remote or local logging destination for one training run.
pub trait Tracker {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Snapshot of the fully resolved run configuration.
    fn log_config(&mut self, config: &Value) -> Result<()>;

    fn set_tags(&mut self, tags: &[(&str, &str)]) -> Result<()>;

    fn log_metrics(&mut self, step: u64, metrics: &Metrics) -> Result<()>;

    /// Upload an image file under `key`.
    fn log_image(&mut self, key: &str, path: &Path, step: u64) -> Result<()>;

    /// Upload a file (model weights, checkpoints) under `key`.
    fn log_artifact(&mut self, key: &str, path: &Path) -> Result<()>;

    /// Mark the run as finished. Further calls are errors.
    fn finish(&mut self) -> Result<()>;
}

impl<T: Tracker + ?Sized> Tracker for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn log_config(&mut self, config: &Value) -> Result<()> {
        (**self).log_config(config)
    }

    fn set_tags(&mut self, tags: &[(&str, &str)]) -> Result<()> {
        (**self).set_tags(tags)
    }

    fn log_metrics(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        (**self).log_metrics(step, metrics)
    }

    fn log_image(&mut self, key: &str, path: &Path, step: u64) -> Result<()> {
        (**self).log_image(key, path, step)
    }

    fn log_artifact(&mut self, key: &str, path: &Path) -> Result<()> {
        (**self).log_artifact(key, path)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Flatten nested JSON into dotted `key = value` pairs.
///
/// Arrays keep their JSON text; strings are unquoted.
pub fn flatten_params(config: &Value) -> Vec<(String, String)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, child, out);
                }
            }
            Value::String(s) => out.push((prefix.to_string(), s.clone())),
            Value::Null => out.push((prefix.to_string(), "null".to_string())),
            other => out.push((prefix.to_string(), other.to_string())),
        }
    }

    let mut out = Vec::new();
    walk("", config, &mut out);
    out
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Random lowercase run id, W&B style.
pub fn generate_run_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut rng = oorandom::Rand32::new((nanos as u64) ^ u64::from(std::process::id()));
    (0..8)
        .map(|_| ALPHABET[rng.rand_range(0..ALPHABET.len() as u32) as usize] as char)
        .collect()
}

//! In-process tracker that records every call. Built for this crate's tests
//! and, through the `testing` feature, for downstream test suites.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::Result;
use crate::tracker::{Metrics, Tracker};

/// One recorded tracker call.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Config(Value),
    Tags(Vec<(String, String)>),
    Metrics { step: u64, metrics: Metrics },
    Image { key: String, path: PathBuf, step: u64 },
    Artifact { key: String, path: PathBuf },
    Finish,
}

/// Cheaply cloneable; clones share the same event log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTracker {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Every value logged under `key`, in order.
    pub fn metric_series(&self, key: &str) -> Vec<(u64, f64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Metrics { step, metrics } => metrics.get(key).map(|v| (step, *v)),
                _ => None,
            })
            .collect()
    }

    pub fn images(&self) -> Vec<(String, PathBuf)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Image { key, path, .. } => Some((key, path)),
                _ => None,
            })
            .collect()
    }

    pub fn artifacts(&self) -> Vec<(String, PathBuf)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Artifact { key, path } => Some((key, path)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Tracker for MemoryTracker {
    fn name(&self) -> &str {
        "memory"
    }

    fn log_config(&mut self, config: &Value) -> Result<()> {
        self.record(Event::Config(config.clone()));
        Ok(())
    }

    fn set_tags(&mut self, tags: &[(&str, &str)]) -> Result<()> {
        let tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.record(Event::Tags(tags));
        Ok(())
    }

    fn log_metrics(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        self.record(Event::Metrics {
            step,
            metrics: metrics.clone(),
        });
        Ok(())
    }

    fn log_image(&mut self, key: &str, path: &Path, step: u64) -> Result<()> {
        self.record(Event::Image {
            key: key.to_string(),
            path: path.to_path_buf(),
            step,
        });
        Ok(())
    }

    fn log_artifact(&mut self, key: &str, path: &Path) -> Result<()> {
        self.record(Event::Artifact {
            key: key.to_string(),
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.record(Event::Finish);
        Ok(())
    }
}

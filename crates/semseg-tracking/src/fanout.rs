//! Composite tracker that forwards every call to all of its backends.
//!
//! Backends are independent: a failure in one never prevents the call from
//! reaching the others. What happens afterwards is decided by the
//! [`FailurePolicy`].

use std::path::Path;

use semseg_core::config::FailurePolicy;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, TrackingError};
use crate::tracker::{Metrics, Tracker};

pub struct TrackerFanout {
    trackers: Vec<Box<dyn Tracker>>,
    policy: FailurePolicy,
}

impl TrackerFanout {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            trackers: Vec::new(),
            policy,
        }
    }

    pub fn with(mut self, tracker: impl Tracker + 'static) -> Self {
        self.push(tracker);
        self
    }

    pub fn push(&mut self, tracker: impl Tracker + 'static) {
        self.trackers.push(Box::new(tracker));
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.trackers.iter().map(|t| t.name()).collect()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    fn broadcast<F>(&mut self, op: &str, mut call: F) -> Result<()>
    where
        F: FnMut(&mut dyn Tracker) -> Result<()>,
    {
        let mut failures = Vec::new();
        for tracker in &mut self.trackers {
            if let Err(err) = call(tracker.as_mut()) {
                failures.push(TrackingError::Backend {
                    backend: tracker.name().to_string(),
                    source: Box::new(err),
                });
            }
        }

        let all_failed = !self.trackers.is_empty() && failures.len() == self.trackers.len();
        let mut failures = failures.into_iter();
        let Some(first) = failures.next() else {
            return Ok(());
        };

        match self.policy {
            FailurePolicy::Abort => Err(first),
            FailurePolicy::Warn if all_failed => Err(first),
            FailurePolicy::Warn => {
                for err in std::iter::once(first).chain(failures) {
                    warn!(op, error = %err, "tracking backend failed, continuing");
                }
                Ok(())
            }
        }
    }
}

impl Tracker for TrackerFanout {
    fn name(&self) -> &str {
        "fanout"
    }

    fn log_config(&mut self, config: &Value) -> Result<()> {
        self.broadcast("log_config", |t| t.log_config(config))
    }

    fn set_tags(&mut self, tags: &[(&str, &str)]) -> Result<()> {
        self.broadcast("set_tags", |t| t.set_tags(tags))
    }

    fn log_metrics(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        self.broadcast("log_metrics", |t| t.log_metrics(step, metrics))
    }

    fn log_image(&mut self, key: &str, path: &Path, step: u64) -> Result<()> {
        self.broadcast("log_image", |t| t.log_image(key, path, step))
    }

    fn log_artifact(&mut self, key: &str, path: &Path) -> Result<()> {
        self.broadcast("log_artifact", |t| t.log_artifact(key, path))
    }

    fn finish(&mut self) -> Result<()> {
        self.broadcast("finish", |t| t.finish())
    }
}

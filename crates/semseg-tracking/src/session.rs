//! Opening the tracking sessions for a run.

use std::path::PathBuf;

use semseg_core::Config;
use tracing::info;

use crate::error::Result;
use crate::fanout::TrackerFanout;
use crate::mlflow::MlflowTracker;
use crate::offline::OfflineTracker;
use crate::tracker::Tracker;
use crate::wandb::{WandbSettings, WandbTracker};

pub const MLFLOW_URI_ENV: &str = "MLFLOW_TRACKING_URI";
pub const DEFAULT_MLFLOW_URI: &str = "http://127.0.0.1:5000";
pub const DEFAULT_OFFLINE_DIR: &str = "runs";

/// MLflow server from config, then `MLFLOW_TRACKING_URI`, then localhost.
pub fn mlflow_uri(config: &Config) -> String {
    config
        .tracking
        .mlflow_uri
        .clone()
        .or_else(|| std::env::var(MLFLOW_URI_ENV).ok())
        .unwrap_or_else(|| DEFAULT_MLFLOW_URI.to_string())
}

/// Display name shared by both sessions, e.g. `unet-small-dice`.
pub fn run_name(config: &Config) -> String {
    format!(
        "{}-{}-{}",
        config.model.name, config.model.encoder, config.loss.name
    )
}

/// Open the MLflow and W&B sessions for `config`, tag them with the model
/// and loss names and snapshot the resolved configuration.
pub fn open_sessions(config: &Config) -> Result<TrackerFanout> {
    let tracking = &config.tracking;
    let experiment = &config.experiment.name;
    let name = run_name(config);

    let mut fanout = TrackerFanout::new(tracking.on_partial_failure);
    if tracking.offline {
        let root = tracking
            .offline_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OFFLINE_DIR));
        fanout.push(OfflineTracker::start(&root, "mlflow", experiment, &name)?);
        fanout.push(OfflineTracker::start(&root, "wandb", experiment, &name)?);
    } else {
        fanout.push(MlflowTracker::start(&mlflow_uri(config), experiment, &name)?);
        let settings = WandbSettings::from_env(
            tracking.wandb_base_url.as_deref(),
            tracking.wandb_entity.as_deref(),
        )?;
        fanout.push(WandbTracker::start(settings, experiment, &name)?);
    }

    let model = config.model.name.to_string();
    let loss = config.loss.name.to_string();
    fanout.set_tags(&[("model", model.as_str()), ("loss", loss.as_str())])?;
    fanout.log_config(&config.to_json())?;

    info!(backends = ?fanout.names(), run = %name, "tracking sessions open");
    Ok(fanout)
}

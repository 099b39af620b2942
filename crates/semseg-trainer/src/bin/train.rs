//! Train a segmentation model from a TOML run configuration.
//!
//! ```text
//! train --config-dir configs --config-name config experiment.num_epochs=5 +tracking.offline=true
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use semseg_core::Config;
use semseg_tracking::{Tracker, open_sessions};
use tracing::{info, warn};

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train a semantic segmentation model on SEM images")]
#[command(version)]
struct Cli {
    /// Directory holding run configurations
    #[arg(long, default_value = "configs")]
    config_dir: PathBuf,

    /// Configuration file name, without the `.toml` extension
    #[arg(long, default_value = "config")]
    config_name: String,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// `key.path=value` overrides; prefix with `+` to add a key
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config_dir, &cli.config_name, &cli.overrides)
        .with_context(|| {
            format!(
                "loading {}/{}.toml",
                cli.config_dir.display(),
                cli.config_name
            )
        })?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config.to_json())?);
        return Ok(());
    }

    info!(experiment = %config.experiment.name, "starting run");
    let mut sessions = open_sessions(&config).context("opening tracking sessions")?;

    let outcome = semseg_trainer::run(&config, Path::new("."), &mut sessions);
    let finished = sessions.finish();

    let report = outcome.context("training run failed")?;
    if let Err(e) = finished {
        warn!(error = %e, "tracking sessions did not close cleanly");
    }

    info!(
        epochs = report.fit.epochs_run,
        stopped_early = report.fit.stopped_early,
        best_checkpoint = ?report.fit.best_checkpoint,
        test_loss = report.test.loss,
        test_iou = report.test.iou,
        test_acc = report.test.accuracy,
        "done"
    );
    Ok(())
}

//! # Run Configuration
//!
//! Typed, eagerly validated configuration for a training run. A run is
//! described by a TOML file (`<config_dir>/<config_name>.toml`) layered with
//! `key.path=value` overrides from the command line.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SemsegError};

/// Root configuration. The four required sections have no defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub experiment: ExperimentConfig,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub loss: LossConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Experiment name; keys both tracking sessions.
    pub name: String,
    pub random_seed: u64,
    pub split_ratio: SplitRatio,
    pub batch_size: usize,
    pub num_workers: usize,
    pub image_size: ImageSize,
    pub learning_rate: f64,
    pub use_scheduler: bool,
    pub num_epochs: usize,
    pub accelerator: Accelerator,
    pub devices: Devices,
    pub patience: usize,
    pub use_checkpointing: bool,
    pub log_artifacts: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub data_dir: PathBuf,
    pub dataset_folder: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: Architecture,
    pub encoder: EncoderName,
    pub num_classes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossConfig {
    pub name: LossKind,
}

/// Optional tracking settings. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrackingConfig {
    /// MLflow server; falls back to `MLFLOW_TRACKING_URI`, then localhost.
    pub mlflow_uri: Option<String>,
    /// W&B API root; defaults to the public cloud.
    pub wandb_base_url: Option<String>,
    /// W&B entity (user or team). The server default is used when unset.
    pub wandb_entity: Option<String>,
    /// Write both sessions to the local filesystem instead of the network.
    pub offline: bool,
    /// Root for offline sessions (`runs` when unset).
    pub offline_dir: Option<PathBuf>,
    pub on_partial_failure: FailurePolicy,
}

/// What to do when one tracking backend fails and the other does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Propagate the error and end the run.
    #[default]
    Abort,
    /// Log a warning and keep going with the healthy backend.
    Warn,
}

/// Validation/test fractions. A single number applies to both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SplitRatio {
    Uniform(f64),
    Explicit { valid: f64, test: f64 },
}

impl SplitRatio {
    pub fn valid(&self) -> f64 {
        match *self {
            Self::Uniform(r) => r,
            Self::Explicit { valid, .. } => valid,
        }
    }

    pub fn test(&self) -> f64 {
        match *self {
            Self::Uniform(r) => r,
            Self::Explicit { test, .. } => test,
        }
    }
}

/// Target image size: one integer for square inputs or `[height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSize {
    Square(u32),
    Rect([u32; 2]),
}

impl ImageSize {
    /// Returns `(height, width)`.
    pub fn dims(&self) -> (u32, u32) {
        match *self {
            Self::Square(s) => (s, s),
            Self::Rect([h, w]) => (h, w),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Cuda,
    Metal,
    Auto,
}

/// Device selection: a count, explicit ordinals, or `"auto"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Devices {
    Count(usize),
    List(Vec<usize>),
    Named(String),
}

impl Devices {
    /// Ordinals requested, in order. `"auto"` and counts start at 0.
    pub fn ordinals(&self) -> Vec<usize> {
        match self {
            Self::Count(n) => (0..*n).collect(),
            Self::List(ids) => ids.clone(),
            Self::Named(_) => vec![0],
        }
    }
}

/// Segmentation architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Unet,
    Linknet,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unet => write!(f, "unet"),
            Self::Linknet => write!(f, "linknet"),
        }
    }
}

/// Encoder family: plain convolution stacks of growing width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderName {
    Tiny,
    Small,
    Base,
}

impl EncoderName {
    /// Channel width of each encoder stage.
    pub fn widths(&self) -> &'static [usize] {
        match self {
            Self::Tiny => &[8, 16, 32],
            Self::Small => &[16, 32, 64, 128],
            Self::Base => &[32, 64, 128, 256],
        }
    }

    /// Spatial dims must be divisible by this factor.
    pub fn downsample_factor(&self) -> u32 {
        1 << (self.widths().len() - 1)
    }
}

impl fmt::Display for EncoderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tiny => write!(f, "tiny"),
            Self::Small => write!(f, "small"),
            Self::Base => write!(f, "base"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    CrossEntropy,
    Bce,
    Dice,
    Jaccard,
    Focal,
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CrossEntropy => "cross_entropy",
            Self::Bce => "bce",
            Self::Dice => "dice",
            Self::Jaccard => "jaccard",
            Self::Focal => "focal",
        };
        f.write_str(name)
    }
}

impl Config {
    /// Load `<config_dir>/<config_name>.toml`, apply overrides, then validate.
    pub fn load(config_dir: &Path, config_name: &str, overrides: &[String]) -> Result<Self> {
        let file_name = if config_name.ends_with(".toml") {
            config_name.to_string()
        } else {
            format!("{config_name}.toml")
        };
        let path = config_dir.join(file_name);
        let contents = fs::read_to_string(&path).map_err(|e| {
            SemsegError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut root = parse_table(&contents)?;

        for arg in overrides {
            apply_override(&mut root, arg)?;
        }

        let config: Config = root
            .try_into()
            .map_err(|e: toml::de::Error| SemsegError::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), overrides = overrides.len(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).map_err(|e| SemsegError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, deep inside the run.
    pub fn validate(&self) -> Result<()> {
        let exp = &self.experiment;
        if exp.name.trim().is_empty() {
            return Err(SemsegError::Config("experiment.name is empty".into()));
        }
        if exp.batch_size == 0 {
            return Err(SemsegError::Config("experiment.batch_size must be > 0".into()));
        }
        if exp.num_epochs == 0 {
            return Err(SemsegError::Config("experiment.num_epochs must be > 0".into()));
        }
        if !exp.learning_rate.is_finite() || exp.learning_rate <= 0.0 {
            return Err(SemsegError::Config(format!(
                "experiment.learning_rate must be positive, got {}",
                exp.learning_rate
            )));
        }
        check_ratios(exp.split_ratio.valid(), exp.split_ratio.test())?;

        let (h, w) = exp.image_size.dims();
        let factor = self.model.encoder.downsample_factor();
        if h == 0 || w == 0 || h % factor != 0 || w % factor != 0 {
            return Err(SemsegError::Config(format!(
                "experiment.image_size {h}x{w} must be non-zero and divisible by {factor} for encoder {}",
                self.model.encoder
            )));
        }

        match &exp.devices {
            Devices::Count(0) => {
                return Err(SemsegError::Config("experiment.devices must be >= 1".into()));
            }
            Devices::List(ids) if ids.is_empty() => {
                return Err(SemsegError::Config("experiment.devices list is empty".into()));
            }
            Devices::Named(name) if name != "auto" => {
                return Err(SemsegError::Config(format!(
                    "experiment.devices must be a count, a list or \"auto\", got {name:?}"
                )));
            }
            _ => {}
        }

        if self.data.dataset_folder.trim().is_empty() {
            return Err(SemsegError::Config("data.dataset_folder is empty".into()));
        }

        let classes = self.model.num_classes;
        if classes == 0 {
            return Err(SemsegError::Config("model.num_classes must be >= 1".into()));
        }
        match self.loss.name {
            LossKind::CrossEntropy if classes < 2 => {
                return Err(SemsegError::Config(
                    "loss cross_entropy needs model.num_classes >= 2; use bce for binary masks"
                        .into(),
                ));
            }
            LossKind::Bce if classes != 1 => {
                return Err(SemsegError::Config(
                    "loss bce needs model.num_classes == 1".into(),
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// `<data_dir>/<dataset_folder>`.
    pub fn dataset_path(&self) -> PathBuf {
        self.data.data_dir.join(&self.data.dataset_folder)
    }

    /// Snapshot used by the tracking sessions.
    pub fn to_json(&self) -> serde_json::Value {
        // Serializing plain data with string keys cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Ratios must be finite, non-negative and leave room for a train split.
pub fn check_ratios(valid: f64, test: f64) -> Result<()> {
    let ok = valid.is_finite() && test.is_finite() && valid >= 0.0 && test >= 0.0;
    if !ok || valid + test >= 1.0 {
        return Err(SemsegError::InvalidRatios { valid, test });
    }
    Ok(())
}

fn parse_table(contents: &str) -> Result<toml::Value> {
    let table: toml::Table = contents
        .parse()
        .map_err(|e: toml::de::Error| SemsegError::Config(e.to_string()))?;
    Ok(toml::Value::Table(table))
}

/// Apply one `section.key=value` override.
///
/// The value is read as a TOML literal (`8`, `true`, `[256, 256]`) and falls
/// back to a plain string. Keys must already exist unless the argument starts
/// with `+`.
pub fn apply_override(root: &mut toml::Value, arg: &str) -> Result<()> {
    let reject = |reason: &str| SemsegError::Override {
        override_arg: arg.to_string(),
        reason: reason.to_string(),
    };

    let (allow_new, body) = match arg.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, arg),
    };
    let (path, raw) = body.split_once('=').ok_or_else(|| reject("expected key=value"))?;
    let keys: Vec<&str> = path.trim().split('.').collect();
    if keys.iter().any(|k| k.is_empty()) {
        return Err(reject("empty key segment"));
    }

    let value = parse_override_value(raw.trim());

    let mut node = root;
    for (depth, key) in keys.iter().enumerate() {
        let table = node
            .as_table_mut()
            .ok_or_else(|| reject("path runs through a non-table value"))?;
        let last = depth + 1 == keys.len();
        if last {
            if !allow_new && !table.contains_key(*key) {
                return Err(reject("key not found; prefix with '+' to add it"));
            }
            table.insert((*key).to_string(), value);
            return Ok(());
        }
        if !table.contains_key(*key) {
            if !allow_new {
                return Err(reject("key not found; prefix with '+' to add it"));
            }
            table.insert((*key).to_string(), toml::Value::Table(toml::Table::new()));
        }
        node = table
            .get_mut(*key)
            .ok_or_else(|| reject("key not found"))?;
    }
    Err(reject("empty key"))
}

fn parse_override_value(raw: &str) -> toml::Value {
    format!("v = {raw}")
        .parse::<toml::Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[experiment]
name = "sem-seg"
random_seed = 42
split_ratio = 0.1
batch_size = 4
num_workers = 2
image_size = 64
learning_rate = 0.001
use_scheduler = true
num_epochs = 3
accelerator = "cpu"
devices = 1
patience = 2
use_checkpointing = true
log_artifacts = false

[data]
data_dir = "data"
dataset_folder = "sem"

[model]
name = "unet"
encoder = "tiny"
num_classes = 2

[loss]
name = "dice"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.experiment.split_ratio.valid(), 0.1);
        assert_eq!(config.experiment.split_ratio.test(), 0.1);
        assert_eq!(config.experiment.image_size.dims(), (64, 64));
        assert_eq!(config.model.name, Architecture::Unet);
        assert_eq!(config.loss.name, LossKind::Dice);
        assert_eq!(config.tracking.on_partial_failure, FailurePolicy::Abort);
        assert_eq!(config.dataset_path(), PathBuf::from("data/sem"));
    }

    #[test]
    fn test_missing_key_rejected() {
        let broken = SAMPLE.replace("patience = 2\n", "");
        let err = Config::from_toml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("patience"), "{err}");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let broken = SAMPLE.replace("patience = 2", "patience = 2\npatiense = 3");
        assert!(Config::from_toml_str(&broken).is_err());
    }

    #[test]
    fn test_explicit_split_ratio_and_rect_size() {
        let text = SAMPLE
            .replace("split_ratio = 0.1", "split_ratio = { valid = 0.2, test = 0.1 }")
            .replace("image_size = 64", "image_size = [32, 64]");
        let config = Config::from_toml_str(&text).unwrap();
        assert_eq!(config.experiment.split_ratio.valid(), 0.2);
        assert_eq!(config.experiment.split_ratio.test(), 0.1);
        assert_eq!(config.experiment.image_size.dims(), (32, 64));
    }

    #[test]
    fn test_validation_errors() {
        let bad_ratio = SAMPLE.replace("split_ratio = 0.1", "split_ratio = 0.5");
        assert!(matches!(
            Config::from_toml_str(&bad_ratio),
            Err(SemsegError::InvalidRatios { .. })
        ));

        let bad_size = SAMPLE.replace("image_size = 64", "image_size = 30");
        assert!(Config::from_toml_str(&bad_size).is_err());

        let bad_loss = SAMPLE.replace("name = \"dice\"", "name = \"bce\"");
        assert!(Config::from_toml_str(&bad_loss).is_err());

        let bad_devices = SAMPLE.replace("devices = 1", "devices = \"many\"");
        assert!(Config::from_toml_str(&bad_devices).is_err());
    }

    #[test]
    fn test_override_existing_key() {
        let mut root = parse_table(SAMPLE).unwrap();
        apply_override(&mut root, "experiment.batch_size=16").unwrap();
        apply_override(&mut root, "experiment.name=run-7").unwrap();
        apply_override(&mut root, "experiment.image_size=[32, 32]").unwrap();
        let config: Config = root.try_into().unwrap();
        assert_eq!(config.experiment.batch_size, 16);
        assert_eq!(config.experiment.name, "run-7");
        assert_eq!(config.experiment.image_size.dims(), (32, 32));
    }

    #[test]
    fn test_override_unknown_key_needs_plus() {
        let mut root = parse_table(SAMPLE).unwrap();
        assert!(apply_override(&mut root, "tracking.offline=true").is_err());
        apply_override(&mut root, "+tracking.offline=true").unwrap();
        let config: Config = root.try_into().unwrap();
        assert!(config.tracking.offline);
    }

    #[test]
    fn test_override_malformed() {
        let mut root = parse_table(SAMPLE).unwrap();
        assert!(apply_override(&mut root, "experiment.batch_size").is_err());
        assert!(apply_override(&mut root, "experiment..batch_size=1").is_err());
        assert!(apply_override(&mut root, "experiment.name.inner=1").is_err());
    }

    #[test]
    fn test_load_shipped_config_with_overrides() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs");
        let overrides = vec!["model.name=linknet".to_string(), "experiment.devices=[0]".to_string()];
        let config = Config::load(&dir, "config", &overrides).unwrap();
        assert_eq!(config.model.name, Architecture::Linknet);
        assert_eq!(config.experiment.devices, Devices::List(vec![0]));
        assert_eq!(config.experiment.accelerator, Accelerator::Auto);
        assert!(!config.tracking.offline);
    }

    #[test]
    fn test_json_snapshot_contains_sections() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let json = config.to_json();
        assert_eq!(json["model"]["name"], "unet");
        assert_eq!(json["experiment"]["batch_size"], 4);
    }
}

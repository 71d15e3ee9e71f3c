use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::aggregator::AggregationPolicy;
use super::checkout::ConflictPolicy;
use super::error::ConfigError;
use super::filename::FILENAME_DELIMITER;
use super::retry::Patience;

pub const NO_ID_DIRECTORY: &str = "no_id";
pub const LOST_FRAMES_DIRECTORY: &str = "lost_frames";
pub const UNLABELED_DIRECTORY: &str = "unlabeled";
pub const RUN_PARAMS_FILENAME: &str = "run_params_dump.json";
pub const EXPERIMENT_PARAMETERS_FILENAME: &str = "experiment_parameters.json";

/// One logical image and the frames which make it up, in stacking order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub frames: Vec<String>,
}

impl ImageSpec {
    pub fn new(name: &str, frames: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            frames: frames.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Structure representing the watchdog configuration. Contains pathing, naming, and timing
/// information. Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch_path: PathBuf,
    pub archive_path: PathBuf,
    pub unlabeled_path: Option<PathBuf>,
    pub frame_extension: String,
    pub image_extension: String,
    pub images: Vec<ImageSpec>,
    pub aggregation: AggregationPolicy,
    pub lost_frame_patience_secs: f64,
    pub delete_lost_frames: bool,
    pub sleep_interval_secs: f64,
    pub labelling_waiting_period_secs: f64,
    pub mismatch_tolerance_secs: f64,
    pub allow_missing_ids: bool,
    pub checkout_patience: u32,
    pub checkout_retry_secs: f64,
    pub conflict_policy: ConflictPolicy,
    pub io_patience: u32,
    pub io_retry_secs: f64,
    pub service_attempts: u32,
    pub service_retry_secs: f64,
    pub run_log_path: Option<PathBuf>,
    pub experiment_parameters_path: Option<PathBuf>,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid
    fn default() -> Self {
        Self {
            watch_path: PathBuf::from("None"),
            archive_path: PathBuf::from("None"),
            unlabeled_path: None,
            frame_extension: String::from("fits"),
            image_extension: String::from("fits"),
            images: vec![ImageSpec::new("TopA", &["PWA", "PWOA"])],
            aggregation: AggregationPolicy::MatchedName,
            lost_frame_patience_secs: 10.0,
            delete_lost_frames: false,
            sleep_interval_secs: 0.1,
            labelling_waiting_period_secs: 5.0,
            mismatch_tolerance_secs: 5.0,
            allow_missing_ids: true,
            checkout_patience: 3,
            checkout_retry_secs: 0.1,
            conflict_policy: ConflictPolicy::Fail,
            io_patience: 3,
            io_retry_secs: 0.1,
            service_attempts: 5,
            service_retry_secs: 0.2,
            run_log_path: None,
            experiment_parameters_path: None,
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Check that the image specification and timings make sense
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.images.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "at least one image must be specified",
            )));
        }
        let mut names = HashSet::new();
        for image in self.images.iter() {
            if !names.insert(image.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "image {} is specified twice",
                    image.name
                )));
            }
            if image.frames.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "image {} has no frames",
                    image.name
                )));
            }
            let fields = std::iter::once(&image.name).chain(image.frames.iter());
            for field in fields {
                if field.is_empty() || field.contains(FILENAME_DELIMITER) {
                    return Err(ConfigError::Invalid(format!(
                        "name {field:?} must be non-empty and must not contain {FILENAME_DELIMITER:?}"
                    )));
                }
            }
        }
        let timings = [
            ("lost_frame_patience_secs", self.lost_frame_patience_secs),
            ("sleep_interval_secs", self.sleep_interval_secs),
            ("checkout_retry_secs", self.checkout_retry_secs),
            ("io_retry_secs", self.io_retry_secs),
            ("service_retry_secs", self.service_retry_secs),
        ];
        for (name, value) in timings {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        let windows = [
            (
                "labelling_waiting_period_secs",
                self.labelling_waiting_period_secs,
            ),
            ("mismatch_tolerance_secs", self.mismatch_tolerance_secs),
        ];
        for (name, value) in windows {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must not be negative")));
            }
        }
        if self.checkout_patience == 0 || self.io_patience == 0 || self.service_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "patience and attempt counts must be at least 1",
            )));
        }
        Ok(())
    }

    /// Get the folder completed but not yet labelled images are kept in
    pub fn unlabeled_directory(&self) -> PathBuf {
        match &self.unlabeled_path {
            Some(path) => path.clone(),
            None => self.archive_path.join(UNLABELED_DIRECTORY),
        }
    }

    /// Get the folder for images which could not be matched to a run
    pub fn no_id_directory(&self) -> PathBuf {
        self.archive_path.join(NO_ID_DIRECTORY)
    }

    pub fn lost_frames_directory(&self) -> PathBuf {
        self.archive_path.join(LOST_FRAMES_DIRECTORY)
    }

    pub fn run_params_path(&self) -> PathBuf {
        self.archive_path.join(RUN_PARAMS_FILENAME)
    }

    pub fn experiment_parameters_snapshot_path(&self) -> PathBuf {
        self.archive_path.join(EXPERIMENT_PARAMETERS_FILENAME)
    }

    /// Names of all the logical images
    pub fn image_names(&self) -> Vec<String> {
        self.images.iter().map(|i| i.name.clone()).collect()
    }

    pub fn lost_frame_patience(&self) -> Duration {
        seconds(self.lost_frame_patience_secs)
    }

    pub fn sleep_interval(&self) -> Duration {
        seconds(self.sleep_interval_secs)
    }

    pub fn labelling_waiting_period(&self) -> Duration {
        seconds(self.labelling_waiting_period_secs)
    }

    pub fn io_patience(&self) -> Patience {
        Patience::new(self.io_patience, seconds(self.io_retry_secs))
    }

    pub fn service_retry_interval(&self) -> Duration {
        seconds(self.service_retry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.images, config.images);
        assert_eq!(parsed.conflict_policy, ConflictPolicy::Fail);
        assert_eq!(parsed.aggregation, AggregationPolicy::MatchedName);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "watch_path: /data/watch\narchive_path: /data/archive\naggregation: sequential\nconflict_policy: discard_local\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.aggregation, AggregationPolicy::Sequential);
        assert_eq!(config.conflict_policy, ConflictPolicy::DiscardLocal);
        assert_eq!(config.image_extension, "fits");
        assert_eq!(
            config.no_id_directory(),
            PathBuf::from("/data/archive/no_id")
        );
        assert_eq!(
            config.unlabeled_directory(),
            PathBuf::from("/data/archive/unlabeled")
        );
        assert_eq!(
            config.run_params_path(),
            PathBuf::from("/data/archive/run_params_dump.json")
        );
    }

    #[test]
    fn test_missing_file() {
        let result = Config::read_config_file(Path::new("/definitely/not/here.yml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.images.push(ImageSpec::new("TopA", &["X"]));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.images = vec![ImageSpec::new("Top_A", &["PWA"])];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.images = vec![ImageSpec::new("Side", &[])];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lost_frame_patience_secs = 0.0;
        assert!(config.validate().is_err());
    }
}

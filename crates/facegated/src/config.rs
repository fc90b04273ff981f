use facegate_core::policy::{DEFAULT_DUPLICATE_THRESHOLD, DEFAULT_IDENTIFY_THRESHOLD};
use facegate_core::{MatchPolicy, PolicyError};
use facegate_models::ModelConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            _ => Err(()),
        }
    }
}

/// Daemon configuration.
///
/// Layered as defaults, then the TOML file named by `FACEGATE_CONFIG`, then
/// `FACEGATE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusKind,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root directory for enrollment photos.
    pub image_dir: PathBuf,
    pub models: ModelConfig,
    /// Cosine distance below which a probe is recognized.
    pub identify_threshold: f32,
    /// Cosine distance below which an enrollment is rejected as a duplicate.
    pub duplicate_threshold: f32,
    /// Upper bound on a single extraction, queueing included.
    pub extract_timeout_secs: u64,
    pub max_image_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = facegate_models::default_data_dir();
        Self {
            bus: BusKind::System,
            db_path: data_dir.join("identities.db"),
            image_dir: data_dir.join("images"),
            models: ModelConfig::default(),
            identify_threshold: DEFAULT_IDENTIFY_THRESHOLD,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            extract_timeout_secs: 30,
            max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEGATE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `FACEGATE_*` variables resolved through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(bus) = env_parse(&lookup, "FACEGATE_BUS")? {
            self.bus = bus;
        }
        if let Some(v) = lookup("FACEGATE_DB_PATH") {
            self.db_path = v.into();
        }
        if let Some(v) = lookup("FACEGATE_IMAGE_DIR") {
            self.image_dir = v.into();
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.models.model_dir = v.into();
        }
        if let Some(v) = lookup("FACEGATE_BUNDLED_MODEL_DIR") {
            self.models.bundled_dir = Some(v.into());
        }
        if let Some(v) = lookup("FACEGATE_WEIGHTS_URL") {
            self.models.weights_url = Some(v);
        }
        if let Some(v) = lookup("FACEGATE_RECOGNIZER") {
            self.models.recognizer = v;
        }
        if let Some(v) = lookup("FACEGATE_DETECTOR") {
            self.models.detector = v;
        }
        if let Some(v) = lookup("FACEGATE_QUICK_DETECTOR") {
            self.models.quick_detector = v;
        }
        if let Some(v) = env_parse(&lookup, "FACEGATE_IDENTIFY_THRESHOLD")? {
            self.identify_threshold = v;
        }
        if let Some(v) = env_parse(&lookup, "FACEGATE_DUPLICATE_THRESHOLD")? {
            self.duplicate_threshold = v;
        }
        if let Some(v) = env_parse(&lookup, "FACEGATE_EXTRACT_TIMEOUT_SECS")? {
            self.extract_timeout_secs = v;
        }
        if let Some(v) = env_parse(&lookup, "FACEGATE_MAX_IMAGE_BYTES")? {
            self.max_image_bytes = v;
        }
        Ok(())
    }

    /// Validated threshold pair.
    pub fn policy(&self) -> Result<MatchPolicy, PolicyError> {
        MatchPolicy::new(self.identify_threshold, self.duplicate_threshold)
    }
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}

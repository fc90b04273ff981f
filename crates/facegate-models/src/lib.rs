//! facegate-models: one-time provisioning of ONNX model weights.
//!
//! [`ModelConfig`] names the recognizer, detector and quick detector by
//! identifier (file stem). [`provision`] makes sure each file exists in the
//! model directory, copying it from a bundled directory or downloading it
//! from an override URL, and reports the outcome explicitly.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_RECOGNIZER: &str = "w600k_r50";
pub const DEFAULT_DETECTOR: &str = "det_10g";
pub const DEFAULT_QUICK_DETECTOR: &str = "face_detection_yunet_2023mar";

const MODEL_EXTENSION: &str = "onnx";

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid model identifier {0:?}")]
    InvalidId(String),
    #[error("model {file} not found in {dir}; {hint}")]
    Missing {
        file: String,
        dir: PathBuf,
        hint: String,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Recognizer,
    Detector,
    QuickDetector,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recognizer => "recognizer",
            Self::Detector => "detector",
            Self::QuickDetector => "quick detector",
        })
    }
}

/// Which models to use and where their weights come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub recognizer: String,
    pub detector: String,
    pub quick_detector: String,
    /// Directory the daemon loads models from.
    pub model_dir: PathBuf,
    /// Read-only directory shipped with the package; copied from when present.
    pub bundled_dir: Option<PathBuf>,
    /// Base URL; each file is fetched from `{weights_url}/{file}`.
    pub weights_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            recognizer: DEFAULT_RECOGNIZER.into(),
            detector: DEFAULT_DETECTOR.into(),
            quick_detector: DEFAULT_QUICK_DETECTOR.into(),
            model_dir: default_model_dir(),
            bundled_dir: None,
            weights_url: None,
        }
    }
}

impl ModelConfig {
    pub fn id(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Recognizer => &self.recognizer,
            ModelRole::Detector => &self.detector,
            ModelRole::QuickDetector => &self.quick_detector,
        }
    }

    /// `<id>.onnx`, rejecting identifiers that would escape the model directory.
    pub fn file_name(&self, role: ModelRole) -> Result<String, ProvisionError> {
        let id = self.id(role);
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ProvisionError::InvalidId(id.to_string()));
        }
        Ok(format!("{id}.{MODEL_EXTENSION}"))
    }
}

/// Resolved on-disk paths of the three models.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSet {
    pub recognizer: PathBuf,
    pub detector: PathBuf,
    pub quick_detector: PathBuf,
}

impl ModelSet {
    /// Resolve paths without copying or downloading anything.
    pub fn verify(config: &ModelConfig) -> Result<Self, ProvisionError> {
        let resolve = |role| -> Result<PathBuf, ProvisionError> {
            let file = config.file_name(role)?;
            let path = config.model_dir.join(&file);
            if path.is_file() {
                Ok(path)
            } else {
                Err(missing(config, file))
            }
        };
        Ok(Self {
            recognizer: resolve(ModelRole::Recognizer)?,
            detector: resolve(ModelRole::Detector)?,
            quick_detector: resolve(ModelRole::QuickDetector)?,
        })
    }
}

/// `$XDG_DATA_HOME/facegate`, falling back to `~/.local/share/facegate`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// Make every configured model available in `config.model_dir`.
///
/// Existing files are left untouched. Missing files are copied from
/// `bundled_dir`, then downloaded from `weights_url`; if neither source has
/// the file, provisioning fails with [`ProvisionError::Missing`].
pub async fn provision(config: &ModelConfig) -> Result<ModelSet, ProvisionError> {
    tokio::fs::create_dir_all(&config.model_dir)
        .await
        .map_err(|source| io_err(&config.model_dir, source))?;

    let mut client: Option<reqwest::Client> = None;

    for role in [ModelRole::Recognizer, ModelRole::Detector, ModelRole::QuickDetector] {
        let file = config.file_name(role)?;
        let dest = config.model_dir.join(&file);

        if !dest.is_file() {
            if let Some(src) = config.bundled_dir.as_ref().map(|d| d.join(&file)).filter(|p| p.is_file()) {
                tracing::info!(%role, from = %src.display(), to = %dest.display(), "copying bundled model");
                tokio::fs::copy(&src, &dest).await.map_err(|source| io_err(&dest, source))?;
            } else if let Some(base) = &config.weights_url {
                let url = weights_url_for(base, &file);
                let client = match &client {
                    Some(c) => c,
                    None => client.insert(reqwest::Client::builder().build()?),
                };
                download(client, &url, &dest).await?;
            } else {
                return Err(missing(config, file));
            }
        }

        let digest = sha256_file(&dest).await?;
        tracing::info!(%role, path = %dest.display(), sha256 = %digest, "model ready");
    }

    ModelSet::verify(config)
}

fn weights_url_for(base: &str, file: &str) -> String {
    format!("{}/{file}", base.trim_end_matches('/'))
}

/// Fetch `url` into `dest` through a temporary file so a partial download never
/// looks like a model.
async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(), ProvisionError> {
    tracing::info!(url, dest = %dest.display(), "downloading model");

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ProvisionError::Download {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Err(ProvisionError::Download {
            url: url.to_string(),
            reason: "empty response body".into(),
        });
    }

    let partial = dest.with_extension("part");
    tokio::fs::write(&partial, &bytes)
        .await
        .map_err(|source| io_err(&partial, source))?;
    tokio::fs::rename(&partial, dest)
        .await
        .map_err(|source| io_err(dest, source))?;

    tracing::info!(url, bytes = bytes.len(), "model downloaded");
    Ok(())
}

async fn sha256_file(path: &Path) -> Result<String, ProvisionError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| io_err(path, source))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn missing(config: &ModelConfig, file: String) -> ProvisionError {
    let hint = match (&config.bundled_dir, &config.weights_url) {
        (None, None) => "set FACEGATE_WEIGHTS_URL or FACEGATE_BUNDLED_MODEL_DIR to fetch it".to_string(),
        _ => "no configured source provides it".to_string(),
    };
    ProvisionError::Missing {
        file,
        dir: config.model_dir.clone(),
        hint,
    }
}

fn io_err(path: &Path, source: std::io::Error) -> ProvisionError {
    ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("facegate-models-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config_in(dir: &Path) -> ModelConfig {
        ModelConfig {
            model_dir: dir.join("models"),
            ..ModelConfig::default()
        }
    }

    fn touch_all(dir: &Path, config: &ModelConfig) {
        std::fs::create_dir_all(dir).unwrap();
        for role in [ModelRole::Recognizer, ModelRole::Detector, ModelRole::QuickDetector] {
            std::fs::write(dir.join(config.file_name(role).unwrap()), b"onnx").unwrap();
        }
    }

    #[test]
    fn test_file_names() {
        let config = ModelConfig::default();
        assert_eq!(config.file_name(ModelRole::Recognizer).unwrap(), "w600k_r50.onnx");
        assert_eq!(config.file_name(ModelRole::Detector).unwrap(), "det_10g.onnx");
        assert_eq!(
            config.file_name(ModelRole::QuickDetector).unwrap(),
            "face_detection_yunet_2023mar.onnx"
        );
    }

    #[test]
    fn test_rejects_path_like_ids() {
        for bad in ["", "../w600k_r50", "a/b", "a\\b", ".hidden"] {
            let config = ModelConfig {
                recognizer: bad.into(),
                ..ModelConfig::default()
            };
            assert!(matches!(
                config.file_name(ModelRole::Recognizer),
                Err(ProvisionError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn test_weights_url_join() {
        assert_eq!(weights_url_for("https://host/w/", "a.onnx"), "https://host/w/a.onnx");
        assert_eq!(weights_url_for("https://host/w", "a.onnx"), "https://host/w/a.onnx");
    }

    #[test]
    fn test_verify_missing_reports_hint() {
        let dir = scratch_dir("verify");
        let err = ModelSet::verify(&config_in(&dir)).unwrap_err();
        match err {
            ProvisionError::Missing { file, hint, .. } => {
                assert_eq!(file, "w600k_r50.onnx");
                assert!(hint.contains("FACEGATE_WEIGHTS_URL"));
            }
            other => panic!("expected Missing, got {other:?}"),
        }
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_verify_present() {
        let dir = scratch_dir("present");
        let config = config_in(&dir);
        touch_all(&config.model_dir, &config);
        let set = ModelSet::verify(&config).unwrap();
        assert_eq!(set.detector, config.model_dir.join("det_10g.onnx"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_provision_copies_bundled() {
        let dir = scratch_dir("bundled");
        let bundled = dir.join("bundled");
        let config = ModelConfig {
            bundled_dir: Some(bundled.clone()),
            ..config_in(&dir)
        };
        touch_all(&bundled, &config);

        let set = provision(&config).await.unwrap();
        assert_eq!(std::fs::read(&set.recognizer).unwrap(), b"onnx");
        assert!(set.quick_detector.starts_with(&config.model_dir));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_provision_keeps_existing_files() {
        let dir = scratch_dir("existing");
        let config = config_in(&dir);
        touch_all(&config.model_dir, &config);
        std::fs::write(config.model_dir.join("det_10g.onnx"), b"custom").unwrap();

        let set = provision(&config).await.unwrap();
        assert_eq!(std::fs::read(set.detector).unwrap(), b"custom");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_provision_without_source_fails() {
        let dir = scratch_dir("nosource");
        let err = provision(&config_in(&dir)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Missing { .. }));
        std::fs::remove_dir_all(dir).ok();
    }
}

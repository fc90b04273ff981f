use facegate_core::extractor::extension_for_content_type;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Subdirectory of the image root holding enrollment photos.
const IDENTITY_PREFIX: &str = "identities";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid image reference {0:?}")]
    InvalidRef(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Enrollment photos on the local filesystem, addressed by relative references
/// such as `identities/<uuid>.jpg`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` under a fresh name and return its reference.
    pub async fn save(&self, bytes: &[u8], content_type: &str) -> Result<String, ImageError> {
        let image_ref = format!(
            "{IDENTITY_PREFIX}/{}.{}",
            uuid::Uuid::new_v4(),
            extension_for_content_type(content_type)
        );
        let path = self.resolve(&image_ref)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_err(parent, source))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| io_err(&path, source))?;

        tracing::debug!(image_ref = image_ref.as_str(), bytes = bytes.len(), "image saved");
        Ok(image_ref)
    }

    /// Delete the file behind `image_ref`. Returns false if it was already gone.
    pub async fn remove(&self, image_ref: &str) -> Result<bool, ImageError> {
        let path = self.resolve(image_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(image_ref, "image removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_err(&path, source)),
        }
    }

    /// Map a reference to a path under the root, refusing anything that could
    /// point outside it.
    pub fn resolve(&self, image_ref: &str) -> Result<PathBuf, ImageError> {
        let relative = Path::new(image_ref);
        let plain = !image_ref.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(ImageError::InvalidRef(image_ref.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> ImageError {
    ImageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

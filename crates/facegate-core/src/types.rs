use crate::matcher::{cosine_distance, MatchError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Primary key of an enrolled identity.
pub type IdentityId = i64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has no dimensions")]
    Empty,
    #[error("embedding value at index {index} is not finite")]
    NonFinite { index: usize },
    #[error("embedding blob length {0} is not a multiple of 4")]
    Truncated(usize),
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for the default ArcFace model).
///
/// Always non-empty with finite values; construct through [`Embedding::new`].
/// Deserialization goes through the same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEmbedding")]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: Option<String>) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite { index });
        }
        Ok(Self {
            values,
            model_version,
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine distance in [0, 2]. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> Result<f32, MatchError> {
        cosine_distance(&self.values, &other.values)
    }

    /// Serialize as packed little-endian f32 values.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes), re-checking the invariants.
    pub fn from_le_bytes(bytes: &[u8], model_version: Option<String>) -> Result<Self, EmbeddingError> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::Truncated(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values, model_version)
    }
}

#[derive(Deserialize)]
struct RawEmbedding {
    values: Vec<f32>,
    #[serde(default)]
    model_version: Option<String>,
}

impl TryFrom<RawEmbedding> for Embedding {
    type Error = EmbeddingError;

    fn try_from(raw: RawEmbedding) -> Result<Self, Self::Error> {
        Self::new(raw.values, raw.model_version)
    }
}

/// One row of an enrolled-face snapshot: identity key plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledFace {
    pub id: IdentityId,
    pub embedding: Embedding,
}

/// Display attributes of an enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub given_name: String,
    pub family_name: String,
    pub email: Option<String>,
    /// Reference to the enrollment photo in the image store.
    pub image_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Identity {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.given_name, self.family_name)
    }
}

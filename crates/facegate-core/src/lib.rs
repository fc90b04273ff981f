//! facegate-core: face embedding extraction and matching.
//!
//! The extraction contract ([`extractor`]) and the cosine matcher
//! ([`matcher`]) are pure and backend-agnostic. The ONNX backends
//! (SCRFD + ArcFace for embeddings, YuNet for quick presence checks)
//! plug into the contract through [`FaceEmbedder`] and [`FacePresence`].

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod onnx;
pub mod policy;
pub mod quick;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use extractor::{extract, has_face, ExtractionError, FaceEmbedder, FacePresence, FaceRepresentation};
pub use matcher::{cosine_distance, CosineMatcher, IdentifyOutcome, MatchError, Matcher};
pub use onnx::{BackendError, OnnxEmbedder};
pub use policy::{MatchPolicy, PolicyError};
pub use quick::QuickDetector;
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, EmbeddingError, EnrolledFace, Identity, IdentityId};

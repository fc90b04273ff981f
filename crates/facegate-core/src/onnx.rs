//! ONNX Runtime implementations of the extraction traits.

use crate::detector::{DetectorError, FaceDetector};
use crate::extractor::{FaceEmbedder, FacePresence, FaceRepresentation};
use crate::quick::{QuickDetector, QuickDetectorError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("quick detector: {0}")]
    Quick(#[from] QuickDetectorError),
}

/// SCRFD detection + ArcFace recognition.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
        }
    }

    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, BackendError> {
        Ok(Self::new(
            FaceDetector::load(detector_path)?,
            FaceRecognizer::load(recognizer_path)?,
        ))
    }

    pub fn model_version(&self) -> &str {
        self.recognizer.model_version()
    }
}

impl FaceEmbedder for OnnxEmbedder {
    type Error = BackendError;

    /// Embeds only the most confident face; further faces are reported by count only.
    fn represent(&mut self, image: &RgbImage) -> Result<Vec<FaceRepresentation>, BackendError> {
        let faces = self.detector.detect(image)?;
        let Some(best) = faces.first() else {
            return Ok(Vec::new());
        };

        if faces.len() > 1 {
            tracing::debug!(count = faces.len(), "multiple faces detected, using the most confident");
        }

        let values = self.recognizer.extract(image, best)?;
        Ok(vec![FaceRepresentation {
            values,
            confidence: best.confidence,
            model_version: Some(self.recognizer.model_version().to_string()),
        }])
    }
}

impl FacePresence for QuickDetector {
    type Error = BackendError;

    fn detect_any(&mut self, image: &RgbImage) -> Result<bool, BackendError> {
        Ok(self.any_face(image)?)
    }
}

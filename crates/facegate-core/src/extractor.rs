//! Descriptor extraction contract.
//!
//! Turns uploaded image bytes into an [`Embedding`] through any
//! [`FaceEmbedder`], folding decoder and backend failures into a single
//! [`ExtractionError`] taxonomy. The functions here hold no state between
//! calls; model sessions live in the backend passed in.

use crate::types::Embedding;
use image::{ImageFormat, RgbImage};
use thiserror::Error;

/// Content types accepted for uploads.
pub const ACCEPTED_CONTENT_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("invalid face embedding: {0}")]
    InvalidFace(String),
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
}

impl ExtractionError {
    /// Only backend failures are worth retrying; the other kinds are properties of the input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExtractionFailure(_))
    }
}

/// One face as reported by an embedding backend.
#[derive(Debug, Clone)]
pub struct FaceRepresentation {
    pub values: Vec<f32>,
    /// Detector confidence for the face this embedding came from.
    pub confidence: f32,
    pub model_version: Option<String>,
}

/// Full extraction capability: detect faces and embed them.
pub trait FaceEmbedder {
    type Error: std::error::Error;

    /// Return one representation per detected face.
    /// An empty vector means no face was found.
    fn represent(&mut self, image: &RgbImage) -> Result<Vec<FaceRepresentation>, Self::Error>;
}

/// Cheap presence check, independent of the embedder's detector.
pub trait FacePresence {
    type Error: std::error::Error;

    fn detect_any(&mut self, image: &RgbImage) -> Result<bool, Self::Error>;
}

/// Reject any content type other than JPEG or PNG.
pub fn check_content_type(content_type: &str) -> Result<(), ExtractionError> {
    let media_type = essence(content_type);
    if ACCEPTED_CONTENT_TYPES.contains(&media_type.as_str()) {
        Ok(())
    } else {
        Err(ExtractionError::InvalidImage(format!(
            "unsupported content type {content_type:?}; expected image/jpeg or image/png"
        )))
    }
}

/// File extension for an accepted content type.
pub fn extension_for_content_type(content_type: &str) -> &'static str {
    if essence(content_type) == "image/png" {
        "png"
    } else {
        "jpg"
    }
}

/// Media type without parameters, lower-cased.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Sniff and decode JPEG/PNG bytes into an RGB raster.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ExtractionError> {
    if bytes.is_empty() {
        return Err(ExtractionError::InvalidImage("no image data".into()));
    }

    let format = image::guess_format(bytes)
        .map_err(|_| ExtractionError::InvalidImage("unrecognized image format".into()))?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(ExtractionError::InvalidImage(format!(
            "unsupported image format {format:?}; expected JPEG or PNG"
        )));
    }

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ExtractionError::InvalidImage(e.to_string()))?;
    Ok(decoded.to_rgb8())
}

/// Extract the embedding of the strongest face in `bytes`.
pub fn extract<E>(embedder: &mut E, bytes: &[u8]) -> Result<Embedding, ExtractionError>
where
    E: FaceEmbedder + ?Sized,
{
    let image = decode_image(bytes)?;

    let faces = embedder
        .represent(&image)
        .map_err(|e| ExtractionError::ExtractionFailure(e.to_string()))?;

    let count = faces.len();
    // Highest confidence wins; ties keep backend order.
    let face = faces
        .into_iter()
        .reduce(|best, f| if f.confidence > best.confidence { f } else { best })
        .ok_or(ExtractionError::NoFaceDetected)?;
    tracing::debug!(faces = count, confidence = face.confidence, "face selected");

    Embedding::new(face.values, face.model_version)
        .map_err(|e| ExtractionError::InvalidFace(e.to_string()))
}

/// Answer whether `bytes` contains a detectable face, without embedding it.
pub fn has_face<P>(detector: &mut P, bytes: &[u8]) -> Result<bool, ExtractionError>
where
    P: FacePresence + ?Sized,
{
    let image = decode_image(bytes)?;
    detector
        .detect_any(&image)
        .map_err(|e| ExtractionError::ExtractionFailure(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, Error)]
    #[error("session poisoned")]
    struct Poisoned;

    /// Backend that replays a canned answer.
    struct Scripted(Result<Vec<FaceRepresentation>, ()>);

    impl FaceEmbedder for Scripted {
        type Error = Poisoned;

        fn represent(&mut self, _image: &RgbImage) -> Result<Vec<FaceRepresentation>, Poisoned> {
            self.0.clone().map_err(|_| Poisoned)
        }
    }

    struct Presence(Result<bool, ()>);

    impl FacePresence for Presence {
        type Error = Poisoned;

        fn detect_any(&mut self, _image: &RgbImage) -> Result<bool, Poisoned> {
            self.0.map_err(|_| Poisoned)
        }
    }

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 16, image::Rgb([120, 90, 60]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn rep(values: Vec<f32>) -> FaceRepresentation {
        scored(values, 0.9)
    }

    fn scored(values: Vec<f32>, confidence: f32) -> FaceRepresentation {
        FaceRepresentation {
            values,
            confidence,
            model_version: Some("test".into()),
        }
    }

    #[test]
    fn test_content_type_whitelist() {
        assert!(check_content_type("image/jpeg").is_ok());
        assert!(check_content_type("image/png").is_ok());
        assert!(check_content_type("IMAGE/PNG; charset=binary").is_ok());
        assert!(matches!(
            check_content_type("image/gif"),
            Err(ExtractionError::InvalidImage(_))
        ));
        assert!(check_content_type("").is_err());
    }

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(extension_for_content_type("image/png"), "png");
        assert_eq!(extension_for_content_type("image/jpeg"), "jpg");
        assert_eq!(extension_for_content_type("IMAGE/PNG"), "png");
        assert_eq!(extension_for_content_type(" Image/Png ; charset=binary"), "png");
        assert_eq!(extension_for_content_type("image/JPEG"), "jpg");
    }

    #[test]
    fn test_decode_empty_is_invalid_image() {
        assert!(matches!(decode_image(b""), Err(ExtractionError::InvalidImage(_))));
    }

    #[test]
    fn test_decode_garbage_is_invalid_image() {
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(ExtractionError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_decode_truncated_png_is_invalid_image() {
        let mut bytes = encoded(ImageFormat::Png);
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(decode_image(&bytes), Err(ExtractionError::InvalidImage(_))));
    }

    #[test]
    fn test_decode_png_and_jpeg() {
        let png = decode_image(&encoded(ImageFormat::Png)).unwrap();
        assert_eq!(png.dimensions(), (16, 16));
        let jpeg = decode_image(&encoded(ImageFormat::Jpeg)).unwrap();
        assert_eq!(jpeg.dimensions(), (16, 16));
    }

    #[test]
    fn test_decode_rejects_other_formats() {
        let gif = b"GIF89a\x10\x00\x10\x00\x00\x00\x00;";
        assert!(matches!(decode_image(gif), Err(ExtractionError::InvalidImage(_))));
    }

    #[test]
    fn test_extract_empty_bytes() {
        let mut backend = Scripted(Ok(vec![rep(vec![1.0])]));
        assert!(matches!(
            extract(&mut backend, b""),
            Err(ExtractionError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_extract_no_face() {
        let mut backend = Scripted(Ok(vec![]));
        assert_eq!(
            extract(&mut backend, &encoded(ImageFormat::Jpeg)),
            Err(ExtractionError::NoFaceDetected)
        );
    }

    #[test]
    fn test_extract_zero_length_embedding() {
        let mut backend = Scripted(Ok(vec![rep(vec![])]));
        assert!(matches!(
            extract(&mut backend, &encoded(ImageFormat::Png)),
            Err(ExtractionError::InvalidFace(_))
        ));
    }

    #[test]
    fn test_extract_non_finite_embedding() {
        let mut backend = Scripted(Ok(vec![rep(vec![0.1, f32::NAN])]));
        assert!(matches!(
            extract(&mut backend, &encoded(ImageFormat::Png)),
            Err(ExtractionError::InvalidFace(_))
        ));
    }

    #[test]
    fn test_extract_backend_failure_is_not_no_face() {
        let mut backend = Scripted(Err(()));
        let err = extract(&mut backend, &encoded(ImageFormat::Png)).unwrap_err();
        assert_eq!(err, ExtractionError::ExtractionFailure("session poisoned".into()));
        assert!(err.is_retryable());
        assert!(!ExtractionError::NoFaceDetected.is_retryable());
    }

    #[test]
    fn test_extract_takes_strongest_face() {
        let mut backend = Scripted(Ok(vec![rep(vec![1.0, 0.0]), rep(vec![0.0, 1.0])]));
        let e = extract(&mut backend, &encoded(ImageFormat::Png)).unwrap();
        assert_eq!(e.values(), &[1.0, 0.0]);
        assert_eq!(e.model_version.as_deref(), Some("test"));
    }

    #[test]
    fn test_extract_prefers_confidence_over_order() {
        let mut backend = Scripted(Ok(vec![
            scored(vec![1.0, 0.0], 0.55),
            scored(vec![0.0, 1.0], 0.97),
            scored(vec![0.6, 0.8], 0.97),
        ]));
        let e = extract(&mut backend, &encoded(ImageFormat::Png)).unwrap();
        assert_eq!(e.values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_has_face_validates_input() {
        let mut detector = Presence(Ok(true));
        assert!(matches!(
            has_face(&mut detector, b""),
            Err(ExtractionError::InvalidImage(_))
        ));
        assert!(matches!(
            has_face(&mut detector, b"GIF89a...."),
            Err(ExtractionError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_has_face_answers() {
        let bytes = encoded(ImageFormat::Jpeg);
        assert_eq!(has_face(&mut Presence(Ok(true)), &bytes), Ok(true));
        assert_eq!(has_face(&mut Presence(Ok(false)), &bytes), Ok(false));
        assert!(matches!(
            has_face(&mut Presence(Err(())), &bytes),
            Err(ExtractionError::ExtractionFailure(_))
        ));
    }
}

//! YuNet quick face-presence detector.
//!
//! A lighter, anchor-free detector used only to answer "is there a face".
//! It shares nothing with the SCRFD path and may disagree with it on
//! borderline inputs.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const YUNET_INPUT_SIZE: usize = 640;
const YUNET_STRIDES: [usize; 3] = [8, 16, 32];
const YUNET_SCORE_THRESHOLD: f32 = 0.7;
/// Smallest face side, in source pixels, that counts as present.
const YUNET_MIN_FACE_PX: f32 = 20.0;

#[derive(Error, Debug)]
pub enum QuickDetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor indices for one stride: (cls, obj, bbox).
type StrideOutputIndices = (usize, usize, usize);

pub struct QuickDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
    score_threshold: f32,
}

impl QuickDetector {
    pub fn load(model_path: &Path) -> Result<Self, QuickDetectorError> {
        if !model_path.exists() {
            return Err(QuickDetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 12 {
            return Err(QuickDetectorError::InferenceFailed(format!(
                "YuNet model requires 12 outputs (3 strides × cls/obj/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::info!(path = %model_path.display(), ?stride_indices, "loaded YuNet model");

        Ok(Self {
            session,
            stride_indices,
            score_threshold: YUNET_SCORE_THRESHOLD,
        })
    }

    /// True if any grid cell scores a face above threshold and minimum size.
    pub fn any_face(&mut self, image: &RgbImage) -> Result<bool, QuickDetectorError> {
        let (input, scale) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        for (pos, &stride) in YUNET_STRIDES.iter().enumerate() {
            let (cls_idx, obj_idx, bbox_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| QuickDetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let cls = extract(cls_idx, "cls")?;
            let obj = extract(obj_idx, "obj")?;
            let bbox = extract(bbox_idx, "bbox")?;

            if stride_has_face(cls, obj, bbox, stride, scale, self.score_threshold) {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Letterbox into a 640×640 BGR tensor with raw 0-255 values.
fn preprocess(image: &RgbImage) -> (Array4<f32>, f32) {
    let (width, height) = image.dimensions();
    let scale = YUNET_INPUT_SIZE as f32 / width.max(height) as f32;
    let new_w = ((width as f32 * scale) as u32).clamp(1, YUNET_INPUT_SIZE as u32);
    let new_h = ((height as f32 * scale) as u32).clamp(1, YUNET_INPUT_SIZE as u32);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, YUNET_INPUT_SIZE, YUNET_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[2] as f32;
        tensor[[0, 1, y, x]] = pixel[1] as f32;
        tensor[[0, 2, y, x]] = pixel[0] as f32;
    }
    (tensor, scale)
}

/// Score = sqrt(cls * obj); box side = exp(d) * stride, mapped back by `scale`.
fn stride_has_face(cls: &[f32], obj: &[f32], bbox: &[f32], stride: usize, scale: f32, threshold: f32) -> bool {
    let cells = (YUNET_INPUT_SIZE / stride).pow(2);
    (0..cells).any(|idx| {
        let (Some(&c), Some(&o)) = (cls.get(idx), obj.get(idx)) else {
            return false;
        };
        let score = (c.clamp(0.0, 1.0) * o.clamp(0.0, 1.0)).sqrt();
        if score < threshold {
            return false;
        }
        let Some(d) = bbox.get(idx * 4..idx * 4 + 4) else {
            return false;
        };
        let w = d[2].exp() * stride as f32 / scale;
        let h = d[3].exp() * stride as f32 / scale;
        w >= YUNET_MIN_FACE_PX && h >= YUNET_MIN_FACE_PX
    })
}

/// Map "cls_8", "obj_16", "bbox_32", ... to stride slots, else positional
/// order [cls 0-2, obj 3-5, bbox 6-8, kps 9-11].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = YUNET_STRIDES
        .iter()
        .map(|&s| Some((find("cls", s)?, find("obj", s)?, find("bbox", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

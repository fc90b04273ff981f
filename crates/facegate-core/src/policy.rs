//! Threshold policy for identification and duplicate rejection.
//!
//! The two thresholds answer different questions ("do I match at the gate"
//! vs. "am I already enrolled") and are tuned independently.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cosine distance below which a probe is recognized as an enrolled identity.
pub const DEFAULT_IDENTIFY_THRESHOLD: f32 = 0.40;
/// Cosine distance below which a new enrollment is rejected as a duplicate face.
pub const DEFAULT_DUPLICATE_THRESHOLD: f32 = 0.33;

/// Cosine distance is bounded by 2.0 (opposite vectors).
const MAX_COSINE_DISTANCE: f32 = 2.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("{name} must be in (0, 2], got {value}")]
    OutOfRange { name: &'static str, value: f32 },
}

/// Both thresholds are checked on construction and on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy")]
pub struct MatchPolicy {
    pub identify_threshold: f32,
    pub duplicate_threshold: f32,
}

impl MatchPolicy {
    pub fn new(identify_threshold: f32, duplicate_threshold: f32) -> Result<Self, PolicyError> {
        check_range("identify_threshold", identify_threshold)?;
        check_range("duplicate_threshold", duplicate_threshold)?;
        Ok(Self {
            identify_threshold,
            duplicate_threshold,
        })
    }
}

#[derive(Deserialize)]
struct RawPolicy {
    identify_threshold: f32,
    duplicate_threshold: f32,
}

impl TryFrom<RawPolicy> for MatchPolicy {
    type Error = PolicyError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        Self::new(raw.identify_threshold, raw.duplicate_threshold)
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            identify_threshold: DEFAULT_IDENTIFY_THRESHOLD,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
        }
    }
}

fn check_range(name: &'static str, value: f32) -> Result<(), PolicyError> {
    // NaN fails both comparisons, so it lands here too.
    if value > 0.0 && value <= MAX_COSINE_DISTANCE {
        Ok(())
    } else {
        Err(PolicyError::OutOfRange { name, value })
    }
}

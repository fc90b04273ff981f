//! Cosine-distance matching of a probe embedding against an enrolled snapshot.

use crate::policy::MatchPolicy;
use crate::types::{Embedding, EnrolledFace, IdentityId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no identities enrolled")]
    NoEnrolledIdentities,
    #[error("face already enrolled as identity {existing_id} (distance {distance:.4})")]
    DuplicateFace { existing_id: IdentityId, distance: f32 },
}

/// Cosine distance `1 - a·b / (|a||b|)` between two equal-length vectors.
///
/// Accumulates in f64 and clamps to [0, 2]. A zero-norm operand has no
/// direction and is treated as orthogonal (distance 1.0).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, MatchError> {
    if a.len() != b.len() {
        return Err(MatchError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    let similarity = if denom > 0.0 { dot / denom } else { 0.0 };
    Ok((1.0 - similarity).clamp(0.0, 2.0) as f32)
}

/// Result of identifying a probe against an enrolled snapshot.
///
/// Borrows the winning entry from the snapshot it was computed against.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyOutcome<'a> {
    Matched { face: &'a EnrolledFace, distance: f32 },
    /// Nearest distance is still reported so callers can log and tune.
    Unmatched { distance: f32 },
}

impl IdentifyOutcome<'_> {
    pub fn distance(&self) -> f32 {
        match self {
            Self::Matched { distance, .. } | Self::Unmatched { distance } => *distance,
        }
    }

    pub fn matched_id(&self) -> Option<IdentityId> {
        match self {
            Self::Matched { face, .. } => Some(face.id),
            Self::Unmatched { .. } => None,
        }
    }
}

/// Strategy for comparing a probe embedding against enrolled faces.
pub trait Matcher {
    fn policy(&self) -> &MatchPolicy;

    /// Find the nearest enrolled face and classify it against the identify threshold.
    fn identify<'a>(
        &self,
        query: &Embedding,
        enrolled: &'a [EnrolledFace],
    ) -> Result<IdentifyOutcome<'a>, MatchError>;

    /// Fail with [`MatchError::DuplicateFace`] if any enrolled face other than
    /// `exclude` is within the duplicate threshold of `query`.
    fn check_duplicate(
        &self,
        query: &Embedding,
        enrolled: &[EnrolledFace],
        exclude: Option<IdentityId>,
    ) -> Result<(), MatchError>;
}

/// Cosine-distance matcher.
///
/// `identify` always visits every snapshot entry so that dimension mismatches
/// anywhere in the snapshot surface instead of hiding behind an early match.
#[derive(Debug, Clone, Default)]
pub struct CosineMatcher {
    policy: MatchPolicy,
}

impl CosineMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }
}

impl Matcher for CosineMatcher {
    fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    fn identify<'a>(
        &self,
        query: &Embedding,
        enrolled: &'a [EnrolledFace],
    ) -> Result<IdentifyOutcome<'a>, MatchError> {
        let mut best: Option<(&'a EnrolledFace, f32)> = None;

        for face in enrolled {
            let distance = query.distance(&face.embedding)?;
            // Strict comparison: on a tie the earlier snapshot entry wins.
            let is_better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if is_better {
                best = Some((face, distance));
            }
        }

        let (face, distance) = best.ok_or(MatchError::NoEnrolledIdentities)?;
        if distance < self.policy.identify_threshold {
            Ok(IdentifyOutcome::Matched { face, distance })
        } else {
            Ok(IdentifyOutcome::Unmatched { distance })
        }
    }

    fn check_duplicate(
        &self,
        query: &Embedding,
        enrolled: &[EnrolledFace],
        exclude: Option<IdentityId>,
    ) -> Result<(), MatchError> {
        for face in enrolled {
            if exclude == Some(face.id) {
                continue;
            }
            let distance = query.distance(&face.embedding)?;
            if distance < self.policy.duplicate_threshold {
                return Err(MatchError::DuplicateFace {
                    existing_id: face.id,
                    distance,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), None).unwrap()
    }

    fn face(id: IdentityId, values: &[f32]) -> EnrolledFace {
        EnrolledFace { id, embedding: emb(values) }
    }

    fn two_axis_gallery() -> Vec<EnrolledFace> {
        vec![face(1, &[1.0, 0.0, 0.0]), face(2, &[0.0, 1.0, 0.0])]
    }

    fn matcher(identify: f32, duplicate: f32) -> CosineMatcher {
        CosineMatcher::new(MatchPolicy::new(identify, duplicate).unwrap())
    }

    #[test]
    fn test_distance_symmetric() {
        let pairs = [
            (vec![0.3, -0.7, 0.2], vec![0.9, 0.1, -0.4]),
            (vec![1.0, 2.0, 3.0, 4.0], vec![-4.0, 3.0, -2.0, 1.0]),
            (vec![0.0, 0.0], vec![5.0, -1.0]),
        ];
        for (a, b) in pairs {
            assert_eq!(cosine_distance(&a, &b).unwrap(), cosine_distance(&b, &a).unwrap());
        }
    }

    #[test]
    fn test_distance_self_is_zero() {
        for v in [vec![1.0, 0.0, 0.0], vec![0.12, -3.4, 7.7, 0.001], vec![1e-3; 512]] {
            assert!(cosine_distance(&v, &v).unwrap().abs() < 1e-6);
        }
    }

    #[test]
    fn test_distance_orthogonal_and_opposite() {
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_zero_vector() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_distance_dimension_guard() {
        assert_eq!(
            cosine_distance(&[1.0, 0.0, 0.0], &[1.0, 0.0]),
            Err(MatchError::DimensionMismatch { expected: 3, actual: 2 })
        );
        assert_eq!(
            cosine_distance(&[1.0], &[1.0, 0.0]),
            Err(MatchError::DimensionMismatch { expected: 1, actual: 2 })
        );
    }

    #[test]
    fn test_identify_near_first_axis() {
        let gallery = two_axis_gallery();
        let query = emb(&[0.99, 0.14, 0.0]);
        let result = matcher(0.05, 0.05).identify(&query, &gallery).unwrap();

        assert_eq!(result.matched_id(), Some(1));
        // cos = 0.99 / sqrt(0.99^2 + 0.14^2)
        let expected = 1.0 - 0.99 / (0.99f64 * 0.99 + 0.14 * 0.14).sqrt();
        assert!((result.distance() as f64 - expected).abs() < 1e-6);
        assert!(result.distance() < 0.05);
    }

    #[test]
    fn test_identify_orthogonal_unmatched() {
        let gallery = two_axis_gallery();
        let query = emb(&[0.0, 0.0, 1.0]);
        let result = matcher(0.05, 0.05).identify(&query, &gallery).unwrap();

        match result {
            IdentifyOutcome::Unmatched { distance } => assert!((distance - 1.0).abs() < 1e-6),
            other => panic!("expected Unmatched, got {other:?}"),
        }
    }

    #[test]
    fn test_identify_empty_snapshot() {
        let query = emb(&[1.0, 0.0]);
        assert_eq!(
            matcher(0.4, 0.33).identify(&query, &[]),
            Err(MatchError::NoEnrolledIdentities)
        );
    }

    #[test]
    fn test_identify_scans_whole_snapshot() {
        // Best match is the last entry.
        let gallery = vec![
            face(10, &[0.0, 1.0, 0.0]),
            face(11, &[0.0, 0.0, 1.0]),
            face(12, &[1.0, 0.0, 0.0]),
        ];
        let result = matcher(0.4, 0.33).identify(&emb(&[1.0, 0.0, 0.0]), &gallery).unwrap();
        assert_eq!(result.matched_id(), Some(12));
        assert!(result.distance().abs() < 1e-6);
    }

    #[test]
    fn test_identify_tie_prefers_first() {
        let gallery = vec![face(7, &[1.0, 0.0]), face(8, &[2.0, 0.0])];
        let result = matcher(0.4, 0.33).identify(&emb(&[1.0, 0.0]), &gallery).unwrap();
        assert_eq!(result.matched_id(), Some(7));
    }

    #[test]
    fn test_identify_threshold_is_exclusive() {
        let gallery = vec![face(1, &[1.0, 0.0])];
        // distance to an orthogonal probe is exactly 1.0
        let result = matcher(1.0, 0.33).identify(&emb(&[0.0, 1.0]), &gallery).unwrap();
        assert_eq!(result, IdentifyOutcome::Unmatched { distance: 1.0 });
    }

    #[test]
    fn test_identify_threshold_monotonic() {
        let gallery = vec![
            face(1, &[0.9, 0.1, 0.2]),
            face(2, &[0.1, 0.8, 0.3]),
            face(3, &[-0.5, 0.2, 0.9]),
        ];
        let probes = [[1.0, 0.0, 0.0], [0.2, 0.9, 0.1], [0.0, 0.0, 1.0], [-1.0, -1.0, -1.0]];
        for threshold in [0.05, 0.2, 0.4, 0.9] {
            let m = matcher(threshold, 0.33);
            for p in &probes {
                let q = emb(p);
                let true_min = gallery
                    .iter()
                    .map(|f| q.distance(&f.embedding).unwrap())
                    .fold(f32::INFINITY, f32::min);
                match m.identify(&q, &gallery).unwrap() {
                    IdentifyOutcome::Matched { distance, .. } => {
                        assert!(distance < threshold);
                        assert_eq!(distance, true_min);
                    }
                    IdentifyOutcome::Unmatched { distance } => {
                        assert!(distance >= threshold);
                        assert_eq!(distance, true_min);
                    }
                }
            }
        }
    }

    #[test]
    fn test_identify_dimension_mismatch_in_snapshot() {
        let gallery = vec![face(1, &[1.0, 0.0, 0.0]), face(2, &[1.0, 0.0])];
        assert_eq!(
            matcher(0.4, 0.33).identify(&emb(&[1.0, 0.0, 0.0]), &gallery),
            Err(MatchError::DimensionMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_check_duplicate_rejects_close_face() {
        let gallery = two_axis_gallery();
        let err = matcher(0.4, 0.33)
            .check_duplicate(&emb(&[0.98, 0.1, 0.05]), &gallery, None)
            .unwrap_err();
        match err {
            MatchError::DuplicateFace { existing_id, distance } => {
                assert_eq!(existing_id, 1);
                assert!(distance < 0.33);
            }
            other => panic!("expected DuplicateFace, got {other:?}"),
        }
    }

    #[test]
    fn test_check_duplicate_accepts_distinct_face() {
        let gallery = two_axis_gallery();
        assert!(matcher(0.4, 0.33)
            .check_duplicate(&emb(&[0.0, 0.0, 1.0]), &gallery, None)
            .is_ok());
    }

    #[test]
    fn test_check_duplicate_excludes_self() {
        let gallery = two_axis_gallery();
        // Identical to identity 1's embedding, but identity 1 is the one being updated.
        assert!(matcher(0.4, 0.33)
            .check_duplicate(&emb(&[1.0, 0.0, 0.0]), &gallery, Some(1))
            .is_ok());
        // Still rejected against everyone else.
        assert!(matches!(
            matcher(0.4, 0.33).check_duplicate(&emb(&[0.0, 1.0, 0.0]), &gallery, Some(1)),
            Err(MatchError::DuplicateFace { existing_id: 2, .. })
        ));
    }

    #[test]
    fn test_check_duplicate_uses_duplicate_threshold() {
        let gallery = vec![face(1, &[1.0, 0.0])];
        // distance ~0.106: inside identify threshold, outside a tight duplicate threshold
        let probe = emb(&[0.9, 0.45]);
        let m = matcher(0.4, 0.05);
        assert!(m.check_duplicate(&probe, &gallery, None).is_ok());
        assert_eq!(m.identify(&probe, &gallery).unwrap().matched_id(), Some(1));
    }

    #[test]
    fn test_check_duplicate_empty_snapshot() {
        assert!(matcher(0.4, 0.33).check_duplicate(&emb(&[1.0]), &[], None).is_ok());
    }

    #[test]
    fn test_check_duplicate_dimension_mismatch() {
        let gallery = vec![face(1, &[1.0, 0.0])];
        assert!(matches!(
            matcher(0.4, 0.33).check_duplicate(&emb(&[1.0, 0.0, 0.0]), &gallery, None),
            Err(MatchError::DimensionMismatch { .. })
        ));
    }
}

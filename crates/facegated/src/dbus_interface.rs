use crate::engine::EngineHandle;
use crate::gate::{Gate, GateError, ImageUpload};
use crate::store::{IdentityPatch, NewIdentity, SqliteStore, StoreError};
use facegate_core::{CosineMatcher, ExtractionError, MatchError, Matcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Gate1";
pub const OBJECT_PATH: &str = "/org/facegate/Gate1";

pub type DaemonGate = Gate<SqliteStore, EngineHandle, CosineMatcher>;

/// Typed errors returned over the bus as `org.facegate.Gate1.Error.<Variant>`.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.facegate.Gate1.Error")]
pub enum GateBusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    InvalidImage(String),
    NoFaceDetected(String),
    InvalidFace(String),
    ExtractionFailure(String),
    DimensionMismatch(String),
    DuplicateFace(String),
    NoEnrolledIdentities(String),
    NotFound(String),
    InvalidArgs(String),
    Conflict(String),
    Internal(String),
}

impl From<GateError> for GateBusError {
    fn from(err: GateError) -> Self {
        let msg = err.to_string();
        match err {
            GateError::InvalidArgs(_) => Self::InvalidArgs(msg),
            GateError::NotFound(_) => Self::NotFound(msg),
            GateError::Extraction(e) => match e {
                ExtractionError::InvalidImage(_) => Self::InvalidImage(msg),
                ExtractionError::NoFaceDetected => Self::NoFaceDetected(msg),
                ExtractionError::InvalidFace(_) => Self::InvalidFace(msg),
                ExtractionError::ExtractionFailure(_) => Self::ExtractionFailure(msg),
            },
            GateError::Match(e) => match e {
                MatchError::DimensionMismatch { .. } => Self::DimensionMismatch(msg),
                MatchError::NoEnrolledIdentities => Self::NoEnrolledIdentities(msg),
                MatchError::DuplicateFace { .. } => Self::DuplicateFace(msg),
            },
            GateError::Store(StoreError::EmailTaken(_)) => Self::Conflict(msg),
            GateError::Store(_) | GateError::Image(_) => {
                tracing::error!(error = %msg, "internal failure");
                Self::Internal(msg)
            }
        }
    }
}

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Gate1
/// Object path: /org/facegate/Gate1
///
/// Structured results are JSON strings.
pub struct GateService {
    gate: Arc<DaemonGate>,
    model_version: String,
}

impl GateService {
    pub fn new(gate: Arc<DaemonGate>, model_version: impl Into<String>) -> Self {
        Self {
            gate,
            model_version: model_version.into(),
        }
    }
}

#[interface(name = "org.facegate.Gate1")]
impl GateService {
    /// Enroll a new identity. `identity` is `{"given_name", "family_name", "email"?}`.
    async fn enroll(&self, identity: &str, content_type: &str, image: Vec<u8>) -> Result<String, GateBusError> {
        let identity: NewIdentity = parse_json("identity", identity)?;
        tracing::info!(bytes = image.len(), content_type, "enroll requested");
        let enrolled = self.gate.enroll(identity, ImageUpload::new(content_type, image)).await?;
        to_json(&enrolled)
    }

    /// Identify the face in `image` among enrolled identities.
    async fn identify(&self, content_type: &str, image: Vec<u8>) -> Result<String, GateBusError> {
        tracing::info!(bytes = image.len(), content_type, "identify requested");
        let recognition = self.gate.identify(ImageUpload::new(content_type, image)).await?;
        to_json(&recognition)
    }

    /// Whether `image` contains a detectable face.
    async fn has_face(&self, content_type: &str, image: Vec<u8>) -> Result<bool, GateBusError> {
        Ok(self.gate.has_face(ImageUpload::new(content_type, image)).await?)
    }

    /// Patch attributes; a non-empty `image` also replaces the enrolled face.
    async fn update(
        &self,
        id: i64,
        patch: &str,
        content_type: &str,
        image: Vec<u8>,
    ) -> Result<String, GateBusError> {
        let patch: IdentityPatch = if patch.trim().is_empty() {
            IdentityPatch::default()
        } else {
            parse_json("patch", patch)?
        };
        let image = (!image.is_empty()).then(|| ImageUpload::new(content_type, image));
        tracing::info!(id, replace_face = image.is_some(), "update requested");
        let updated = self.gate.update(id, patch, image).await?;
        to_json(&updated)
    }

    /// Remove an identity and its photo; returns the removed record.
    async fn remove(&self, id: i64) -> Result<String, GateBusError> {
        tracing::info!(id, "remove requested");
        let removed = self.gate.delete(id).await?;
        to_json(&removed)
    }

    async fn get_identity(&self, id: i64) -> Result<String, GateBusError> {
        to_json(&self.gate.get(id).await?)
    }

    async fn list_identities(&self) -> Result<String, GateBusError> {
        to_json(&self.gate.list().await?)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, GateBusError> {
        let enrolled = self
            .gate
            .store()
            .count()
            .await
            .map_err(|e| GateBusError::from(GateError::from(e)))?;
        let policy = self.gate.matcher().policy();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_version": self.model_version,
            "enrolled": enrolled,
            "identify_threshold": policy.identify_threshold,
            "duplicate_threshold": policy.duplicate_threshold,
        })
        .to_string())
    }
}

fn parse_json<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T, GateBusError> {
    serde_json::from_str(raw).map_err(|e| GateBusError::InvalidArgs(format!("malformed {what} JSON: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, GateBusError> {
    serde_json::to_string(value).map_err(|e| GateBusError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_of(err: GateError) -> &'static str {
        match GateBusError::from(err) {
            GateBusError::ZBus(_) => "ZBus",
            GateBusError::InvalidImage(_) => "InvalidImage",
            GateBusError::NoFaceDetected(_) => "NoFaceDetected",
            GateBusError::InvalidFace(_) => "InvalidFace",
            GateBusError::ExtractionFailure(_) => "ExtractionFailure",
            GateBusError::DimensionMismatch(_) => "DimensionMismatch",
            GateBusError::DuplicateFace(_) => "DuplicateFace",
            GateBusError::NoEnrolledIdentities(_) => "NoEnrolledIdentities",
            GateBusError::NotFound(_) => "NotFound",
            GateBusError::InvalidArgs(_) => "InvalidArgs",
            GateBusError::Conflict(_) => "Conflict",
            GateBusError::Internal(_) => "Internal",
        }
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(name_of(ExtractionError::InvalidImage("x".into()).into()), "InvalidImage");
        assert_eq!(name_of(ExtractionError::NoFaceDetected.into()), "NoFaceDetected");
        assert_eq!(name_of(ExtractionError::InvalidFace("x".into()).into()), "InvalidFace");
        assert_eq!(name_of(ExtractionError::ExtractionFailure("x".into()).into()), "ExtractionFailure");
        assert_eq!(
            name_of(MatchError::DimensionMismatch { expected: 512, actual: 128 }.into()),
            "DimensionMismatch"
        );
        assert_eq!(name_of(MatchError::NoEnrolledIdentities.into()), "NoEnrolledIdentities");
        assert_eq!(
            name_of(MatchError::DuplicateFace { existing_id: 3, distance: 0.1 }.into()),
            "DuplicateFace"
        );
        assert_eq!(name_of(GateError::NotFound(9)), "NotFound");
        assert_eq!(name_of(GateError::InvalidArgs("x".into())), "InvalidArgs");
        assert_eq!(name_of(StoreError::EmailTaken("a@b.c".into()).into()), "Conflict");
    }

    #[test]
    fn test_error_message_kept() {
        match GateBusError::from(GateError::from(MatchError::DuplicateFace { existing_id: 3, distance: 0.125 })) {
            GateBusError::DuplicateFace(msg) => assert!(msg.contains("identity 3")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_identity_payload() {
        let identity: NewIdentity = parse_json("identity", r#"{"given_name":"Ana","family_name":"Rojas"}"#).unwrap();
        assert_eq!(identity.email, None);

        let err = parse_json::<NewIdentity>("identity", r#"{"given_name":"Ana"}"#).unwrap_err();
        assert!(matches!(err, GateBusError::InvalidArgs(_)));

        let patch: IdentityPatch = parse_json("patch", r#"{"email":"ana@example.org"}"#).unwrap();
        assert_eq!(patch.email.as_deref(), Some("ana@example.org"));
        assert!(patch.given_name.is_none());
    }
}

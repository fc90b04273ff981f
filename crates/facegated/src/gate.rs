//! Enrollment, identification and identity lifecycle.
//!
//! The gate ties the analyzer (image → embedding), the matcher and the
//! stores together. Extraction runs outside any lock; the duplicate check
//! and the write that follows it run under a single enrollment lock so two
//! concurrent enrollments of the same face cannot both pass.

use crate::images::{ImageError, ImageStore};
use crate::store::{IdentityPatch, IdentityStore, NewIdentity, StoreError};
use facegate_core::extractor::check_content_type;
use facegate_core::{Embedding, ExtractionError, IdentifyOutcome, Identity, IdentityId, MatchError, Matcher};
use serde::Serialize;
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;

pub const MAX_NAME_LEN: usize = 100;

/// Snapshots taken by one identify call before giving up on a store under churn.
const MAX_IDENTIFY_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("invalid argument: {0}")]
    InvalidArgs(String),
    #[error("identity {0} not found")]
    NotFound(IdentityId),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Image bytes as received, with the caller's declared content type.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// Outcome of [`Gate::identify`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Recognition {
    Recognized { identity: Identity, distance: f32 },
    Unrecognized { distance: f32 },
}

/// Image analysis capability the gate depends on.
pub trait FaceAnalyzer: Send + Sync {
    fn extract(&self, image: Vec<u8>) -> impl Future<Output = Result<Embedding, ExtractionError>> + Send;

    fn has_face(&self, image: Vec<u8>) -> impl Future<Output = Result<bool, ExtractionError>> + Send;
}

pub struct Gate<S, A, M> {
    store: S,
    analyzer: A,
    matcher: M,
    images: ImageStore,
    max_image_bytes: usize,
    enroll_lock: Mutex<()>,
}

impl<S, A, M> Gate<S, A, M>
where
    S: IdentityStore,
    A: FaceAnalyzer,
    M: Matcher + Send + Sync,
{
    pub fn new(store: S, analyzer: A, matcher: M, images: ImageStore, max_image_bytes: usize) -> Self {
        Self {
            store,
            analyzer,
            matcher,
            images,
            max_image_bytes,
            enroll_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    /// Register a new identity from its attributes and a face photo.
    pub async fn enroll(&self, identity: NewIdentity, image: ImageUpload) -> Result<Identity, GateError> {
        let identity = validate_new(identity)?;
        self.check_upload(&image)?;

        let embedding = self.analyzer.extract(image.bytes.clone()).await?;

        let _guard = self.enroll_lock.lock().await;
        let snapshot = self.store.fetch_all_embeddings().await?;
        if let Err(e) = self.matcher.check_duplicate(&embedding, &snapshot, None) {
            if let MatchError::DuplicateFace { existing_id, distance } = &e {
                tracing::info!(existing_id, distance, "enrollment rejected as duplicate face");
            }
            return Err(e.into());
        }

        let image_ref = self.images.save(&image.bytes, &image.content_type).await?;
        match self.store.insert(identity, embedding, Some(image_ref.clone())).await {
            Ok(enrolled) => {
                tracing::info!(id = enrolled.id, enrolled = snapshot.len() + 1, "identity enrolled");
                Ok(enrolled)
            }
            Err(e) => {
                self.discard_image(&image_ref).await;
                Err(e.into())
            }
        }
    }

    /// Match the face in `image` against every enrolled identity.
    ///
    /// A match whose identity is deleted before it can be loaded is retried
    /// against a fresh snapshot, so the result never names a removed identity
    /// and `Unrecognized` always carries a distance at or above the threshold.
    pub async fn identify(&self, image: ImageUpload) -> Result<Recognition, GateError> {
        self.check_upload(&image)?;
        let embedding = self.analyzer.extract(image.bytes).await?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let snapshot = self.store.fetch_all_embeddings().await?;
            let (face, distance) = match self.matcher.identify(&embedding, &snapshot)? {
                IdentifyOutcome::Matched { face, distance } => (face, distance),
                IdentifyOutcome::Unmatched { distance } => {
                    tracing::info!(distance, enrolled = snapshot.len(), "face not recognized");
                    return Ok(Recognition::Unrecognized { distance });
                }
            };

            match self.store.get(face.id).await? {
                Some(identity) => {
                    tracing::info!(id = identity.id, name = %identity.display_name(), distance, "face recognized");
                    return Ok(Recognition::Recognized { identity, distance });
                }
                None if attempts < MAX_IDENTIFY_ATTEMPTS => {
                    tracing::debug!(id = face.id, attempts, "matched identity removed before lookup, rematching");
                }
                None => {
                    tracing::warn!(id = face.id, attempts, "matched identities keep disappearing");
                    return Err(GateError::NotFound(face.id));
                }
            }
        }
    }

    /// Cheap presence check; never touches the store.
    pub async fn has_face(&self, image: ImageUpload) -> Result<bool, GateError> {
        self.check_upload(&image)?;
        Ok(self.analyzer.has_face(image.bytes).await?)
    }

    /// Change attributes and optionally the enrolled face.
    pub async fn update(
        &self,
        id: IdentityId,
        patch: IdentityPatch,
        image: Option<ImageUpload>,
    ) -> Result<Identity, GateError> {
        let patch = validate_patch(patch)?;

        let Some(image) = image else {
            if patch.is_empty() {
                return Err(GateError::InvalidArgs("nothing to update".into()));
            }
            return self.store.update(id, patch, None).await?.ok_or(GateError::NotFound(id));
        };

        self.check_upload(&image)?;
        let embedding = self.analyzer.extract(image.bytes.clone()).await?;

        let _guard = self.enroll_lock.lock().await;
        let previous = self.store.get(id).await?.ok_or(GateError::NotFound(id))?;
        let snapshot = self.store.fetch_all_embeddings().await?;
        self.matcher.check_duplicate(&embedding, &snapshot, Some(id))?;

        let image_ref = self.images.save(&image.bytes, &image.content_type).await?;
        let updated = match self.store.update(id, patch, Some((embedding, image_ref.clone()))).await {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                self.discard_image(&image_ref).await;
                return Err(GateError::NotFound(id));
            }
            Err(e) => {
                self.discard_image(&image_ref).await;
                return Err(e.into());
            }
        };

        if let Some(old) = previous.image_ref.as_deref() {
            self.discard_image(old).await;
        }
        tracing::info!(id, "enrolled face replaced");
        Ok(updated)
    }

    /// Remove an identity and its photo.
    pub async fn delete(&self, id: IdentityId) -> Result<Identity, GateError> {
        let removed = self.store.delete(id).await?.ok_or(GateError::NotFound(id))?;
        if let Some(image_ref) = removed.image_ref.as_deref() {
            self.discard_image(image_ref).await;
        }
        Ok(removed)
    }

    pub async fn get(&self, id: IdentityId) -> Result<Identity, GateError> {
        self.store.get(id).await?.ok_or(GateError::NotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<Identity>, GateError> {
        Ok(self.store.list().await?)
    }

    fn check_upload(&self, image: &ImageUpload) -> Result<(), GateError> {
        check_content_type(&image.content_type)?;
        if image.bytes.len() > self.max_image_bytes {
            return Err(ExtractionError::InvalidImage(format!(
                "image is {} bytes; limit is {}",
                image.bytes.len(),
                self.max_image_bytes
            ))
            .into());
        }
        Ok(())
    }

    /// Photo cleanup never fails the operation that triggered it.
    async fn discard_image(&self, image_ref: &str) {
        if let Err(e) = self.images.remove(image_ref).await {
            tracing::warn!(image_ref, error = %e, "failed to remove image");
        }
    }
}

fn validate_new(identity: NewIdentity) -> Result<NewIdentity, GateError> {
    Ok(NewIdentity {
        given_name: validate_name("given_name", &identity.given_name)?,
        family_name: validate_name("family_name", &identity.family_name)?,
        email: identity.email.as_deref().map(normalize_email).transpose()?,
    })
}

fn validate_patch(patch: IdentityPatch) -> Result<IdentityPatch, GateError> {
    Ok(IdentityPatch {
        given_name: patch
            .given_name
            .as_deref()
            .map(|v| validate_name("given_name", v))
            .transpose()?,
        family_name: patch
            .family_name
            .as_deref()
            .map(|v| validate_name("family_name", v))
            .transpose()?,
        email: patch.email.as_deref().map(normalize_email).transpose()?,
    })
}

fn validate_name(field: &str, value: &str) -> Result<String, GateError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GateError::InvalidArgs(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(GateError::InvalidArgs(format!(
            "{field} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Lower-case and check the `local@domain.tld` shape. Local part and domain
/// take word characters, dots and hyphens; the TLD takes word characters.
fn normalize_email(value: &str) -> Result<String, GateError> {
    let email = value.trim().to_lowercase();
    let invalid = || GateError::InvalidArgs(format!("invalid email address {value:?}"));

    let word = |c: char| c.is_alphanumeric() || c == '_';
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    let (host, tld) = domain.rsplit_once('.').ok_or_else(invalid)?;

    let ok = !local.is_empty()
        && local.chars().all(|c| word(c) || c == '.' || c == '-')
        && !host.is_empty()
        && host.chars().all(|c| word(c) || c == '.' || c == '-')
        && !tld.is_empty()
        && tld.chars().all(word);

    if ok {
        Ok(email)
    } else {
        Err(invalid())
    }
}

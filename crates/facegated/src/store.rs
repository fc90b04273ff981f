//! Identity persistence.
//!
//! One row per identity: display attributes, the enrollment embedding as a
//! little-endian f32 BLOB, and a reference to the stored photo.

use facegate_core::{Embedding, EnrolledFace, Identity, IdentityId};
use rusqlite::{params, ErrorCode, OptionalExtension};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("email {0} is already registered")]
    EmailTaken(String),
    #[error("stored embedding for identity {id} is unreadable: {reason}")]
    Corrupt { id: IdentityId, reason: String },
}

/// Attributes of an identity about to be enrolled.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewIdentity {
    pub given_name: String,
    pub family_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Partial attribute update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentityPatch {
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email: Option<String>,
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.given_name.is_none() && self.family_name.is_none() && self.email.is_none()
    }
}

/// Storage seam used by the gate. Implementations must return the snapshot
/// from [`fetch_all_embeddings`](Self::fetch_all_embeddings) as one
/// consistent read.
pub trait IdentityStore: Send + Sync {
    fn fetch_all_embeddings(&self) -> impl Future<Output = Result<Vec<EnrolledFace>, StoreError>> + Send;

    fn get(&self, id: IdentityId) -> impl Future<Output = Result<Option<Identity>, StoreError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<Identity>, StoreError>> + Send;

    fn insert(
        &self,
        identity: NewIdentity,
        embedding: Embedding,
        image_ref: Option<String>,
    ) -> impl Future<Output = Result<Identity, StoreError>> + Send;

    /// Apply `patch`, and replace the embedding and photo when `face` is given.
    /// Returns `None` if the identity does not exist.
    fn update(
        &self,
        id: IdentityId,
        patch: IdentityPatch,
        face: Option<(Embedding, String)>,
    ) -> impl Future<Output = Result<Option<Identity>, StoreError>> + Send;

    /// Remove the identity, returning what was removed.
    fn delete(&self, id: IdentityId) -> impl Future<Output = Result<Option<Identity>, StoreError>> + Send;
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    given_name TEXT NOT NULL,
    family_name TEXT NOT NULL,
    email TEXT UNIQUE,
    embedding BLOB NOT NULL,
    model_version TEXT,
    image_ref TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const IDENTITY_COLUMNS: &str = "id, given_name, family_name, email, image_ref, created_at, updated_at";

/// SQLite-backed store. All statements run on tokio-rusqlite's connection thread.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "identity store opened");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?))
            .await?;
        Ok(n.max(0) as usize)
    }
}

impl IdentityStore for SqliteStore {
    async fn fetch_all_embeddings(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        let rows: Vec<(IdentityId, Vec<u8>, Option<String>)> = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare("SELECT id, embedding, model_version FROM identities ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, blob, model_version)| {
                let embedding = Embedding::from_le_bytes(&blob, model_version).map_err(|e| StoreError::Corrupt {
                    id,
                    reason: e.to_string(),
                })?;
                Ok(EnrolledFace { id, embedding })
            })
            .collect()
    }

    async fn get(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        Ok(self.conn.call(move |c| Ok(select_identity(c, id)?)).await?)
    }

    async fn list(&self) -> Result<Vec<Identity>, StoreError> {
        let identities = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(&format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id"))?;
                let rows = stmt
                    .query_map([], identity_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(identities)
    }

    async fn insert(
        &self,
        identity: NewIdentity,
        embedding: Embedding,
        image_ref: Option<String>,
    ) -> Result<Identity, StoreError> {
        let email = identity.email.clone();
        let now = now();
        let blob = embedding.to_le_bytes();

        let result = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO identities (
                        given_name, family_name, email, embedding, model_version,
                        image_ref, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        identity.given_name,
                        identity.family_name,
                        identity.email,
                        blob,
                        embedding.model_version,
                        image_ref,
                        now,
                    ],
                )?;
                Ok(Identity {
                    id: c.last_insert_rowid(),
                    given_name: identity.given_name,
                    family_name: identity.family_name,
                    email: identity.email,
                    image_ref,
                    created_at: now.clone(),
                    updated_at: now,
                })
            })
            .await;

        let identity = result.map_err(|e| map_unique_violation(e, email))?;
        tracing::info!(id = identity.id, "identity inserted");
        Ok(identity)
    }

    async fn update(
        &self,
        id: IdentityId,
        patch: IdentityPatch,
        face: Option<(Embedding, String)>,
    ) -> Result<Option<Identity>, StoreError> {
        let email = patch.email.clone();
        let now = now();

        let result = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let Some(mut current) = select_identity(&tx, id)? else {
                    return Ok(None);
                };

                if let Some(v) = patch.given_name {
                    current.given_name = v;
                }
                if let Some(v) = patch.family_name {
                    current.family_name = v;
                }
                if let Some(v) = patch.email {
                    current.email = Some(v);
                }
                current.updated_at = now;

                tx.execute(
                    "UPDATE identities
                     SET given_name = ?2, family_name = ?3, email = ?4, updated_at = ?5
                     WHERE id = ?1",
                    params![id, current.given_name, current.family_name, current.email, current.updated_at],
                )?;

                if let Some((embedding, image_ref)) = face {
                    tx.execute(
                        "UPDATE identities SET embedding = ?2, model_version = ?3, image_ref = ?4 WHERE id = ?1",
                        params![id, embedding.to_le_bytes(), embedding.model_version, image_ref],
                    )?;
                    current.image_ref = Some(image_ref);
                }

                tx.commit()?;
                Ok(Some(current))
            })
            .await;

        let updated = result.map_err(|e| map_unique_violation(e, email))?;
        if updated.is_some() {
            tracing::info!(id, "identity updated");
        }
        Ok(updated)
    }

    async fn delete(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        let removed = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let existing = select_identity(&tx, id)?;
                if existing.is_some() {
                    tx.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(existing)
            })
            .await?;

        if removed.is_some() {
            tracing::info!(id, "identity deleted");
        }
        Ok(removed)
    }
}

fn select_identity(c: &rusqlite::Connection, id: IdentityId) -> rusqlite::Result<Option<Identity>> {
    c.query_row(
        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
        params![id],
        identity_from_row,
    )
    .optional()
}

fn identity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        given_name: row.get(1)?,
        family_name: row.get(2)?,
        email: row.get(3)?,
        image_ref: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// The only UNIQUE column is `email`, so a constraint failure on write means
/// the address is taken.
fn map_unique_violation(err: tokio_rusqlite::Error, email: Option<String>) -> StoreError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) = &err {
        if e.code == ErrorCode::ConstraintViolation {
            if let Some(email) = email {
                return StoreError::EmailTaken(email);
            }
        }
    }
    StoreError::Database(err)
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

//! Narrative persistence.
//!
//! Narratives are stored as whole documents. Every write is a compare-and-set
//! on `version`, so concurrent detection and sweep runs cannot clobber each
//! other; the loser gets [`StoreError::Conflict`] and retries from a fresh read.

mod postgres;

pub use postgres::PgNarrativeStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use coinwire_common::{Narrative, NarrativeDocument};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on narrative {id}: expected {expected}")]
    Conflict { id: Uuid, expected: i64 },

    #[error("narrative {0} not found")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("narrative store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait NarrativeStore: Send + Sync {
    /// Narratives eligible for matching: everything not archived, plus archived
    /// narratives updated at or after `archived_since`. Absorbed narratives and
    /// legacy documents are never returned.
    async fn find_active_narratives(&self, archived_since: DateTime<Utc>) -> StoreResult<Vec<Narrative>>;

    /// `None` when the id is unknown or the stored document is legacy.
    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Narrative>>;

    /// Non-absorbed narratives whose top-level `nucleus_entity` equals `nucleus`.
    async fn find_by_nucleus(&self, nucleus: &str) -> StoreResult<Vec<Narrative>>;

    /// Compare-and-set write. `version == 0` creates (the id must be absent);
    /// otherwise the stored version must equal `narrative.version`. Returns the
    /// narrative as written, carrying its new version.
    async fn upsert(&self, narrative: &Narrative) -> StoreResult<Narrative>;

    /// Documents that cannot be read as a [`Narrative`]. Their `version` is the
    /// stored one, so a repaired narrative can be written back through `upsert`.
    async fn find_legacy_documents(&self) -> StoreResult<Vec<NarrativeDocument>>;
}

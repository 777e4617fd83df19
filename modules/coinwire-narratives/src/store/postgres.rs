use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use coinwire_common::{Narrative, NarrativeDocument};

use super::{NarrativeStore, StoreError, StoreResult};

type DocumentRow = (Uuid, i64, serde_json::Value);

/// Postgres-backed narrative store. The full document lives in a JSONB column;
/// the columns used for filtering are kept alongside it and written in the
/// same statement.
#[derive(Clone)]
pub struct PgNarrativeStore {
    pool: PgPool,
}

impl PgNarrativeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(&self, narrative: &Narrative) -> StoreResult<Narrative> {
        let mut written = narrative.clone();
        written.version = 1;
        let document = serde_json::to_value(NarrativeDocument::from(&written))?;

        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO narratives (id, nucleus_entity, lifecycle_state, last_updated, merged_into, version, document)
            VALUES ($1, $2, $3, $4, $5, 1, $6)
            ON CONFLICT (id) DO NOTHING
            RETURNING version
            "#,
        )
        .bind(written.id)
        .bind(&written.nucleus_entity)
        .bind(written.lifecycle_state.to_string())
        .bind(written.last_updated)
        .bind(written.merged_into)
        .bind(&document)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(_) => Ok(written),
            None => Err(StoreError::Conflict {
                id: narrative.id,
                expected: 0,
            }),
        }
    }

    async fn update(&self, narrative: &Narrative) -> StoreResult<Narrative> {
        let mut written = narrative.clone();
        written.version = narrative.version + 1;
        let document = serde_json::to_value(NarrativeDocument::from(&written))?;

        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            UPDATE narratives
            SET nucleus_entity = $3,
                lifecycle_state = $4,
                last_updated = $5,
                merged_into = $6,
                document = $7,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(written.id)
        .bind(narrative.version)
        .bind(&written.nucleus_entity)
        .bind(written.lifecycle_state.to_string())
        .bind(written.last_updated)
        .bind(written.merged_into)
        .bind(&document)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((version,)) => {
                written.version = version;
                Ok(written)
            }
            None => Err(StoreError::Conflict {
                id: narrative.id,
                expected: narrative.version,
            }),
        }
    }
}

/// Decode a row into a document, taking `version` from the column.
fn decode_document((id, version, document): DocumentRow) -> StoreResult<NarrativeDocument> {
    let mut doc: NarrativeDocument = serde_json::from_value(document)?;
    if doc.id != id {
        warn!(row_id = %id, document_id = %doc.id, "Document id disagrees with row id, using row id");
        doc.id = id;
    }
    doc.version = version;
    Ok(doc)
}

/// Decode rows into narratives, skipping legacy and unreadable documents.
fn decode_narratives(rows: Vec<DocumentRow>) -> Vec<Narrative> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.0;
            let doc = match decode_document(row) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(narrative_id = %id, error = %e, "Skipping unreadable narrative document");
                    return None;
                }
            };
            match Narrative::try_from(doc) {
                Ok(narrative) => Some(narrative),
                Err(reason) => {
                    warn!(narrative_id = %id, %reason, "Skipping legacy narrative until backfilled");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl NarrativeStore for PgNarrativeStore {
    async fn find_active_narratives(&self, archived_since: DateTime<Utc>) -> StoreResult<Vec<Narrative>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, version, document
            FROM narratives
            WHERE merged_into IS NULL
              AND (lifecycle_state <> 'archived' OR last_updated >= $1)
            ORDER BY last_updated DESC, id
            "#,
        )
        .bind(archived_since)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_narratives(rows))
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Narrative>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, version, document FROM narratives WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|row| decode_narratives(vec![row]).pop()))
    }

    async fn find_by_nucleus(&self, nucleus: &str) -> StoreResult<Vec<Narrative>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, version, document
            FROM narratives
            WHERE nucleus_entity = $1 AND merged_into IS NULL
            ORDER BY last_updated DESC, id
            "#,
        )
        .bind(nucleus)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_narratives(rows))
    }

    async fn upsert(&self, narrative: &Narrative) -> StoreResult<Narrative> {
        if narrative.version == 0 {
            self.insert(narrative).await
        } else {
            self.update(narrative).await
        }
    }

    async fn find_legacy_documents(&self) -> StoreResult<Vec<NarrativeDocument>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, version, document
            FROM narratives
            WHERE nucleus_entity IS NULL
               OR document->'fingerprint' IS NULL
               OR jsonb_typeof(document->'fingerprint') = 'null'
               OR document->'fingerprint'->>'nucleus_entity' IS DISTINCT FROM nucleus_entity
               OR document->>'nucleus_entity' IS DISTINCT FROM nucleus_entity
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0;
            match decode_document(row) {
                Ok(doc) if doc.legacy_reason().is_some() => documents.push(doc),
                Ok(_) => {}
                Err(e) => warn!(narrative_id = %id, error = %e, "Skipping unreadable narrative document"),
            }
        }
        Ok(documents)
    }
}

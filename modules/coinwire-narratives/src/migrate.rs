use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use coinwire_common::{LegacyReason, MatchingConfig, Narrative, NarrativeDocument};

use crate::fingerprint::{compute_fingerprint, MentionTally};
use crate::lifecycle::sanitize_velocity;
use crate::merge::refresh_aggregates;
use crate::retry::retry_on_conflict;
use crate::store::{NarrativeStore, StoreError};

/// Idempotent schema statements for the narrative store.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS narratives (
        id              UUID         PRIMARY KEY,
        nucleus_entity  TEXT,
        lifecycle_state TEXT         NOT NULL,
        last_updated    TIMESTAMPTZ  NOT NULL,
        merged_into     UUID,
        version         BIGINT       NOT NULL DEFAULT 1 CHECK (version >= 1),
        document        JSONB        NOT NULL,
        created_at      TIMESTAMPTZ  NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ  NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS narratives_nucleus_idx ON narratives (nucleus_entity) WHERE merged_into IS NULL",
    "CREATE INDEX IF NOT EXISTS narratives_state_updated_idx ON narratives (lifecycle_state, last_updated DESC)",
];

/// Run idempotent schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Running narrative schema migrations...");
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Narrative schema migration complete");
    Ok(())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillStats {
    pub examined: u32,
    pub repaired: u32,
    /// Documents with no actors at all; left as they are.
    pub unrecoverable: u32,
    pub failed: u32,
}

impl std::fmt::Display for BackfillStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Fingerprint backfill: {} examined, {} repaired, {} unrecoverable, {} failed",
            self.examined, self.repaired, self.unrecoverable, self.failed,
        )
    }
}

/// Rebuild a legacy document into a valid narrative.
///
/// Actor weights come from `actor_counts`, or from `entities` at weight 1 when
/// the document predates the counts. `None` when neither has an actor.
pub fn repair_document(doc: NarrativeDocument, top_actors: usize) -> Option<Narrative> {
    let mut tally = MentionTally::from_counts(&doc.actor_counts);
    if tally.is_empty() {
        for entity in &doc.entities {
            tally.add(entity, 1);
        }
    }
    let fingerprint = compute_fingerprint(&tally, top_actors)?;

    let mut narrative = Narrative {
        id: doc.id,
        theme: doc.theme,
        title: doc.title,
        summary: doc.summary,
        nucleus_entity: fingerprint.nucleus_entity.clone(),
        entities: fingerprint.top_actors.clone(),
        actor_counts: Vec::new(),
        article_actors: doc.article_actors,
        tensions: doc.tensions,
        article_ids: doc.article_ids,
        article_count: 0,
        mention_velocity: sanitize_velocity(doc.mention_velocity),
        recency_score: doc.recency_score.clamp(0.0, 1.0),
        lifecycle_state: doc.lifecycle_state,
        lifecycle_history: doc.lifecycle_history,
        fingerprint,
        first_seen: doc.first_seen,
        last_updated: doc.last_updated,
        merged_into: doc.merged_into,
        version: doc.version,
    };
    refresh_aggregates(&mut narrative, tally, top_actors);
    Some(narrative)
}

/// What one backfill attempt did with a legacy document.
enum Repair {
    Repaired(Narrative),
    Unrecoverable,
    /// Another writer already turned it into a valid narrative.
    AlreadyValid,
}

/// Repair every legacy document in the store. Safe to re-run: repaired
/// documents are no longer legacy, and unrecoverable ones stay untouched.
/// A write that loses a version race re-reads the document and repairs again.
pub async fn backfill_fingerprints(
    store: &dyn NarrativeStore,
    config: &MatchingConfig,
) -> Result<BackfillStats, StoreError> {
    let mut stats = BackfillStats::default();

    info!("Backfilling narrative fingerprints...");
    for doc in store.find_legacy_documents().await? {
        stats.examined += 1;
        let id = doc.id;
        let reason = doc.legacy_reason().unwrap_or(LegacyReason::MissingFingerprint);

        let repaired = retry_on_conflict(config.max_merge_attempts, |attempt| {
            let snapshot = (attempt == 1).then(|| doc.clone());
            async move {
                let current = match snapshot {
                    Some(doc) => doc,
                    None => match reload_legacy(store, id).await? {
                        Some(doc) => doc,
                        None => return Ok(Repair::AlreadyValid),
                    },
                };
                let Some(narrative) = repair_document(current, config.top_actors) else {
                    return Ok(Repair::Unrecoverable);
                };
                let written = store.upsert(&narrative).await?;
                Ok::<_, StoreError>(Repair::Repaired(written))
            }
        })
        .await;

        match repaired {
            Ok(Repair::Repaired(narrative)) => {
                stats.repaired += 1;
                info!(
                    narrative_id = %id,
                    %reason,
                    nucleus = %narrative.nucleus_entity,
                    "Repaired legacy narrative"
                );
            }
            Ok(Repair::Unrecoverable) => {
                stats.unrecoverable += 1;
                warn!(narrative_id = %id, %reason, "Legacy narrative has no actors, cannot fingerprint");
            }
            Ok(Repair::AlreadyValid) => {}
            Err(e @ StoreError::Conflict { .. }) => {
                stats.failed += 1;
                warn!(narrative_id = %id, error = %e, "Legacy narrative kept changing during backfill, retry next run");
            }
            Err(e) => return Err(e),
        }
    }

    info!(%stats, "Fingerprint backfill complete");
    Ok(stats)
}

/// Fresh copy of a legacy document, or `None` once it reads as a narrative.
async fn reload_legacy(store: &dyn NarrativeStore, id: Uuid) -> Result<Option<NarrativeDocument>, StoreError> {
    Ok(store
        .find_legacy_documents()
        .await?
        .into_iter()
        .find(|doc| doc.id == id))
}

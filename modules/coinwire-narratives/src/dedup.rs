//! Duplicate consolidation.
//!
//! Two detection runs racing each other, or a narrative that drifted toward
//! another, can leave near-identical narratives side by side. Pairs sharing a
//! nucleus with similarity at or above the duplicate threshold are folded
//! together: the smaller (then younger, then higher-id) one is absorbed into
//! the other and archived with `merged_into` pointing at the survivor.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use coinwire_common::{FileConfig, LifecycleState, MatchingConfig, Narrative};

use crate::fingerprint::{label_key, similarity};
use crate::matcher::{is_candidate, meets_threshold};
use crate::merge::MergeEngine;
use crate::retry::retry_on_conflict;
use crate::store::{NarrativeStore, StoreError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupStats {
    pub examined: u32,
    pub absorbed: u32,
    pub articles_moved: u32,
    pub failed: u32,
}

impl std::fmt::Display for DedupStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Dedup: {} examined, {} absorbed, {} articles moved, {} failed",
            self.examined, self.absorbed, self.articles_moved, self.failed,
        )
    }
}

/// Survivor order: more articles, then older, then lower id.
fn survivor_order(a: &Narrative, b: &Narrative) -> std::cmp::Ordering {
    b.article_count
        .cmp(&a.article_count)
        .then(a.first_seen.cmp(&b.first_seen))
        .then(a.id.cmp(&b.id))
}

pub struct DuplicateConsolidator {
    store: Arc<dyn NarrativeStore>,
    matching: MatchingConfig,
    engine: MergeEngine,
}

impl DuplicateConsolidator {
    pub fn new(store: Arc<dyn NarrativeStore>, config: &FileConfig) -> Self {
        Self {
            store,
            matching: config.matching.clone(),
            engine: MergeEngine::from_config(config),
        }
    }

    pub async fn consolidate_duplicates(&self) -> Result<DedupStats, StoreError> {
        self.consolidate_duplicates_at(Utc::now()).await
    }

    pub async fn consolidate_duplicates_at(&self, now: DateTime<Utc>) -> Result<DedupStats, StoreError> {
        let mut stats = DedupStats::default();

        let mut by_nucleus: HashMap<String, Vec<Narrative>> = HashMap::new();
        for narrative in self.store.find_active_narratives(now).await? {
            if narrative.lifecycle_state == LifecycleState::Archived || !is_candidate(&narrative) {
                continue;
            }
            stats.examined += 1;
            by_nucleus
                .entry(label_key(&narrative.nucleus_entity))
                .or_default()
                .push(narrative);
        }

        let mut groups: Vec<(String, Vec<Narrative>)> = by_nucleus.into_iter().filter(|(_, g)| g.len() > 1).collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        for (nucleus, mut group) in groups {
            group.sort_by(survivor_order);
            self.consolidate_group(&nucleus, group, now, &mut stats).await?;
        }

        info!(%stats, "Duplicate consolidation complete");
        Ok(stats)
    }

    async fn consolidate_group(
        &self,
        nucleus: &str,
        mut group: Vec<Narrative>,
        now: DateTime<Utc>,
        stats: &mut DedupStats,
    ) -> Result<(), StoreError> {
        let mut absorbed = vec![false; group.len()];
        for i in 1..group.len() {
            let survivor_idx = (0..i).find(|&j| {
                !absorbed[j]
                    && meets_threshold(
                        similarity(&group[j].fingerprint, &group[i].fingerprint),
                        self.matching.duplicate_threshold,
                    )
            });
            let Some(j) = survivor_idx else { continue };

            match self.absorb_pair(&group[j], &group[i], now).await {
                Ok(Some((survivor, moved))) => {
                    stats.absorbed += 1;
                    stats.articles_moved += moved as u32;
                    absorbed[i] = true;
                    info!(
                        nucleus,
                        survivor_id = %survivor.id,
                        duplicate_id = %group[i].id,
                        moved,
                        "Absorbed duplicate narrative"
                    );
                    group[j] = survivor;
                }
                Ok(None) => absorbed[i] = true,
                Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                    stats.failed += 1;
                    warn!(duplicate_id = %group[i].id, error = %e, "Could not absorb duplicate this run");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write the survivor with the duplicate's articles, then archive the
    /// duplicate. A conflict on either write re-reads both and starts over;
    /// the union is idempotent, so a survivor written on an earlier attempt
    /// is not double-counted.
    async fn absorb_pair(
        &self,
        survivor: &Narrative,
        duplicate: &Narrative,
        now: DateTime<Utc>,
    ) -> Result<Option<(Narrative, usize)>, StoreError> {
        let (survivor_id, duplicate_id) = (survivor.id, duplicate.id);
        retry_on_conflict(self.matching.max_merge_attempts, |attempt| {
            let snapshots = (attempt == 1).then(|| (survivor.clone(), duplicate.clone()));
            async move {
                let (survivor, mut duplicate) = match snapshots {
                    Some(pair) => pair,
                    None => (self.load(survivor_id).await?, self.load(duplicate_id).await?),
                };
                if duplicate.merged_into.is_some() || survivor.merged_into.is_some() {
                    return Ok(None);
                }

                let outcome = self.engine.absorb(survivor, &duplicate, now);
                let moved = outcome.added_articles;
                let survivor = if outcome.is_noop() {
                    outcome.narrative
                } else {
                    self.store.upsert(&outcome.narrative).await?
                };

                self.engine.mark_absorbed(&mut duplicate, survivor.id, now);
                self.store.upsert(&duplicate).await?;
                Ok::<_, StoreError>(Some((survivor, moved)))
            }
        })
        .await
    }

    async fn load(&self, id: Uuid) -> Result<Narrative, StoreError> {
        self.store.get_by_id(id).await?.ok_or(StoreError::NotFound(id))
    }
}

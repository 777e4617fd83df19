//! Narrative detection: one batch pass over recently enriched articles.
//!
//! 1. Load articles enriched within the lookback window.
//! 2. Cluster them in memory.
//! 3. Route each cluster: article affinity first, fingerprint match second,
//!    then a store lookup by nucleus for narratives written since the working
//!    set was loaded; otherwise seed a new narrative.
//! 4. Persist through the versioned upsert, retrying conflicts from a fresh read.
//!
//! The working set of candidate narratives is loaded once per run and updated
//! after every write, so a narrative created by an early cluster is visible to
//! the clusters after it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use coinwire_common::{FileConfig, Fingerprint, LifecycleState, MatchingConfig, Narrative};

use crate::articles::ArticleSource;
use crate::cluster::{cluster, CandidateCluster};
use crate::matcher::{find_match, find_owner};
use crate::merge::{MergeEngine, MergeOutcome};
use crate::retry::retry_on_conflict;
use crate::store::{NarrativeStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("article source failed: {0:#}")]
    Articles(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectionStats {
    pub articles: u32,
    pub clusters: u32,
    pub created: u32,
    pub merged: u32,
    /// Clusters routed by article affinity rather than fingerprint.
    pub affinity: u32,
    pub resurrected: u32,
    pub articles_added: u32,
    /// Clusters whose articles were all already in the matched narrative.
    pub unchanged: u32,
    /// Clusters with no actors; their articles are left for a later run.
    pub unfingerprintable: u32,
    /// Writes abandoned after exhausting conflict retries.
    pub failed: u32,
}

impl std::fmt::Display for DetectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Detection: {} articles in {} clusters, {} created, {} merged ({} by affinity), \
             {} resurrected, {} articles added, {} unchanged, {} unfingerprintable, {} failed",
            self.articles,
            self.clusters,
            self.created,
            self.merged,
            self.affinity,
            self.resurrected,
            self.articles_added,
            self.unchanged,
            self.unfingerprintable,
            self.failed,
        )
    }
}

/// How a cluster found its narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Affinity,
    Fingerprint,
}

pub struct NarrativeDetector {
    store: Arc<dyn NarrativeStore>,
    articles: Arc<dyn ArticleSource>,
    matching: MatchingConfig,
    engine: MergeEngine,
}

impl NarrativeDetector {
    pub fn new(store: Arc<dyn NarrativeStore>, articles: Arc<dyn ArticleSource>, config: &FileConfig) -> Self {
        Self {
            store,
            articles,
            matching: config.matching.clone(),
            engine: MergeEngine::from_config(config),
        }
    }

    pub async fn run_detection(&self, lookback: Duration) -> Result<DetectionStats, DetectionError> {
        self.run_detection_at(lookback, Utc::now()).await
    }

    /// Run detection as of `now`. Articles enriched in `[now - lookback, ∞)` are considered.
    pub async fn run_detection_at(
        &self,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<DetectionStats, DetectionError> {
        let mut stats = DetectionStats::default();

        let articles = self
            .articles
            .enriched_since(now - lookback)
            .await
            .map_err(DetectionError::Articles)?;
        stats.articles = articles.len() as u32;
        if articles.is_empty() {
            info!(lookback_hours = lookback.num_hours(), "No enriched articles in lookback window");
            return Ok(stats);
        }

        let clusters = cluster(&articles);
        stats.clusters = clusters.len() as u32;

        let archived_since = now - Duration::days(self.matching.resurrection_window_days);
        let mut working = self.store.find_active_narratives(archived_since).await?;
        debug!(candidates = working.len(), "Loaded candidate narratives");

        for candidate in &clusters {
            self.process_cluster(candidate, &mut working, now, &mut stats).await?;
        }

        info!(%stats, "Narrative detection complete");
        Ok(stats)
    }

    async fn process_cluster(
        &self,
        candidate: &CandidateCluster,
        working: &mut Vec<Narrative>,
        now: DateTime<Utc>,
        stats: &mut DetectionStats,
    ) -> Result<(), StoreError> {
        let Some(fingerprint) = candidate.fingerprint(self.engine.top_actors()) else {
            stats.unfingerprintable += 1;
            debug!(articles = candidate.len(), "Skipping cluster without actors");
            return Ok(());
        };

        let article_ids = candidate.article_ids();
        let pool: &[Narrative] = working;
        let routed = find_owner(&article_ids, pool, self.matching.containment_threshold)
            .map(|o| (o.narrative, Route::Affinity, o.containment))
            .or_else(|| {
                find_match(&fingerprint, pool, self.matching.similarity_threshold)
                    .map(|m| (m.narrative, Route::Fingerprint, m.similarity))
            });
        let unseen = match routed {
            Some(_) => None,
            None => self.find_unseen(&fingerprint, pool, now).await?,
        };

        let (result, target_id) = match (routed, unseen.as_ref()) {
            (Some((target, route, score)), _) => {
                debug!(
                    narrative_id = %target.id,
                    nucleus = %fingerprint.nucleus_entity,
                    ?route,
                    score,
                    "Cluster matched narrative"
                );
                if route == Route::Affinity {
                    stats.affinity += 1;
                }
                (self.merge_with_retry(candidate, target, now).await, Some(target.id))
            }
            (None, Some(target)) => {
                debug!(
                    narrative_id = %target.id,
                    nucleus = %fingerprint.nucleus_entity,
                    "Cluster matched narrative written since the pool was loaded"
                );
                (self.merge_with_retry(candidate, target, now).await, Some(target.id))
            }
            (None, None) => match self.engine.create(candidate, now) {
                Ok(outcome) => (self.persist_new(outcome).await, None),
                Err(e) => {
                    stats.unfingerprintable += 1;
                    debug!(error = %e, "Cluster could not seed a narrative");
                    return Ok(());
                }
            },
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                stats.failed += 1;
                warn!(
                    error = %e,
                    articles = candidate.len(),
                    "Giving up on cluster for this run; articles will be retried next run"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if outcome.is_noop() {
            stats.unchanged += 1;
            return Ok(());
        }

        stats.articles_added += outcome.added_articles as u32;
        if outcome.created {
            stats.created += 1;
            info!(
                narrative_id = %outcome.narrative.id,
                nucleus = %outcome.narrative.nucleus_entity,
                articles = outcome.narrative.article_count,
                "Created narrative"
            );
        } else {
            stats.merged += 1;
            if outcome.resurrected() {
                stats.resurrected += 1;
                info!(
                    narrative_id = %outcome.narrative.id,
                    state = %outcome.narrative.lifecycle_state,
                    "Narrative resurrected"
                );
            }
        }

        let written = outcome.narrative;
        working.retain(|n| n.id != written.id && Some(n.id) != target_id);
        working.push(written);
        Ok(())
    }

    /// Last check before creating: a narrative on the same nucleus written
    /// after the working set was loaded, e.g. by a concurrent run.
    async fn find_unseen(
        &self,
        fingerprint: &Fingerprint,
        pool: &[Narrative],
        now: DateTime<Utc>,
    ) -> Result<Option<Narrative>, StoreError> {
        let archived_since = now - Duration::days(self.matching.resurrection_window_days);
        let unseen: Vec<Narrative> = self
            .store
            .find_by_nucleus(&fingerprint.nucleus_entity)
            .await?
            .into_iter()
            .filter(|n| !pool.iter().any(|p| p.id == n.id))
            .filter(|n| n.lifecycle_state != LifecycleState::Archived || n.last_updated >= archived_since)
            .collect();
        Ok(find_match(fingerprint, &unseen, self.matching.similarity_threshold).map(|m| m.narrative.clone()))
    }

    async fn persist_new(&self, outcome: MergeOutcome) -> Result<MergeOutcome, StoreError> {
        let written = self.store.upsert(&outcome.narrative).await?;
        Ok(MergeOutcome {
            narrative: written,
            ..outcome
        })
    }

    /// Merge into `target`, starting from the snapshot and re-reading after a
    /// conflict. Re-reads follow `merged_into` one hop, so a target absorbed
    /// mid-run hands the cluster to its survivor.
    async fn merge_with_retry(
        &self,
        candidate: &CandidateCluster,
        target: &Narrative,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, StoreError> {
        let target_id = target.id;
        retry_on_conflict(self.matching.max_merge_attempts, |attempt| {
            let snapshot = (attempt == 1).then(|| target.clone());
            async move {
                let current = match snapshot {
                    Some(n) => n,
                    None => self.reload(target_id).await?,
                };
                let outcome = self.engine.merge(candidate, current, now);
                if outcome.is_noop() {
                    return Ok(outcome);
                }
                let written = self.store.upsert(&outcome.narrative).await?;
                Ok::<_, StoreError>(MergeOutcome {
                    narrative: written,
                    ..outcome
                })
            }
        })
        .await
    }

    async fn reload(&self, id: Uuid) -> Result<Narrative, StoreError> {
        let fresh = self.store.get_by_id(id).await?.ok_or(StoreError::NotFound(id))?;
        match fresh.merged_into {
            Some(survivor) => {
                debug!(narrative_id = %id, survivor_id = %survivor, "Target was absorbed, following");
                self.store
                    .get_by_id(survivor)
                    .await?
                    .ok_or(StoreError::NotFound(survivor))
            }
            None => Ok(fresh),
        }
    }
}

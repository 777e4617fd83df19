//! Periodic lifecycle sweep: time decay for narratives that receive no articles.
//!
//! Recomputes velocity and recency for every live narrative and applies the
//! decay transitions (cooling, archival). Writes go through the same versioned
//! upsert as detection, so a sweep racing a merge re-reads instead of
//! overwriting the merged articles.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use coinwire_common::{FileConfig, LifecycleConfig, LifecycleEntry, LifecycleState, Narrative};

use crate::lifecycle::{self, Trigger};
use crate::retry::retry_on_conflict;
use crate::store::{NarrativeStore, StoreError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub evaluated: u32,
    pub updated: u32,
    pub transitioned: u32,
    pub cooled: u32,
    pub archived: u32,
    pub failed: u32,
}

impl std::fmt::Display for SweepStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lifecycle sweep: {} evaluated, {} updated, {} transitioned \
             ({} cooling, {} archived), {} failed",
            self.evaluated, self.updated, self.transitioned, self.cooled, self.archived, self.failed,
        )
    }
}

pub struct LifecycleSweeper {
    store: Arc<dyn NarrativeStore>,
    lifecycle: LifecycleConfig,
    max_attempts: u32,
}

impl LifecycleSweeper {
    pub fn new(store: Arc<dyn NarrativeStore>, config: &FileConfig) -> Self {
        Self {
            store,
            lifecycle: config.lifecycle.clone(),
            max_attempts: config.matching.max_merge_attempts,
        }
    }

    pub async fn run_lifecycle_sweep(&self) -> Result<SweepStats, StoreError> {
        self.run_lifecycle_sweep_at(Utc::now()).await
    }

    pub async fn run_lifecycle_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepStats, StoreError> {
        let mut stats = SweepStats::default();

        // Archived narratives are terminal for the sweep; only live ones are loaded.
        let narratives: Vec<Narrative> = self
            .store
            .find_active_narratives(now)
            .await?
            .into_iter()
            .filter(|n| n.lifecycle_state != LifecycleState::Archived)
            .collect();

        for narrative in &narratives {
            stats.evaluated += 1;
            match self.sweep_one(narrative, now).await {
                Ok(Some(transition)) => {
                    stats.updated += 1;
                    if let Some(entry) = transition {
                        stats.transitioned += 1;
                        match entry.state {
                            LifecycleState::Cooling => stats.cooled += 1,
                            LifecycleState::Archived => stats.archived += 1,
                            _ => {}
                        }
                        debug!(
                            narrative_id = %narrative.id,
                            from = %narrative.lifecycle_state,
                            to = %entry.state,
                            "Lifecycle transition"
                        );
                    }
                }
                Ok(None) => {}
                Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                    stats.failed += 1;
                    warn!(narrative_id = %narrative.id, error = %e, "Sweep skipped narrative");
                }
                Err(e) => return Err(e),
            }
        }

        info!(%stats, "Lifecycle sweep complete");
        Ok(stats)
    }

    /// Observe one narrative and write it back. `Ok(None)` means nothing to
    /// write; `Ok(Some(entry))` carries the transition, if any.
    async fn sweep_one(
        &self,
        narrative: &Narrative,
        now: DateTime<Utc>,
    ) -> Result<Option<Option<LifecycleEntry>>, StoreError> {
        let id = narrative.id;
        retry_on_conflict(self.max_attempts, |attempt| {
            let snapshot = (attempt == 1).then(|| narrative.clone());
            async move {
                let mut current = match snapshot {
                    Some(n) => n,
                    None => self.store.get_by_id(id).await?.ok_or(StoreError::NotFound(id))?,
                };
                if current.merged_into.is_some() || current.lifecycle_state == LifecycleState::Archived {
                    return Ok(None);
                }
                let before = current.clone();
                let transition = lifecycle::observe(&mut current, Trigger::Sweep, now, &self.lifecycle);
                if current == before {
                    return Ok(None);
                }
                self.store.upsert(&current).await?;
                Ok::<_, StoreError>(Some(transition))
            }
        })
        .await
    }
}

//! Merge/persist engine: fold clusters into narratives, or create new ones.
//!
//! Everything here is pure. Persistence and conflict handling live in the
//! detector, which calls back into [`MergeEngine::merge`] with a fresh read
//! whenever a write loses a race.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use coinwire_common::{
    Article, ArticleActors, FileConfig, LifecycleConfig, LifecycleEntry, LifecycleState, Narrative,
    TransitionKind,
};

use crate::cluster::CandidateCluster;
use crate::fingerprint::{compute_fingerprint, counted_actors, label_key, MentionTally};
use crate::lifecycle::{self, Trigger};

/// Result of applying one cluster (or one absorbed duplicate).
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub narrative: Narrative,
    /// Articles that were not already part of the narrative.
    pub added_articles: usize,
    pub created: bool,
    /// History entry appended by this merge, if the state changed.
    pub transition: Option<LifecycleEntry>,
}

impl MergeOutcome {
    /// Nothing changed; there is nothing to write.
    pub fn is_noop(&self) -> bool {
        !self.created && self.added_articles == 0
    }

    pub fn resurrected(&self) -> bool {
        matches!(&self.transition, Some(e) if e.kind == TransitionKind::Resurrection)
    }
}

/// A cluster with no actors cannot seed a narrative.
#[derive(Debug, thiserror::Error)]
#[error("cluster of {articles} article(s) has no actors to fingerprint")]
pub struct Unfingerprintable {
    pub articles: usize,
}

#[derive(Debug, Clone)]
pub struct MergeEngine {
    top_actors: usize,
    lifecycle: LifecycleConfig,
}

impl MergeEngine {
    pub fn new(top_actors: usize, lifecycle: LifecycleConfig) -> Self {
        Self {
            top_actors,
            lifecycle,
        }
    }

    pub fn from_config(config: &FileConfig) -> Self {
        Self::new(config.matching.top_actors, config.lifecycle.clone())
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    pub fn top_actors(&self) -> usize {
        self.top_actors
    }

    /// Merge into `matched`, or create a new narrative when there is no match.
    pub fn apply(
        &self,
        cluster: &CandidateCluster,
        matched: Option<Narrative>,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, Unfingerprintable> {
        match matched {
            Some(narrative) => Ok(self.merge(cluster, narrative, now)),
            None => self.create(cluster, now),
        }
    }

    /// Seed a new narrative from a cluster.
    pub fn create(
        &self,
        cluster: &CandidateCluster,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, Unfingerprintable> {
        let fingerprint = cluster.fingerprint(self.top_actors).ok_or(Unfingerprintable {
            articles: cluster.len(),
        })?;
        let latest = cluster.latest_article();
        let article_ids = cluster.article_ids();
        let article_count = article_ids.len() as u32;

        let mut narrative = Narrative {
            id: Uuid::new_v4(),
            theme: cluster.tensions.top(1).into_iter().next(),
            title: latest.map(|a| a.title.clone()).unwrap_or_default(),
            summary: latest
                .map(|a| a.narrative_summary.clone())
                .unwrap_or_default(),
            nucleus_entity: fingerprint.nucleus_entity.clone(),
            entities: fingerprint.top_actors.clone(),
            actor_counts: cluster.actors.counts().to_vec(),
            article_actors: cluster.articles.iter().map(record_actors).collect(),
            tensions: cluster.tensions.labels().map(str::to_string).collect(),
            article_ids,
            article_count,
            mention_velocity: lifecycle::mention_velocity(article_count, now, now),
            recency_score: 1.0,
            lifecycle_state: LifecycleState::Emerging,
            lifecycle_history: Vec::new(),
            fingerprint,
            first_seen: now,
            last_updated: now,
            merged_into: None,
            version: 0,
        };
        let entry = lifecycle::created_entry(&narrative, now);
        narrative.lifecycle_history.push(entry.clone());

        Ok(MergeOutcome {
            added_articles: narrative.article_ids.len(),
            narrative,
            created: true,
            transition: Some(entry),
        })
    }

    /// Fold a cluster into an existing narrative. Articles already present are
    /// ignored, so applying the same cluster twice changes nothing.
    pub fn merge(&self, cluster: &CandidateCluster, mut narrative: Narrative, now: DateTime<Utc>) -> MergeOutcome {
        let known: HashSet<Uuid> = narrative.article_ids.iter().copied().collect();
        let fresh: Vec<_> = cluster
            .articles
            .iter()
            .filter(|a| !known.contains(&a.id))
            .collect();
        if fresh.is_empty() {
            return MergeOutcome {
                narrative,
                added_articles: 0,
                created: false,
                transition: None,
            };
        }

        let mut tally = MentionTally::from_counts(&narrative.actor_counts);
        let mut tensions = MentionTally::new();
        for article in &fresh {
            narrative.article_ids.push(article.id);
            narrative.article_actors.push(record_actors(article));
            tally.add_article_actors(article);
            for tension in article.distinct_tensions() {
                tensions.add(tension, 1);
            }
        }
        append_labels(&mut narrative.tensions, tensions.labels());
        if narrative.theme.is_none() {
            narrative.theme = tensions.top(1).into_iter().next();
        }
        if let Some(latest) = fresh.iter().max_by_key(|a| (a.published_at, a.id)) {
            if !latest.narrative_summary.trim().is_empty() {
                narrative.summary = latest.narrative_summary.clone();
            }
        }

        let added_articles = fresh.len();
        self.refresh_aggregates(&mut narrative, tally);
        narrative.last_updated = now;
        let transition = lifecycle::observe(&mut narrative, Trigger::Merge, now, &self.lifecycle);

        MergeOutcome {
            narrative,
            added_articles,
            created: false,
            transition,
        }
    }

    /// Fold `duplicate` into `survivor` through the same union as a cluster merge.
    pub fn absorb(&self, mut survivor: Narrative, duplicate: &Narrative, now: DateTime<Utc>) -> MergeOutcome {
        let known: HashSet<Uuid> = survivor.article_ids.iter().copied().collect();
        let fresh: Vec<Uuid> = duplicate
            .article_ids
            .iter()
            .filter(|id| !known.contains(id))
            .copied()
            .collect();
        if fresh.is_empty() {
            return MergeOutcome {
                narrative: survivor,
                added_articles: 0,
                created: false,
                transition: None,
            };
        }

        // Only the duplicate's articles the survivor lacks add mentions.
        let mut contributed = MentionTally::new();
        let mut unrecorded = 0;
        for id in &fresh {
            match duplicate.actors_of(id) {
                Some(actors) => {
                    for actor in actors {
                        contributed.add(actor, 1);
                    }
                    survivor.article_actors.push(ArticleActors {
                        article_id: *id,
                        actors: actors.to_vec(),
                    });
                }
                None => unrecorded += 1,
            }
        }
        // Older duplicates lack per-article records. Their counts can only be
        // taken whole, which is exact when the two share no articles.
        if unrecorded > 0 && fresh.len() == duplicate.article_ids.len() {
            contributed = MentionTally::from_counts(&duplicate.actor_counts);
        }

        let mut tally = MentionTally::from_counts(&survivor.actor_counts);
        tally.merge(&contributed);
        survivor.article_ids.extend(fresh.iter().copied());
        append_labels(&mut survivor.tensions, duplicate.tensions.iter().map(String::as_str));
        if survivor.theme.is_none() {
            survivor.theme = duplicate.theme.clone();
        }

        self.refresh_aggregates(&mut survivor, tally);
        survivor.last_updated = now;
        let transition = lifecycle::observe(&mut survivor, Trigger::Merge, now, &self.lifecycle);

        MergeOutcome {
            narrative: survivor,
            added_articles: fresh.len(),
            created: false,
            transition,
        }
    }

    /// Archive a narrative that was folded into `survivor_id`.
    pub fn mark_absorbed(&self, duplicate: &mut Narrative, survivor_id: Uuid, now: DateTime<Utc>) -> LifecycleEntry {
        let entry = LifecycleEntry {
            state: LifecycleState::Archived,
            timestamp: now,
            article_count: duplicate.article_count,
            velocity: lifecycle::sanitize_velocity(duplicate.mention_velocity),
            kind: TransitionKind::Absorbed,
        };
        duplicate.merged_into = Some(survivor_id);
        duplicate.lifecycle_state = LifecycleState::Archived;
        duplicate.lifecycle_history.push(entry.clone());
        entry
    }

    pub fn refresh_aggregates(&self, narrative: &mut Narrative, tally: MentionTally) {
        refresh_aggregates(narrative, tally, self.top_actors);
    }
}

/// Recompute count, entities, fingerprint and the top-level nucleus from the
/// actor tally. Create, merge, absorb and backfill all end up here, so the
/// nucleus is written on every path.
pub fn refresh_aggregates(narrative: &mut Narrative, tally: MentionTally, top_actors: usize) {
    narrative.article_count = narrative.article_ids.len() as u32;
    if let Some(fingerprint) = compute_fingerprint(&tally, top_actors) {
        narrative.entities = fingerprint.top_actors.clone();
        narrative.nucleus_entity = fingerprint.nucleus_entity.clone();
        narrative.fingerprint = fingerprint;
    }
    narrative.actor_counts = tally.into_counts();
}

fn record_actors(article: &Article) -> ArticleActors {
    ArticleActors {
        article_id: article.id,
        actors: counted_actors(article),
    }
}

/// Append labels not already present, compared case-insensitively.
fn append_labels<'a>(existing: &mut Vec<String>, labels: impl Iterator<Item = &'a str>) {
    let mut keys: HashSet<String> = existing.iter().map(|l| label_key(l)).collect();
    for label in labels {
        if keys.insert(label_key(label)) {
            existing.push(label.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::cluster::cluster;
    use crate::testing::{article, base_time};

    fn engine() -> MergeEngine {
        MergeEngine::from_config(&FileConfig::default())
    }

    fn single(articles: Vec<coinwire_common::Article>) -> CandidateCluster {
        let mut clusters = cluster(&articles);
        assert_eq!(clusters.len(), 1, "fixture must form one cluster");
        clusters.remove(0)
    }

    #[test]
    fn create_seeds_emerging_narrative_with_fingerprint() {
        let c = single(vec![
            article("SEC sues Binance", &["SEC", "Binance"], &["regulation_vs_innovation"], 0),
            article("Binance responds to SEC", &["Binance", "SEC", "CZ"], &[], 1),
        ]);
        let now = base_time() + Duration::hours(2);
        let outcome = engine().create(&c, now).unwrap();
        let n = &outcome.narrative;

        assert!(outcome.created);
        assert_eq!(outcome.added_articles, 2);
        assert_eq!(n.title, "Binance responds to SEC");
        assert_eq!(n.theme.as_deref(), Some("regulation_vs_innovation"));
        assert_eq!(n.nucleus_entity, "SEC");
        assert_eq!(n.nucleus_entity, n.fingerprint.nucleus_entity);
        assert_eq!(n.entities, n.fingerprint.top_actors);
        assert_eq!(n.first_seen, now);
        assert_eq!(n.last_updated, now);
        assert_eq!(n.lifecycle_state, LifecycleState::Emerging);
        assert_eq!(n.lifecycle_history.len(), 1);
        assert_eq!(n.lifecycle_history[0].kind, TransitionKind::Created);
        assert_eq!(n.version, 0);
    }

    #[test]
    fn create_without_actors_is_refused() {
        let c = single(vec![article("Markets quiet", &[], &[], 0)]);
        let err = engine().create(&c, base_time()).unwrap_err();
        assert_eq!(err.articles, 1);
    }

    #[test]
    fn merge_is_idempotent() {
        let e = engine();
        let c = single(vec![
            article("a", &["Ripple", "SEC"], &[], 0),
            article("b", &["Ripple", "SEC", "XRP"], &[], 1),
        ]);
        let created = e.create(&c, base_time()).unwrap().narrative;

        let later = base_time() + Duration::hours(5);
        let again = e.merge(&c, created.clone(), later);
        assert!(again.is_noop());
        assert_eq!(again.narrative, created);
        assert_eq!(again.narrative.last_updated, base_time());
    }

    #[test]
    fn ripple_merge_adds_exactly_cluster_size() {
        let e = engine();
        let seed = single(vec![
            article("Ripple case", &["Ripple", "SEC", "XRP"], &[], 0),
            article("XRP rallies", &["Ripple", "XRP"], &[], 1),
        ]);
        let narrative = e.create(&seed, base_time()).unwrap().narrative;
        let before = narrative.article_count;

        let incoming = single(vec![
            article("Ripple wins", &["Ripple", "SEC"], &["legal_uncertainty"], 30),
            article("SEC to appeal Ripple", &["SEC", "Ripple"], &[], 31),
        ]);
        let now = base_time() + Duration::hours(32);
        let outcome = e.merge(&incoming, narrative, now);

        assert_eq!(outcome.added_articles, 2);
        assert_eq!(outcome.narrative.article_count, before + 2);
        assert_eq!(outcome.narrative.last_updated, now);
        assert_eq!(outcome.narrative.nucleus_entity, "Ripple");
        assert_eq!(outcome.narrative.theme.as_deref(), Some("legal_uncertainty"));
    }

    #[test]
    fn merge_recomputes_nucleus_when_mentions_shift() {
        let e = engine();
        let seed = single(vec![article("a", &["Tether", "Circle"], &[], 0)]);
        let narrative = e.create(&seed, base_time()).unwrap().narrative;
        assert_eq!(narrative.nucleus_entity, "Tether");

        let incoming = single(vec![
            article("b", &["Circle", "USDC"], &[], 1),
            article("c", &["Circle", "USDC"], &[], 2),
        ]);
        let merged = e.merge(&incoming, narrative, base_time() + Duration::hours(3)).narrative;
        assert_eq!(merged.nucleus_entity, "Circle");
        assert_eq!(merged.fingerprint.nucleus_entity, "Circle");
        assert_eq!(merged.entities[0], "Circle");
    }

    #[test]
    fn merge_keeps_history_append_only() {
        let e = engine();
        let seed = single(vec![article("a", &["Solana", "Jupiter"], &[], 0)]);
        let mut narrative = e.create(&seed, base_time()).unwrap().narrative;
        narrative.lifecycle_state = LifecycleState::Cooling;
        let prefix = narrative.lifecycle_history.clone();

        let incoming = single(vec![article("b", &["Solana", "Jupiter"], &[], 100)]);
        let outcome = e.merge(&incoming, narrative, base_time() + Duration::hours(100));
        assert!(outcome.resurrected());
        assert_eq!(&outcome.narrative.lifecycle_history[..prefix.len()], &prefix[..]);
        assert_eq!(outcome.narrative.lifecycle_history.len(), prefix.len() + 1);
    }

    #[test]
    fn absorb_unions_articles_and_marks_duplicate() {
        let e = engine();
        let a = e
            .create(&single(vec![article("a", &["SEC", "Binance"], &[], 0), article("b", &["SEC", "Binance"], &[], 1)]), base_time())
            .unwrap()
            .narrative;
        let mut b = e
            .create(&single(vec![article("c", &["SEC", "Binance"], &["legal_uncertainty"], 2)]), base_time())
            .unwrap()
            .narrative;
        let now = base_time() + Duration::hours(3);

        let outcome = e.absorb(a.clone(), &b, now);
        assert_eq!(outcome.added_articles, 1);
        assert_eq!(outcome.narrative.article_count, 3);
        assert_eq!(outcome.narrative.actor_counts.iter().find(|c| c.name == "SEC").unwrap().count, 3);
        assert_eq!(outcome.narrative.tensions, vec!["legal_uncertainty"]);

        let entry = e.mark_absorbed(&mut b, a.id, now);
        assert_eq!(entry.kind, TransitionKind::Absorbed);
        assert_eq!(b.merged_into, Some(a.id));
        assert_eq!(b.lifecycle_state, LifecycleState::Archived);

        // Absorbing again adds nothing.
        assert!(e.absorb(outcome.narrative, &b, now).is_noop());
    }

    #[test]
    fn absorb_counts_shared_articles_once() {
        let e = engine();
        let a1 = article("a1", &["SEC", "Binance"], &[], 0);
        let a2 = article("a2", &["SEC", "Binance"], &[], 1);
        let a3 = article("a3", &["SEC", "Binance"], &[], 2);
        let a4 = article("a4", &["SEC", "Binance"], &[], 3);
        let survivor = e
            .create(&single(vec![a1.clone(), a2.clone(), a3]), base_time())
            .unwrap()
            .narrative;
        let duplicate = e
            .create(&single(vec![a1, a2, a4.clone()]), base_time())
            .unwrap()
            .narrative;

        let outcome = e.absorb(survivor, &duplicate, base_time() + Duration::hours(4));
        let n = &outcome.narrative;
        assert_eq!(outcome.added_articles, 1);
        assert_eq!(n.article_count, 4);
        let sec = n.actor_counts.iter().find(|c| c.name == "SEC").unwrap().count;
        assert_eq!(sec, n.article_count);
        assert_eq!(n.actors_of(&a4.id), Some(&["SEC".to_string(), "Binance".to_string()][..]));
    }

    #[test]
    fn absorb_takes_unrecorded_counts_whole_when_disjoint() {
        let e = engine();
        let survivor = e
            .create(&single(vec![article("a", &["Tether", "Circle"], &[], 0)]), base_time())
            .unwrap()
            .narrative;
        let mut older = e
            .create(
                &single(vec![
                    article("b", &["Tether", "Circle"], &[], 1),
                    article("c", &["Tether", "Circle"], &[], 2),
                ]),
                base_time(),
            )
            .unwrap()
            .narrative;
        older.article_actors.clear();

        let n = e.absorb(survivor, &older, base_time() + Duration::hours(3)).narrative;
        assert_eq!(n.article_count, 3);
        assert_eq!(n.actor_counts.iter().find(|c| c.name == "Tether").unwrap().count, 3);
    }
}

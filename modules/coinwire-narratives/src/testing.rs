// Test support for the narrative pipeline.
//
// Two in-memory implementations matching the two trait boundaries:
// - MemoryNarrativeStore (NarrativeStore): versioned documents with failure
//   and concurrent-writer injection
// - MemoryArticleSource (ArticleSource): a list filtered by enrichment time
//
// Plus fixture builders for articles and narratives on a fixed clock.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use coinwire_common::{Article, FileConfig, LifecycleState, Narrative, NarrativeDocument};

use crate::articles::ArticleSource;
use crate::cluster::CandidateCluster;
use crate::merge::MergeEngine;
use crate::store::{NarrativeStore, StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Fixed clock origin for fixtures: 2024-06-01T00:00:00Z.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

pub fn hours(h: i64) -> DateTime<Utc> {
    base_time() + Duration::hours(h)
}

/// An enriched article published `hours_offset` hours after [`base_time`].
pub fn article(title: &str, actors: &[&str], tensions: &[&str], hours_offset: i64) -> Article {
    Article::builder()
        .title(title)
        .published_at(hours(hours_offset))
        .actors(actors.iter().map(|s| s.to_string()).collect())
        .tensions(tensions.iter().map(|s| s.to_string()).collect())
        .narrative_summary(format!("{title} (summary)"))
        .build()
}

/// A freshly created, unpersisted narrative seeded from two articles that
/// both mention every actor. The first actor is the nucleus.
pub fn narrative_with(actors: &[&str], hours_offset: i64) -> Narrative {
    let seed = CandidateCluster::from_articles(vec![
        article(&format!("{} story", actors.join("/")), actors, &[], hours_offset),
        article(&format!("{} follow-up", actors.join("/")), actors, &[], hours_offset),
    ]);
    MergeEngine::from_config(&FileConfig::default())
        .create(&seed, hours(hours_offset))
        .expect("fixture narrative needs at least one actor")
        .narrative
}

// ---------------------------------------------------------------------------
// MemoryNarrativeStore
// ---------------------------------------------------------------------------

type Interference = Box<dyn FnOnce(&mut NarrativeDocument) + Send>;

#[derive(Default)]
struct MemoryNarrativeStoreInner {
    documents: HashMap<Uuid, NarrativeDocument>,
    unavailable: bool,
    interference: Option<Interference>,
    upserts: u32,
}

/// Stateful in-memory narrative store with the same compare-and-set rules as
/// the Postgres store. Thread-safe via interior Mutex.
#[derive(Default)]
pub struct MemoryNarrativeStore {
    inner: Mutex<MemoryNarrativeStoreInner>,
}

impl MemoryNarrativeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a narrative directly, bypassing version checks. Returns it as stored.
    pub fn seed(&self, narrative: Narrative) -> Narrative {
        let mut stored = narrative;
        stored.version = stored.version.max(1);
        self.insert_document(NarrativeDocument::from(&stored));
        stored
    }

    /// Store a raw document, e.g. a legacy one. Versions start at 1.
    pub fn insert_document(&self, mut document: NarrativeDocument) {
        document.version = document.version.max(1);
        self.inner.lock().unwrap().documents.insert(document.id, document);
    }

    pub fn document(&self, id: Uuid) -> Option<NarrativeDocument> {
        self.inner.lock().unwrap().documents.get(&id).cloned()
    }

    pub fn narrative(&self, id: Uuid) -> Option<Narrative> {
        self.document(id).and_then(|d| Narrative::try_from(d).ok())
    }

    /// Every readable narrative, oldest first.
    pub fn narratives(&self) -> Vec<Narrative> {
        let mut all: Vec<Narrative> = self
            .inner
            .lock()
            .unwrap()
            .documents
            .values()
            .cloned()
            .filter_map(|d| Narrative::try_from(d).ok())
            .collect();
        all.sort_by(|a, b| (a.first_seen, a.id).cmp(&(b.first_seen, b.id)));
        all
    }

    /// Readable narratives not absorbed into another.
    pub fn live_narratives(&self) -> Vec<Narrative> {
        self.narratives()
            .into_iter()
            .filter(|n| n.merged_into.is_none())
            .collect()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Simulate a concurrent writer: just before the next update is checked,
    /// `mutate` is applied to the stored document and its version is bumped,
    /// so that update loses the compare-and-set.
    pub fn interfere_next_upsert(&self, mutate: impl FnOnce(&mut NarrativeDocument) + Send + 'static) {
        self.inner.lock().unwrap().interference = Some(Box::new(mutate));
    }

    /// Successful writes so far.
    pub fn upsert_count(&self) -> u32 {
        self.inner.lock().unwrap().upserts
    }

    fn check_available(inner: &MemoryNarrativeStoreInner) -> StoreResult<()> {
        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NarrativeStore for MemoryNarrativeStore {
    async fn find_active_narratives(&self, archived_since: DateTime<Utc>) -> StoreResult<Vec<Narrative>> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        let mut active: Vec<Narrative> = inner
            .documents
            .values()
            .filter(|d| d.merged_into.is_none())
            .filter(|d| d.lifecycle_state != LifecycleState::Archived || d.last_updated >= archived_since)
            .cloned()
            .filter_map(|d| Narrative::try_from(d).ok())
            .collect();
        active.sort_by(|a, b| b.last_updated.cmp(&a.last_updated).then(a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Narrative>> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        Ok(inner
            .documents
            .get(&id)
            .cloned()
            .and_then(|d| Narrative::try_from(d).ok()))
    }

    async fn find_by_nucleus(&self, nucleus: &str) -> StoreResult<Vec<Narrative>> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        Ok(inner
            .documents
            .values()
            .filter(|d| d.merged_into.is_none() && d.nucleus_entity.as_deref() == Some(nucleus))
            .cloned()
            .filter_map(|d| Narrative::try_from(d).ok())
            .collect())
    }

    async fn upsert(&self, narrative: &Narrative) -> StoreResult<Narrative> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        let mut written = narrative.clone();
        if narrative.version == 0 {
            if inner.documents.contains_key(&narrative.id) {
                return Err(StoreError::Conflict {
                    id: narrative.id,
                    expected: 0,
                });
            }
            written.version = 1;
        } else {
            let interference = inner.interference.take();
            let stored = inner
                .documents
                .get_mut(&narrative.id)
                .ok_or(StoreError::NotFound(narrative.id))?;
            if let Some(mutate) = interference {
                mutate(stored);
                stored.version += 1;
            }
            if stored.version != narrative.version {
                return Err(StoreError::Conflict {
                    id: narrative.id,
                    expected: narrative.version,
                });
            }
            written.version = narrative.version + 1;
        }

        inner.documents.insert(written.id, NarrativeDocument::from(&written));
        inner.upserts += 1;
        Ok(written)
    }

    async fn find_legacy_documents(&self) -> StoreResult<Vec<NarrativeDocument>> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        let mut legacy: Vec<NarrativeDocument> = inner
            .documents
            .values()
            .filter(|d| d.legacy_reason().is_some())
            .cloned()
            .collect();
        legacy.sort_by_key(|d| d.id);
        Ok(legacy)
    }
}

// ---------------------------------------------------------------------------
// MemoryArticleSource
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryArticleSourceInner {
    /// (article, enriched_at)
    articles: Vec<(Article, DateTime<Utc>)>,
    failing: bool,
}

/// Articles are considered enriched at their publication time unless added
/// with [`MemoryArticleSource::push_enriched_at`].
#[derive(Default)]
pub struct MemoryArticleSource {
    inner: Mutex<MemoryArticleSourceInner>,
}

impl MemoryArticleSource {
    pub fn new(articles: Vec<Article>) -> Self {
        let source = Self::default();
        for article in articles {
            source.push(article);
        }
        source
    }

    pub fn push(&self, article: Article) {
        let enriched_at = article.published_at;
        self.push_enriched_at(article, enriched_at);
    }

    pub fn push_enriched_at(&self, article: Article, enriched_at: DateTime<Utc>) {
        self.inner.lock().unwrap().articles.push((article, enriched_at));
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }
}

#[async_trait]
impl ArticleSource for MemoryArticleSource {
    async fn enriched_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Article>> {
        let inner = self.inner.lock().unwrap();
        if inner.failing {
            bail!("article feed unreachable");
        }
        Ok(inner
            .articles
            .iter()
            .filter(|(_, enriched_at)| *enriched_at >= cutoff)
            .map(|(article, _)| article.clone())
            .collect())
    }
}

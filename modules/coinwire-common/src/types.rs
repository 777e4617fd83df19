use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

// --- Articles ---

/// An article as delivered by the upstream enrichment pipeline.
///
/// Actors, actions and tensions are extracted by LLM calls before the article
/// reaches narrative detection. Articles are immutable once enriched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct Article {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    #[builder(setter(into))]
    pub title: String,
    pub published_at: DateTime<Utc>,
    #[builder(default)]
    pub actors: Vec<String>,
    #[builder(default)]
    pub actions: Vec<String>,
    /// Tension category labels, e.g. `regulation_vs_innovation`.
    #[builder(default)]
    pub tensions: Vec<String>,
    #[builder(default, setter(into))]
    pub narrative_summary: String,
    /// Upstream content hash used for feed-level dedup.
    #[builder(default, setter(into))]
    pub content_hash: String,
}

impl Article {
    /// Distinct, trimmed, non-blank actor names in first-seen order.
    pub fn distinct_actors(&self) -> Vec<&str> {
        distinct_labels(&self.actors)
    }

    /// Distinct, trimmed, non-blank tension labels in first-seen order.
    pub fn distinct_tensions(&self) -> Vec<&str> {
        distinct_labels(&self.tensions)
    }
}

fn distinct_labels(labels: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim();
        if !label.is_empty() && !out.contains(&label) {
            out.push(label);
        }
    }
    out
}

// --- Lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Emerging,
    Rising,
    Hot,
    Mature,
    Cooling,
    Archived,
}

impl LifecycleState {
    /// Cooling and archived narratives are dormant; a merge into one is a resurrection.
    pub fn is_dormant(&self) -> bool {
        matches!(self, LifecycleState::Cooling | LifecycleState::Archived)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Emerging => write!(f, "emerging"),
            LifecycleState::Rising => write!(f, "rising"),
            LifecycleState::Hot => write!(f, "hot"),
            LifecycleState::Mature => write!(f, "mature"),
            LifecycleState::Cooling => write!(f, "cooling"),
            LifecycleState::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emerging" => Ok(LifecycleState::Emerging),
            "rising" => Ok(LifecycleState::Rising),
            "hot" => Ok(LifecycleState::Hot),
            "mature" => Ok(LifecycleState::Mature),
            "cooling" => Ok(LifecycleState::Cooling),
            "archived" => Ok(LifecycleState::Archived),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}

/// Why a history entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Created,
    Transition,
    /// A cooling or archived narrative came back to life through a merge.
    Resurrection,
    /// The narrative was folded into a duplicate and archived.
    Absorbed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LifecycleEntry {
    pub state: LifecycleState,
    pub timestamp: DateTime<Utc>,
    pub article_count: u32,
    pub velocity: f64,
    pub kind: TransitionKind,
}

// --- Fingerprints ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ActorCount {
    pub name: String,
    pub count: u32,
}

/// Distinct actors one article contributed to a narrative's tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArticleActors {
    pub article_id: Uuid,
    pub actors: Vec<String>,
}

/// Identity signature of a cluster or narrative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Fingerprint {
    pub nucleus_entity: String,
    pub top_actors: Vec<String>,
}

// --- Narratives ---

/// A persisted story thread. Every field is mandatory; legacy rows that lack a
/// fingerprint only exist as [`NarrativeDocument`] until they are backfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub id: Uuid,
    pub theme: Option<String>,
    pub title: String,
    pub summary: String,
    pub nucleus_entity: String,
    /// Top-10 actors by mention count.
    pub entities: Vec<String>,
    /// Full actor multiset in first-seen order.
    pub actor_counts: Vec<ActorCount>,
    /// Per-article contributions to `actor_counts`. Narratives written before
    /// this was recorded have no entries for their older articles.
    pub article_actors: Vec<ArticleActors>,
    pub tensions: Vec<String>,
    pub article_ids: Vec<Uuid>,
    pub article_count: u32,
    /// Articles per day since `first_seen`.
    pub mention_velocity: f64,
    pub recency_score: f64,
    pub lifecycle_state: LifecycleState,
    pub lifecycle_history: Vec<LifecycleEntry>,
    pub fingerprint: Fingerprint,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Set when this narrative was absorbed by a duplicate.
    pub merged_into: Option<Uuid>,
    /// Optimistic concurrency counter. Zero means "never persisted".
    pub version: i64,
}

impl Narrative {
    pub fn contains_article(&self, id: &Uuid) -> bool {
        self.article_ids.contains(id)
    }

    /// Recorded actors of one article, if the narrative has them.
    pub fn actors_of(&self, article_id: &Uuid) -> Option<&[String]> {
        self.article_actors
            .iter()
            .find(|a| a.article_id == *article_id)
            .map(|a| a.actors.as_slice())
    }

    pub fn last_history_entry(&self) -> Option<&LifecycleEntry> {
        self.lifecycle_history.last()
    }
}

/// The persisted shape of a narrative.
///
/// Older writers sometimes omitted `fingerprint` or the top-level
/// `nucleus_entity`, so both are optional here and validated on conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeDocument {
    pub id: Uuid,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub nucleus_entity: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub actor_counts: Vec<ActorCount>,
    #[serde(default)]
    pub article_actors: Vec<ArticleActors>,
    #[serde(default)]
    pub tensions: Vec<String>,
    #[serde(default)]
    pub article_ids: Vec<Uuid>,
    #[serde(default)]
    pub article_count: u32,
    #[serde(default)]
    pub mention_velocity: f64,
    #[serde(default)]
    pub recency_score: f64,
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub lifecycle_history: Vec<LifecycleEntry>,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub merged_into: Option<Uuid>,
    #[serde(default)]
    pub version: i64,
}

/// Why a stored document cannot be used as a [`Narrative`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyReason {
    MissingFingerprint,
    MissingNucleus,
    NucleusMismatch,
}

impl std::fmt::Display for LegacyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegacyReason::MissingFingerprint => write!(f, "missing fingerprint"),
            LegacyReason::MissingNucleus => write!(f, "missing nucleus_entity"),
            LegacyReason::NucleusMismatch => write!(f, "nucleus_entity disagrees with fingerprint"),
        }
    }
}

impl NarrativeDocument {
    /// `None` when the document is a valid narrative.
    pub fn legacy_reason(&self) -> Option<LegacyReason> {
        let fingerprint = match &self.fingerprint {
            Some(fp) if !fp.nucleus_entity.is_empty() => fp,
            _ => return Some(LegacyReason::MissingFingerprint),
        };
        match self.nucleus_entity.as_deref() {
            None | Some("") => Some(LegacyReason::MissingNucleus),
            Some(nucleus) if nucleus != fingerprint.nucleus_entity => {
                Some(LegacyReason::NucleusMismatch)
            }
            Some(_) => None,
        }
    }
}

impl From<&Narrative> for NarrativeDocument {
    fn from(n: &Narrative) -> Self {
        Self {
            id: n.id,
            theme: n.theme.clone(),
            title: n.title.clone(),
            summary: n.summary.clone(),
            // Written explicitly on every save, never derived on read.
            nucleus_entity: Some(n.nucleus_entity.clone()),
            entities: n.entities.clone(),
            actor_counts: n.actor_counts.clone(),
            article_actors: n.article_actors.clone(),
            tensions: n.tensions.clone(),
            article_ids: n.article_ids.clone(),
            article_count: n.article_count,
            mention_velocity: n.mention_velocity,
            recency_score: n.recency_score,
            lifecycle_state: n.lifecycle_state,
            lifecycle_history: n.lifecycle_history.clone(),
            fingerprint: Some(n.fingerprint.clone()),
            first_seen: n.first_seen,
            last_updated: n.last_updated,
            merged_into: n.merged_into,
            version: n.version,
        }
    }
}

impl TryFrom<NarrativeDocument> for Narrative {
    type Error = LegacyReason;

    fn try_from(doc: NarrativeDocument) -> Result<Self, Self::Error> {
        if let Some(reason) = doc.legacy_reason() {
            return Err(reason);
        }
        let (Some(fingerprint), Some(nucleus_entity)) = (doc.fingerprint, doc.nucleus_entity) else {
            return Err(LegacyReason::MissingFingerprint);
        };
        Ok(Narrative {
            id: doc.id,
            theme: doc.theme,
            title: doc.title,
            summary: doc.summary,
            nucleus_entity,
            entities: doc.entities,
            actor_counts: doc.actor_counts,
            article_actors: doc.article_actors,
            tensions: doc.tensions,
            article_count: doc.article_ids.len() as u32,
            article_ids: doc.article_ids,
            mention_velocity: doc.mention_velocity,
            recency_score: doc.recency_score,
            lifecycle_state: doc.lifecycle_state,
            lifecycle_history: doc.lifecycle_history,
            fingerprint,
            first_seen: doc.first_seen,
            last_updated: doc.last_updated,
            merged_into: doc.merged_into,
            version: doc.version,
        })
    }
}

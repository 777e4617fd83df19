//! Fingerprints: nucleus entity + top actors, and the similarity between two of them.
//!
//! Clusters and narratives are fingerprinted by the same function from a
//! [`MentionTally`], so a freshly created narrative and a merged one can never
//! drift apart in shape.

use std::collections::{HashMap, HashSet};

use coinwire_common::{ActorCount, Article, Fingerprint};

/// Number of actors kept in a fingerprint and in `Narrative::entities`.
pub const TOP_ACTORS: usize = 10;

/// Comparison key for an actor or tension label.
pub fn label_key(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Mention counts in first-seen order.
///
/// Labels are matched case-insensitively; the first spelling seen is kept for
/// display. Ranking is stable, so ties always resolve to the label seen first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MentionTally {
    counts: Vec<ActorCount>,
    index: HashMap<String, usize>,
}

impl MentionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counts(counts: &[ActorCount]) -> Self {
        let mut tally = Self::new();
        for c in counts {
            tally.add(&c.name, c.count);
        }
        tally
    }

    /// Count every distinct actor of the article once.
    pub fn from_actors<'a>(articles: impl IntoIterator<Item = &'a Article>) -> Self {
        let mut tally = Self::new();
        for article in articles {
            tally.add_article_actors(article);
        }
        tally
    }

    /// Count every distinct tension of the article once.
    pub fn from_tensions<'a>(articles: impl IntoIterator<Item = &'a Article>) -> Self {
        let mut tally = Self::new();
        for article in articles {
            for tension in article.distinct_tensions() {
                tally.add(tension, 1);
            }
        }
        tally
    }

    pub fn add_article_actors(&mut self, article: &Article) {
        for actor in counted_actors(article) {
            self.add(&actor, 1);
        }
    }

    /// Add `count` mentions of `name`. Blank names and zero counts are ignored.
    pub fn add(&mut self, name: &str, count: u32) {
        let name = name.trim();
        if name.is_empty() || count == 0 {
            return;
        }
        match self.index.get(&label_key(name)) {
            Some(&i) => self.counts[i].count += count,
            None => {
                self.index.insert(label_key(name), self.counts.len());
                self.counts.push(ActorCount {
                    name: name.to_string(),
                    count,
                });
            }
        }
    }

    pub fn merge(&mut self, other: &MentionTally) {
        for c in &other.counts {
            self.add(&c.name, c.count);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn count_of(&self, name: &str) -> u32 {
        self.index
            .get(&label_key(name))
            .map(|&i| self.counts[i].count)
            .unwrap_or(0)
    }

    /// Labels in first-seen order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.counts.iter().map(|c| c.name.as_str())
    }

    /// Highest count first; equal counts keep first-seen order.
    pub fn ranked(&self) -> Vec<&ActorCount> {
        let mut ranked: Vec<&ActorCount> = self.counts.iter().collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        ranked
    }

    pub fn top(&self, n: usize) -> Vec<String> {
        self.ranked()
            .into_iter()
            .take(n)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn counts(&self) -> &[ActorCount] {
        &self.counts
    }

    pub fn into_counts(self) -> Vec<ActorCount> {
        self.counts
    }
}

/// An article's actors as the tally counts them: trimmed, one per label key.
pub fn counted_actors(article: &Article) -> Vec<String> {
    let mut seen = HashSet::new();
    article
        .distinct_actors()
        .into_iter()
        .filter(|actor| seen.insert(label_key(actor)))
        .map(str::to_string)
        .collect()
}

/// Fingerprint a mention tally. `None` means "cannot fingerprint": the tally
/// has no actors, and the caller must keep it out of matching.
pub fn compute_fingerprint(tally: &MentionTally, top_n: usize) -> Option<Fingerprint> {
    let top_actors = tally.top(top_n.max(1));
    let nucleus_entity = top_actors.first()?.clone();
    Some(Fingerprint {
        nucleus_entity,
        top_actors,
    })
}

/// Overlap coefficient over `{nucleus} ∪ top_actors`:
/// `|A ∩ B| / min(|A|, |B|)`.
///
/// Symmetric, bounded in [0, 1], 1.0 for identical fingerprints and 0.0 when
/// the actor sets are disjoint or either side is empty.
pub fn similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let set_a = actor_set(a);
    let set_b = actor_set(b);
    let smaller = set_a.len().min(set_b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = set_a.intersection(&set_b).count();
    shared as f64 / smaller as f64
}

fn actor_set(fp: &Fingerprint) -> HashSet<String> {
    std::iter::once(&fp.nucleus_entity)
        .chain(fp.top_actors.iter())
        .map(|s| label_key(s))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(nucleus: &str, top: &[&str]) -> Fingerprint {
        Fingerprint {
            nucleus_entity: nucleus.to_string(),
            top_actors: top.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn tally(mentions: &[&str]) -> MentionTally {
        let mut t = MentionTally::new();
        for m in mentions {
            t.add(m, 1);
        }
        t
    }

    #[test]
    fn nucleus_is_most_mentioned_actor() {
        let t = tally(&["Binance", "SEC", "SEC", "Coinbase"]);
        let f = compute_fingerprint(&t, TOP_ACTORS).unwrap();
        assert_eq!(f.nucleus_entity, "SEC");
        assert_eq!(f.top_actors, vec!["SEC", "Binance", "Coinbase"]);
    }

    #[test]
    fn ties_resolve_to_first_seen() {
        let t = tally(&["Ripple", "SEC", "XRP", "SEC", "Ripple"]);
        let f = compute_fingerprint(&t, TOP_ACTORS).unwrap();
        assert_eq!(f.nucleus_entity, "Ripple");
        assert_eq!(f.top_actors, vec!["Ripple", "SEC", "XRP"]);
    }

    #[test]
    fn top_actors_are_capped() {
        let names: Vec<String> = (0..15).map(|i| format!("actor-{i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let f = compute_fingerprint(&tally(&refs), TOP_ACTORS).unwrap();
        assert_eq!(f.top_actors.len(), TOP_ACTORS);
        assert_eq!(f.top_actors[0], "actor-0");
    }

    #[test]
    fn empty_tally_cannot_be_fingerprinted() {
        assert!(compute_fingerprint(&MentionTally::new(), TOP_ACTORS).is_none());
        assert!(compute_fingerprint(&tally(&["  ", ""]), TOP_ACTORS).is_none());
    }

    #[test]
    fn labels_merge_case_insensitively_keeping_first_spelling() {
        let t = tally(&["Binance", "binance ", "BINANCE"]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.count_of("binance"), 3);
        assert_eq!(t.labels().collect::<Vec<_>>(), vec!["Binance"]);
    }

    #[test]
    fn from_counts_round_trips_weights() {
        let counts = vec![
            ActorCount { name: "SEC".into(), count: 4 },
            ActorCount { name: "Kraken".into(), count: 7 },
            ActorCount { name: "Nobody".into(), count: 0 },
        ];
        let t = MentionTally::from_counts(&counts);
        assert_eq!(t.len(), 2);
        assert_eq!(t.top(1), vec!["Kraken"]);
    }

    #[test]
    fn identical_fingerprints_are_fully_similar() {
        let a = fp("SEC", &["SEC", "Binance", "CZ"]);
        assert_eq!(similarity(&a, &a.clone()), 1.0);
    }

    #[test]
    fn disjoint_fingerprints_have_zero_similarity() {
        let a = fp("SEC", &["SEC", "Binance"]);
        let b = fp("Ethereum", &["Ethereum", "Vitalik Buterin"]);
        assert_eq!(similarity(&a, &b), 0.0);
    }

    #[test]
    fn similarity_is_symmetric() {
        let pairs = [
            (fp("SEC", &["SEC", "Binance", "CZ"]), fp("SEC", &["SEC", "Coinbase"])),
            (fp("Ripple", &["Ripple", "SEC"]), fp("Ripple", &["Ripple", "SEC", "XRP"])),
            (fp("BlackRock", &["BlackRock", "ETF", "SEC", "Fidelity"]), fp("ETF", &["ETF"])),
            (fp("a", &[]), fp("b", &["a", "c", "d", "e"])),
        ];
        for (a, b) in &pairs {
            assert_eq!(similarity(a, b), similarity(b, a));
            let s = similarity(a, b);
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn subset_cluster_scores_against_larger_narrative() {
        let cluster = fp("Ripple", &["Ripple", "SEC"]);
        let narrative = fp("Ripple", &["Ripple", "SEC", "XRP"]);
        assert!(similarity(&cluster, &narrative) >= 0.6);
    }

    #[test]
    fn partial_overlap_uses_smaller_set() {
        // {SEC, Binance, CZ, Tether, Circle} vs {SEC, Binance, CZ, Kraken, Gemini}: 3/5.
        let a = fp("SEC", &["SEC", "Binance", "CZ", "Tether", "Circle"]);
        let b = fp("SEC", &["SEC", "Binance", "CZ", "Kraken", "Gemini"]);
        assert_eq!(similarity(&a, &b), 0.6);
    }
}

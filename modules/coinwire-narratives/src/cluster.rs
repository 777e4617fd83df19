//! Candidate clusters: connected components over shared actors and tensions.
//!
//! Two articles are connected when they share at least [`MIN_SHARED_ACTORS`]
//! actors or at least one tension label. Clusters are the connected components
//! of that graph, computed with union-find, so the partition does not depend on
//! input order.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use coinwire_common::{Article, Fingerprint};

use crate::fingerprint::{compute_fingerprint, label_key, MentionTally};

/// Shared actors needed to connect two articles without a shared tension.
pub const MIN_SHARED_ACTORS: u32 = 2;

/// An ephemeral group of articles from one detection pass.
#[derive(Debug, Clone)]
pub struct CandidateCluster {
    /// Members ordered by `(published_at, id)`.
    pub articles: Vec<Article>,
    pub actors: MentionTally,
    pub tensions: MentionTally,
    pub nucleus_entity: Option<String>,
}

impl CandidateCluster {
    pub fn from_articles(mut articles: Vec<Article>) -> Self {
        articles.sort_by(|a, b| (a.published_at, a.id).cmp(&(b.published_at, b.id)));
        let actors = MentionTally::from_actors(&articles);
        let tensions = MentionTally::from_tensions(&articles);
        let nucleus_entity = actors.top(1).into_iter().next();
        Self {
            articles,
            actors,
            tensions,
            nucleus_entity,
        }
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    pub fn article_ids(&self) -> Vec<Uuid> {
        self.articles.iter().map(|a| a.id).collect()
    }

    pub fn fingerprint(&self, top_n: usize) -> Option<Fingerprint> {
        compute_fingerprint(&self.actors, top_n)
    }

    /// Most recently published member.
    pub fn latest_article(&self) -> Option<&Article> {
        self.articles.last()
    }

    pub fn latest_published(&self) -> Option<DateTime<Utc>> {
        self.latest_article().map(|a| a.published_at)
    }
}

/// Disjoint-set forest with path halving and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Partition articles into candidate clusters.
///
/// Duplicate article ids are collapsed. Members of each cluster are ordered by
/// `(published_at, id)` and clusters by their first member, so the output is
/// the same for any permutation of the input.
pub fn cluster(articles: &[Article]) -> Vec<CandidateCluster> {
    let mut seen = HashSet::new();
    let mut sorted: Vec<&Article> = articles.iter().filter(|a| seen.insert(a.id)).collect();
    sorted.sort_by(|a, b| (a.published_at, a.id).cmp(&(b.published_at, b.id)));

    let n = sorted.len();
    let mut uf = UnionFind::new(n);

    // Any shared tension connects.
    let mut first_with_tension: HashMap<String, usize> = HashMap::new();
    // Articles per actor, for counting shared actors per pair.
    let mut by_actor: HashMap<String, Vec<usize>> = HashMap::new();

    for (i, article) in sorted.iter().enumerate() {
        for tension in article.distinct_tensions() {
            match first_with_tension.get(&label_key(tension)) {
                Some(&j) => uf.union(i, j),
                None => {
                    first_with_tension.insert(label_key(tension), i);
                }
            }
        }
        let keys: HashSet<String> = article.distinct_actors().into_iter().map(label_key).collect();
        for key in keys {
            by_actor.entry(key).or_default().push(i);
        }
    }

    let mut shared: HashMap<(usize, usize), u32> = HashMap::new();
    for members in by_actor.values() {
        for (pos, &a) in members.iter().enumerate() {
            for &b in &members[pos + 1..] {
                let count = shared.entry((a, b)).or_insert(0);
                *count += 1;
                if *count == MIN_SHARED_ACTORS {
                    uf.union(a, b);
                }
            }
        }
    }

    let mut groups: Vec<Vec<Article>> = Vec::new();
    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    for (i, article) in sorted.iter().enumerate() {
        let root = uf.find(i);
        let g = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[g].push((*article).clone());
    }

    let clusters: Vec<CandidateCluster> = groups.into_iter().map(CandidateCluster::from_articles).collect();
    debug!(articles = n, clusters = clusters.len(), "Articles clustered");
    clusters
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::testing::{article, base_time};

    fn partition(clusters: &[CandidateCluster]) -> BTreeSet<BTreeSet<Uuid>> {
        clusters
            .iter()
            .map(|c| c.article_ids().into_iter().collect())
            .collect()
    }

    #[test]
    fn one_shared_actor_does_not_connect() {
        let a = article("SEC sues Binance", &["SEC", "Binance"], &[], 0);
        let b = article("SEC probes Coinbase", &["SEC", "Coinbase"], &[], 1);
        let clusters = cluster(&[a, b]);
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn two_shared_actors_connect_transitively() {
        let a = article("SEC vs Binance", &["SEC", "Binance"], &[], 0);
        let b = article("Binance settles with SEC", &["SEC", "Binance"], &[], 1);
        let c = article("SEC widens probe", &["SEC", "Coinbase", "Binance"], &[], 2);
        let clusters = cluster(&[a, b, c]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
        assert_eq!(clusters[0].nucleus_entity.as_deref(), Some("SEC"));
    }

    #[test]
    fn shared_tension_connects_without_shared_actors() {
        let a = article("EU passes MiCA", &["European Union"], &["regulation_vs_innovation"], 0);
        let b = article("Hong Kong licenses exchanges", &["HKMA"], &["regulation_vs_innovation"], 1);
        let clusters = cluster(&[a, b]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].tensions.top(1), vec!["regulation_vs_innovation"]);
    }

    #[test]
    fn bare_article_is_a_singleton() {
        let bare = article("Markets quiet", &[], &[], 0);
        let other = article("SEC vs Binance", &["SEC", "Binance"], &[], 1);
        let clusters = cluster(&[bare.clone(), other]);
        assert_eq!(clusters.len(), 2);
        let singleton = clusters.iter().find(|c| c.article_ids() == vec![bare.id]).unwrap();
        assert!(singleton.nucleus_entity.is_none());
        assert!(singleton.fingerprint(10).is_none());
    }

    #[test]
    fn partition_is_independent_of_input_order() {
        let articles = vec![
            article("a", &["SEC", "Binance"], &[], 0),
            article("b", &["Ripple", "XRP"], &["legal_uncertainty"], 1),
            article("c", &["SEC", "Binance", "CZ"], &[], 2),
            article("d", &["Ripple", "SEC"], &["legal_uncertainty"], 3),
            article("e", &["Ethereum"], &[], 4),
            article("f", &["CZ", "Binance"], &[], 5),
            article("g", &["Tether", "Circle"], &["stablecoin_trust"], 6),
            article("h", &["Circle", "USDC"], &["stablecoin_trust"], 7),
        ];
        let expected = partition(&cluster(&articles));

        let mut reversed = articles.clone();
        reversed.reverse();
        assert_eq!(partition(&cluster(&reversed)), expected);

        let mut rotated = articles.clone();
        rotated.rotate_left(3);
        assert_eq!(partition(&cluster(&rotated)), expected);

        let mut interleaved: Vec<Article> = articles.iter().step_by(2).cloned().collect();
        interleaved.extend(articles.iter().skip(1).step_by(2).cloned());
        assert_eq!(partition(&cluster(&interleaved)), expected);

        // a, c, f chain through Binance+SEC and Binance+CZ; b, d through the tension.
        assert_eq!(expected.len(), 4);
    }

    #[test]
    fn output_order_is_canonical() {
        let articles = vec![
            article("late", &["Solana", "Jupiter"], &[], 9),
            article("early", &["SEC", "Binance"], &[], 1),
            article("middle", &["Solana", "Jupiter"], &[], 5),
        ];
        let mut shuffled = articles.clone();
        shuffled.swap(0, 2);
        let first: Vec<Vec<Uuid>> = cluster(&articles).iter().map(|c| c.article_ids()).collect();
        let second: Vec<Vec<Uuid>> = cluster(&shuffled).iter().map(|c| c.article_ids()).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], vec![articles[1].id]);
        assert_eq!(first[1], vec![articles[2].id, articles[0].id]);
    }

    #[test]
    fn duplicate_article_ids_collapse() {
        let a = article("SEC vs Binance", &["SEC", "Binance"], &[], 0);
        let clusters = cluster(&[a.clone(), a]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 1);
    }

    #[test]
    fn actor_case_differences_still_connect() {
        let a = article("a", &["SEC", "Binance"], &[], 0);
        let b = article("b", &["sec", "BINANCE"], &[], 1);
        assert_eq!(cluster(&[a, b]).len(), 1);
    }

    #[test]
    fn cluster_tally_counts_each_article_once() {
        let a = article("a", &["SEC", "SEC", "Binance"], &[], 0);
        let b = article("b", &["SEC", "Binance"], &[], 1);
        let clusters = cluster(&[a, b]);
        assert_eq!(clusters[0].actors.count_of("SEC"), 2);
        assert_eq!(clusters[0].latest_published(), Some(base_time() + chrono::Duration::hours(1)));
    }
}

//! Cluster → narrative matching.
//!
//! Two routes, checked in order:
//! 1. **Affinity**: a narrative that already owns enough of the cluster's
//!    articles claims it. Re-running detection over an overlapping window
//!    lands articles where they went last time.
//! 2. **Fingerprint**: the best narrative whose similarity is at or above the
//!    threshold. Ties go to the most recently updated narrative.

use std::cmp::Ordering;
use std::collections::HashSet;

use uuid::Uuid;

use coinwire_common::{Fingerprint, Narrative};

use crate::fingerprint::similarity;

/// Scores within this distance are treated as equal.
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct Match<'a> {
    pub narrative: &'a Narrative,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Ownership<'a> {
    pub narrative: &'a Narrative,
    /// Share of the cluster's articles already in the narrative.
    pub containment: f64,
}

/// Inclusive threshold check: a boundary-equal score matches.
pub fn meets_threshold(score: f64, threshold: f64) -> bool {
    score + SCORE_EPSILON >= threshold
}

/// Whether a narrative may take part in matching at all.
pub fn is_candidate(narrative: &Narrative) -> bool {
    narrative.merged_into.is_none() && !narrative.fingerprint.nucleus_entity.is_empty()
}

/// Best narrative for a cluster fingerprint, or `None` to create a new one.
pub fn find_match<'a>(
    fingerprint: &Fingerprint,
    candidates: &'a [Narrative],
    threshold: f64,
) -> Option<Match<'a>> {
    candidates
        .iter()
        .filter(|n| is_candidate(n))
        .map(|n| Match {
            narrative: n,
            similarity: similarity(fingerprint, &n.fingerprint),
        })
        .filter(|m| meets_threshold(m.similarity, threshold))
        .max_by(|a, b| rank(a.similarity, a.narrative, b.similarity, b.narrative))
}

/// Narrative that already owns at least `threshold` of the given articles.
pub fn find_owner<'a>(
    article_ids: &[Uuid],
    candidates: &'a [Narrative],
    threshold: f64,
) -> Option<Ownership<'a>> {
    if article_ids.is_empty() {
        return None;
    }
    let wanted: HashSet<&Uuid> = article_ids.iter().collect();
    candidates
        .iter()
        .filter(|n| is_candidate(n))
        .filter_map(|n| {
            let owned = n.article_ids.iter().filter(|id| wanted.contains(id)).count();
            if owned == 0 {
                return None;
            }
            Some(Ownership {
                narrative: n,
                containment: owned as f64 / wanted.len() as f64,
            })
        })
        .filter(|o| meets_threshold(o.containment, threshold))
        .max_by(|a, b| rank(a.containment, a.narrative, b.containment, b.narrative))
}

/// Higher score wins, then fresher `last_updated`, then the lower id.
fn rank(score_a: f64, a: &Narrative, score_b: f64, b: &Narrative) -> Ordering {
    if (score_a - score_b).abs() > SCORE_EPSILON {
        return score_a.partial_cmp(&score_b).unwrap_or(Ordering::Equal);
    }
    a.last_updated
        .cmp(&b.last_updated)
        .then_with(|| b.id.cmp(&a.id))
}

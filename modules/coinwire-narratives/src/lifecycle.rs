//! Lifecycle tracking: velocity, recency and the narrative state machine.
//!
//! States move emerging → rising → hot → mature → cooling → archived, can fall
//! back when activity drops, and come back (resurrection) when a dormant
//! narrative receives new articles. Every state change appends one entry to
//! `lifecycle_history`; the log is never rewritten.

use chrono::{DateTime, Duration, Utc};

use coinwire_common::{LifecycleConfig, LifecycleEntry, LifecycleState, Narrative, TransitionKind};

/// Velocity never divides by less than one day.
const MIN_VELOCITY_WINDOW_DAYS: f64 = 1.0;

/// Velocity changes smaller than this are a plateau, not growth.
const VELOCITY_EPSILON: f64 = 1e-6;

/// What caused a lifecycle evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// New articles were merged.
    Merge,
    /// Periodic decay sweep; no new articles.
    Sweep,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleInputs {
    pub article_count: u32,
    pub velocity: f64,
    pub previous_velocity: f64,
    /// Time since `last_updated`.
    pub idle: Duration,
}

/// Malformed velocities (NaN, infinite, negative) read as zero.
pub fn sanitize_velocity(velocity: f64) -> f64 {
    if velocity.is_finite() && velocity > 0.0 {
        velocity
    } else {
        0.0
    }
}

/// Articles per day since `first_seen`, with a one-day floor on the window.
pub fn mention_velocity(article_count: u32, first_seen: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let days = (now - first_seen).num_seconds() as f64 / 86_400.0;
    sanitize_velocity(article_count as f64 / days.max(MIN_VELOCITY_WINDOW_DAYS))
}

/// Recency score: 1.0 when updated now → 0.0 at the archive cutoff.
pub fn recency_score(last_updated: DateTime<Utc>, now: DateTime<Utc>, config: &LifecycleConfig) -> f64 {
    let age_hours = (now - last_updated).num_minutes() as f64 / 60.0;
    let horizon_hours = (config.archive_after_days * 24) as f64;
    (1.0 - age_hours / horizon_hours).clamp(0.0, 1.0)
}

/// Derive the next state from the previous one. Rules are evaluated in order.
pub fn derive_state(
    previous: LifecycleState,
    inputs: &LifecycleInputs,
    trigger: Trigger,
    config: &LifecycleConfig,
) -> LifecycleState {
    let velocity = sanitize_velocity(inputs.velocity);
    let previous_velocity = sanitize_velocity(inputs.previous_velocity);

    // The sweep only decays; it never revives an archived narrative.
    if trigger == Trigger::Sweep && previous == LifecycleState::Archived {
        return LifecycleState::Archived;
    }
    if trigger == Trigger::Merge && previous.is_dormant() {
        return if velocity >= config.hot_velocity {
            LifecycleState::Hot
        } else {
            LifecycleState::Rising
        };
    }

    if trigger == Trigger::Sweep && inputs.idle >= Duration::days(config.archive_after_days) {
        return LifecycleState::Archived;
    }
    if inputs.idle >= Duration::hours(config.cooling_after_hours) {
        return LifecycleState::Cooling;
    }
    if velocity >= config.hot_velocity && inputs.idle <= Duration::hours(config.hot_window_hours) {
        return LifecycleState::Hot;
    }
    if previous == LifecycleState::Emerging && inputs.article_count < config.emerging_max_articles {
        return LifecycleState::Emerging;
    }
    if velocity > previous_velocity + VELOCITY_EPSILON {
        return LifecycleState::Rising;
    }
    if inputs.article_count >= config.mature_min_articles {
        return LifecycleState::Mature;
    }
    match previous {
        LifecycleState::Emerging => LifecycleState::Rising,
        // Hot or rising without growing velocity has plateaued.
        LifecycleState::Hot | LifecycleState::Rising => LifecycleState::Mature,
        other => other,
    }
}

/// The entry written for a brand-new narrative.
pub fn created_entry(narrative: &Narrative, now: DateTime<Utc>) -> LifecycleEntry {
    LifecycleEntry {
        state: LifecycleState::Emerging,
        timestamp: now,
        article_count: narrative.article_count,
        velocity: narrative.mention_velocity,
        kind: TransitionKind::Created,
    }
}

/// Recompute velocity and recency, derive the state, and append a history entry
/// if the state changed. Returns the appended entry.
///
/// On `Trigger::Merge` the caller has already bumped `last_updated`.
pub fn observe(
    narrative: &mut Narrative,
    trigger: Trigger,
    now: DateTime<Utc>,
    config: &LifecycleConfig,
) -> Option<LifecycleEntry> {
    let previous_velocity = sanitize_velocity(narrative.mention_velocity);
    let velocity = mention_velocity(narrative.article_count, narrative.first_seen, now);
    let idle = (now - narrative.last_updated).max(Duration::zero());

    narrative.mention_velocity = velocity;
    narrative.recency_score = recency_score(narrative.last_updated, now, config);

    let previous = narrative.lifecycle_state;
    let inputs = LifecycleInputs {
        article_count: narrative.article_count,
        velocity,
        previous_velocity,
        idle,
    };
    let next = derive_state(previous, &inputs, trigger, config);
    if next == previous {
        return None;
    }

    let kind = if trigger == Trigger::Merge && previous.is_dormant() {
        TransitionKind::Resurrection
    } else {
        TransitionKind::Transition
    };
    let entry = LifecycleEntry {
        state: next,
        timestamp: now,
        article_count: narrative.article_count,
        velocity,
        kind,
    };
    narrative.lifecycle_state = next;
    narrative.lifecycle_history.push(entry.clone());
    Some(entry)
}

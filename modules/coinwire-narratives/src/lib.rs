pub mod articles;
pub mod cluster;
pub mod dedup;
pub mod detection;
pub mod fingerprint;
pub mod lifecycle;
pub mod matcher;
pub mod merge;
pub mod migrate;
pub mod retry;
pub mod store;
pub mod sweep;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


pub use articles::{ArticleSource, PgArticleSource};
pub use cluster::{cluster, CandidateCluster};
pub use dedup::{DedupStats, DuplicateConsolidator};
pub use detection::{DetectionError, DetectionStats, NarrativeDetector};
pub use fingerprint::{compute_fingerprint, similarity, MentionTally, TOP_ACTORS};
pub use lifecycle::{derive_state, mention_velocity, observe, Trigger};
pub use matcher::{find_match, find_owner, Match, Ownership};
pub use merge::{MergeEngine, MergeOutcome, Unfingerprintable};
pub use migrate::{backfill_fingerprints, migrate, repair_document, BackfillStats};
pub use retry::retry_on_conflict;
pub use store::{NarrativeStore, PgNarrativeStore, StoreError, StoreResult};
pub use sweep::{LifecycleSweeper, SweepStats};

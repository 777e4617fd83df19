//! Integration tests for PgNarrativeStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use chrono::Duration;
use coinwire_common::{FileConfig, LifecycleState, NarrativeDocument};
use coinwire_narratives::testing::{hours, narrative_with};
use coinwire_narratives::{migrate, NarrativeStore, PgNarrativeStore, StoreError};
use sqlx::PgPool;

/// Get a migrated, empty test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    migrate(&pool).await.ok()?;

    // Clean slate for each test
    sqlx::query("TRUNCATE narratives").execute(&pool).await.ok()?;

    Some(pool)
}

#[tokio::test]
async fn create_then_update_bumps_version() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgNarrativeStore::new(pool);

    let created = store.upsert(&narrative_with(&["SEC", "Binance"], 0)).await.unwrap();
    assert_eq!(created.version, 1);

    let mut edited = created.clone();
    edited.summary = "Binance settles".to_string();
    let updated = store.upsert(&edited).await.unwrap();
    assert_eq!(updated.version, 2);

    let read = store.get_by_id(created.id).await.unwrap().unwrap();
    assert_eq!(read.summary, "Binance settles");
    assert_eq!(read.version, 2);
    assert_eq!(read.nucleus_entity, "SEC");
}

#[tokio::test]
async fn stale_version_conflicts() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgNarrativeStore::new(pool);

    let created = store.upsert(&narrative_with(&["Ripple", "SEC"], 0)).await.unwrap();
    store.upsert(&created).await.unwrap();

    let err = store.upsert(&created).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { expected: 1, .. }));

    // Creating an id that already exists is a conflict too.
    let mut duplicate = created.clone();
    duplicate.version = 0;
    assert!(store.upsert(&duplicate).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn active_pool_skips_absorbed_and_long_archived() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgNarrativeStore::new(pool);

    let live = store.upsert(&narrative_with(&["Solana", "Jupiter"], 0)).await.unwrap();

    let mut archived = narrative_with(&["Terra", "Luna"], 0);
    archived.lifecycle_state = LifecycleState::Archived;
    let archived = store.upsert(&archived).await.unwrap();

    let mut absorbed = narrative_with(&["Solana", "Jupiter"], 1);
    absorbed.merged_into = Some(live.id);
    store.upsert(&absorbed).await.unwrap();

    let recent = store.find_active_narratives(hours(0) - Duration::days(1)).await.unwrap();
    let ids: Vec<_> = recent.iter().map(|n| n.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&live.id) && ids.contains(&archived.id));

    let later = store.find_active_narratives(hours(1)).await.unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].id, live.id);

    let by_nucleus = store.find_by_nucleus("Solana").await.unwrap();
    assert_eq!(by_nucleus.len(), 1);
    assert_eq!(by_nucleus[0].id, live.id);
}

#[tokio::test]
async fn legacy_rows_are_hidden_from_matching_and_listed_for_backfill() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgNarrativeStore::new(pool.clone());

    let mut legacy = NarrativeDocument::from(&narrative_with(&["Ethereum", "Vitalik Buterin"], 0));
    legacy.fingerprint = None;
    legacy.nucleus_entity = None;
    sqlx::query(
        r#"
        INSERT INTO narratives (id, nucleus_entity, lifecycle_state, last_updated, document)
        VALUES ($1, NULL, 'emerging', $2, $3)
        "#,
    )
    .bind(legacy.id)
    .bind(legacy.last_updated)
    .bind(serde_json::to_value(&legacy).unwrap())
    .execute(&pool)
    .await
    .unwrap();

    assert!(store.get_by_id(legacy.id).await.unwrap().is_none());
    assert!(store.find_active_narratives(hours(0)).await.unwrap().is_empty());

    let found = store.find_legacy_documents().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].version, 1);

    let stats = coinwire_narratives::backfill_fingerprints(&store, &FileConfig::default().matching).await.unwrap();
    assert_eq!(stats.repaired, 1);
    assert!(store.find_legacy_documents().await.unwrap().is_empty());
    let repaired = store.get_by_id(legacy.id).await.unwrap().unwrap();
    assert_eq!(repaired.nucleus_entity, "Ethereum");
}

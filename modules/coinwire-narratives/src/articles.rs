//! Enriched articles, read from the upstream enrichment pipeline's table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use coinwire_common::Article;

#[async_trait]
pub trait ArticleSource: Send + Sync {
    /// Articles whose enrichment finished at or after `cutoff`.
    async fn enriched_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Article>>;
}

#[derive(Debug, sqlx::FromRow)]
struct ArticleRow {
    id: Uuid,
    title: String,
    published_at: DateTime<Utc>,
    actors: Option<Vec<String>>,
    actions: Option<Vec<String>>,
    tensions: Option<Vec<String>>,
    narrative_summary: Option<String>,
    content_hash: Option<String>,
}

impl From<ArticleRow> for Article {
    fn from(row: ArticleRow) -> Self {
        Article::builder()
            .id(row.id)
            .title(row.title)
            .published_at(row.published_at)
            .actors(row.actors.unwrap_or_default())
            .actions(row.actions.unwrap_or_default())
            .tensions(row.tensions.unwrap_or_default())
            .narrative_summary(row.narrative_summary.unwrap_or_default())
            .content_hash(row.content_hash.unwrap_or_default())
            .build()
    }
}

/// Reads the `articles` table owned by the ingestion side. Rows that have not
/// been enriched yet (`enriched_at IS NULL`) are invisible to detection.
#[derive(Clone)]
pub struct PgArticleSource {
    pool: PgPool,
}

impl PgArticleSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArticleSource for PgArticleSource {
    async fn enriched_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Article>> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, title, published_at, actors, actions, tensions, narrative_summary, content_hash
            FROM articles
            WHERE enriched_at IS NOT NULL AND enriched_at >= $1
            ORDER BY published_at, id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load enriched articles")?;

        Ok(rows.into_iter().map(Article::from).collect())
    }
}

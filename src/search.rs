//! Full-text search over page content.
//!
//! One FTS5 row per page path, replaced wholesale on update. Multi-term
//! queries AND their terms and quoted substrings are exact phrases (both
//! native FTS5 behavior); malformed query syntax from user input degrades
//! to a plain substring scan instead of surfacing an error.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub path: String,
    pub snippet: String,
    pub score: f64,
}

pub struct SearchIndex {
    pool: SqlitePool,
}

impl SearchIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert one page: delete-then-insert keyed by path.
    pub async fn add(&self, path: &str, content: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pages_fts WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO pages_fts(path, content) VALUES (?, ?)")
            .bind(path)
            .bind(content)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM pages_fts WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear the index and bulk-insert. Used after any bulk external
    /// change (remote pull) where incremental tracking is infeasible.
    pub async fn rebuild(&self, pages: &[(String, String)]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pages_fts").execute(&mut *tx).await?;

        for (path, content) in pages {
            sqlx::query("INSERT INTO pages_fts(path, content) VALUES (?, ?)")
                .bind(path)
                .bind(content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(pages.len())
    }

    /// Relevance-ordered search. An empty or whitespace query returns no
    /// results; a query FTS5 cannot parse falls back to substring match.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        // Escape embedded quotes so user text cannot break out of the
        // MATCH expression
        let safe_query = query.replace('"', "\"\"");

        let rows = sqlx::query(
            r#"
            SELECT
                path,
                snippet(pages_fts, 1, '<mark>', '</mark>', '...', 32) AS snippet,
                bm25(pages_fts) AS score
            FROM pages_fts
            WHERE pages_fts MATCH ?
            ORDER BY score
            LIMIT ?
            "#,
        )
        .bind(&safe_query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => Ok(rows
                .iter()
                .map(|row| SearchResult {
                    path: row.get("path"),
                    snippet: row.get("snippet"),
                    score: row.get("score"),
                })
                .collect()),
            // Invalid query syntax, try simpler search
            Err(sqlx::Error::Database(_)) => self.substring_search(query, limit).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn substring_search(&self, query: &str, limit: i64) -> Result<Vec<SearchResult>> {
        let rows = sqlx::query(
            r#"
            SELECT path, substr(content, 1, 200) AS snippet
            FROM pages_fts
            WHERE content LIKE ?
            LIMIT ?
            "#,
        )
        .bind(format!("%{}%", query))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SearchResult {
                path: row.get("path"),
                snippet: format!("{}...", row.get::<String, _>("snippet")),
                score: 0.0,
            })
            .collect())
    }
}

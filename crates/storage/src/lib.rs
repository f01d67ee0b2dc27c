//! Durable query registry (C3) and per-query latest-listing store (C4),
//! backed by Postgres via `sqlx`. The two tables are intentionally not
//! foreign-keyed to each other — see `migrations/002_latest_listing_info.sql`
//! — so the bootstrap reconciliation in `marketwatch` (§4.6) has real work
//! to do.

use chrono::{DateTime, Utc};
use marketwatch_core::{NotifierError, Query, QueryStatus};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

static BROWSER_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://www\.2dehands\.be/(q|l)/[^?]*$").unwrap());
static REQUEST_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://www\.2dehands\.be/lrp/api/search\?.*").unwrap());

#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct QueryRow {
    id: i64,
    browser_url: String,
    request_url: String,
    query: Option<String>,
    next_check_time: Option<DateTime<Utc>>,
    status: String,
}

impl TryFrom<QueryRow> for Query {
    type Error = NotifierError;

    fn try_from(row: QueryRow) -> Result<Self, Self::Error> {
        let status = QueryStatus::parse(&row.status)
            .ok_or_else(|| NotifierError::Database(format!("unknown status: {}", row.status)))?;
        Ok(Query {
            id: row.id,
            browser_url: row.browser_url,
            request_url: row.request_url,
            query: row.query,
            next_check_time: row.next_check_time,
            status,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LatestListingRow {
    item_id: String,
    title: String,
}

impl Storage {
    pub async fn connect(database_url: &str) -> Result<Self, NotifierError> {
        Self::with_pool_size(database_url, 10).await
    }

    pub async fn with_pool_size(database_url: &str, max_connections: u32) -> Result<Self, NotifierError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), NotifierError> {
        sqlx::raw_sql(include_str!("../migrations/001_query_info.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        sqlx::raw_sql(include_str!("../migrations/002_latest_listing_info.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        info!("migrations complete");
        Ok(())
    }

    // --- C3: Query registry ---------------------------------------------

    pub async fn create_query(
        &self,
        browser_url: &str,
        request_url: &str,
        query: Option<&str>,
    ) -> Result<Query, NotifierError> {
        validate_browser_url(browser_url)?;
        validate_request_url(request_url)?;

        let row: QueryRow = sqlx::query_as(
            "INSERT INTO query_info (browser_url, request_url, query, status)
             VALUES ($1, $2, $3, 'ACTIVE')
             RETURNING id, browser_url, request_url, query, next_check_time, status",
        )
        .bind(browser_url)
        .bind(request_url)
        .bind(query)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_error(e, browser_url))?;

        Query::try_from(row)
    }

    pub async fn list_queries(&self, status: Option<QueryStatus>) -> Result<Vec<Query>, NotifierError> {
        let rows: Vec<QueryRow> = match status {
            Some(s) => sqlx::query_as(
                "SELECT id, browser_url, request_url, query, next_check_time, status
                 FROM query_info WHERE status = $1 ORDER BY id",
            )
            .bind(s.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?,
            None => sqlx::query_as(
                "SELECT id, browser_url, request_url, query, next_check_time, status
                 FROM query_info ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?,
        };
        rows.into_iter().map(Query::try_from).collect()
    }

    pub async fn get_query(&self, id: i64) -> Result<Query, NotifierError> {
        let row: Option<QueryRow> = sqlx::query_as(
            "SELECT id, browser_url, request_url, query, next_check_time, status
             FROM query_info WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| NotifierError::Database(e.to_string()))?;

        match row {
            Some(row) => Query::try_from(row),
            None => Err(NotifierError::NotFound(format!("query {id}"))),
        }
    }

    pub async fn delete_query(&self, id: i64) -> Result<(), NotifierError> {
        let result = sqlx::query("DELETE FROM query_info WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(NotifierError::NotFound(format!("query {id}")));
        }
        Ok(())
    }

    pub async fn set_status(&self, id: i64, status: QueryStatus) -> Result<u64, NotifierError> {
        let result = sqlx::query("UPDATE query_info SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Same as `set_status`, keyed by `request_url` — the scheduler only
    /// ever holds the request URL, never the query id (§4.4.2).
    pub async fn set_status_by_request_url(
        &self,
        request_url: &str,
        status: QueryStatus,
    ) -> Result<u64, NotifierError> {
        let result = sqlx::query("UPDATE query_info SET status = $1 WHERE request_url = $2")
            .bind(status.as_str())
            .bind(request_url)
            .execute(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    pub async fn update_next_check(&self, request_url: &str, t: DateTime<Utc>) -> Result<(), NotifierError> {
        sqlx::query("UPDATE query_info SET next_check_time = $1 WHERE request_url = $2")
            .bind(t)
            .bind(request_url)
            .execute(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        Ok(())
    }

    // --- C4: Per-query latest-listing store ------------------------------

    /// Existence check keyed by `request_url`, used by C6 step 1 to detect a
    /// query deleted mid-tick (§4.5, `MidFlightDeletion`).
    pub async fn query_exists_by_request_url(&self, request_url: &str) -> Result<bool, NotifierError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM query_info WHERE request_url = $1")
            .bind(request_url)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| NotifierError::Database(e.to_string()))?;
        Ok(row.0 > 0)
    }

    pub async fn get_latest_listing_id(&self, request_url: &str) -> Result<Option<String>, NotifierError> {
        let row: Option<LatestListingRow> =
            sqlx::query_as("SELECT item_id, title FROM latest_listing_info WHERE request_url = $1")
                .bind(request_url)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| NotifierError::Database(e.to_string()))?;
        Ok(row.map(|r| r.item_id))
    }

    pub async fn upsert_latest_listing(
        &self,
        request_url: &str,
        item_id: &str,
        title: &str,
    ) -> Result<(), NotifierError> {
        sqlx::query(
            "INSERT INTO latest_listing_info (request_url, item_id, title)
             VALUES ($1, $2, $3)
             ON CONFLICT (request_url) DO UPDATE SET item_id = EXCLUDED.item_id, title = EXCLUDED.title",
        )
        .bind(request_url)
        .bind(item_id)
        .bind(title)
        .execute(&self.pool)
        .await
        .map_err(|e| NotifierError::Database(e.to_string()))?;
        Ok(())
    }

    /// Bootstrap reconciliation (§4.6): delete every `latest_listing_info`
    /// row whose `request_url` no longer has a matching `query_info` row.
    /// Queries are the source of truth.
    pub async fn delete_orphan_latest_listings(&self) -> Result<u64, NotifierError> {
        let result = sqlx::query(
            "DELETE FROM latest_listing_info
             WHERE request_url NOT IN (SELECT request_url FROM query_info)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| NotifierError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn validate_browser_url(url: &str) -> Result<(), NotifierError> {
    if BROWSER_URL_RE.is_match(url) {
        Ok(())
    } else {
        Err(NotifierError::Validation(format!("invalid browser_url: {url}")))
    }
}

fn validate_request_url(url: &str) -> Result<(), NotifierError> {
    if REQUEST_URL_RE.is_match(url) {
        Ok(())
    } else {
        Err(NotifierError::Validation(format!("invalid request_url: {url}")))
    }
}

/// Postgres unique-violation (`23505`) becomes a `Uniqueness` error (§4.3);
/// everything else is a plain database error.
fn map_db_error(err: sqlx::Error, context: &str) -> NotifierError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return NotifierError::Uniqueness(context.to_string());
        }
    }
    NotifierError::Database(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_url_pattern_accepts_q_and_l_modes() {
        assert!(BROWSER_URL_RE.is_match("https://www.2dehands.be/q/iphone/#Language:all-languages"));
        assert!(BROWSER_URL_RE.is_match("https://www.2dehands.be/l/fietsen/koersfietsen/"));
        assert!(!BROWSER_URL_RE.is_match("https://www.2dehands.be/x/iphone/"));
        assert!(!BROWSER_URL_RE.is_match("https://example.com/q/iphone/"));
    }

    #[test]
    fn request_url_pattern_requires_search_endpoint_and_query_string() {
        assert!(REQUEST_URL_RE.is_match("https://www.2dehands.be/lrp/api/search?limit=100"));
        assert!(!REQUEST_URL_RE.is_match("https://www.2dehands.be/lrp/api/search"));
        assert!(!REQUEST_URL_RE.is_match("https://www.2dehands.be/other?limit=100"));
    }
}

//! Edge-invocation idempotency registry.
//!
//! Adapters register `(route, key)` before performing any external side
//! effect; a conflict means another adapter already owns the pair and the
//! side effect must be skipped. The primary key caps the pair at one row,
//! hence at most one completed invocation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};

#[derive(Debug, Clone)]
pub struct EdgeInvocationRow {
    pub route: String,
    pub key: String,
    pub status: String,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub response_code: Option<i32>,
    pub error: Option<String>,
}

/// Attempt to register `(route, key)`. Returns true when this caller won the
/// registration and must perform the side effect; false when the pair is
/// already registered and the side effect must be skipped.
pub async fn try_register(conn: &mut PgConnection, route: &str, key: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into edge_invocations (route, key, status)
        values ($1, $2, 'pending')
        on conflict (route, key) do nothing
        returning route
        "#,
    )
    .bind(route)
    .bind(key)
    .fetch_optional(conn)
    .await
    .context("edge register failed")?;

    Ok(row.is_some())
}

/// Record a completed side effect.
pub async fn mark_completed(
    conn: &mut PgConnection,
    route: &str,
    key: &str,
    response_code: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        update edge_invocations
           set status = 'completed',
               response_code = $3,
               error = null,
               last_attempt_at = now()
         where route = $1 and key = $2
        "#,
    )
    .bind(route)
    .bind(key)
    .bind(response_code)
    .execute(conn)
    .await
    .context("edge mark completed failed")?;
    Ok(())
}

/// Record a failed side effect (the registration stays; the pair is spent).
pub async fn mark_failed(
    conn: &mut PgConnection,
    route: &str,
    key: &str,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        update edge_invocations
           set status = 'failed',
               error = $3,
               last_attempt_at = now()
         where route = $1 and key = $2
        "#,
    )
    .bind(route)
    .bind(key)
    .bind(error)
    .execute(conn)
    .await
    .context("edge mark failed failed")?;
    Ok(())
}

/// Fetch one registration.
pub async fn fetch(pool: &PgPool, route: &str, key: &str) -> Result<Option<EdgeInvocationRow>> {
    let row = sqlx::query(
        r#"
        select route, key, status, first_attempt_at, last_attempt_at, response_code, error
        from edge_invocations
        where route = $1 and key = $2
        "#,
    )
    .bind(route)
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("edge fetch failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(EdgeInvocationRow {
        route: row.try_get("route")?,
        key: row.try_get("key")?,
        status: row.try_get("status")?,
        first_attempt_at: row.try_get("first_attempt_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        response_code: row.try_get("response_code")?,
        error: row.try_get("error")?,
    }))
}

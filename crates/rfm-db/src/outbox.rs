//! Transactional outbox.
//!
//! `enqueue` only ever runs on the transaction handle of the business
//! mutation it describes; there is deliberately no pool-level variant, so a
//! message cannot commit without its mutation.
//! Workers drain pending rows in id order under `FOR UPDATE SKIP LOCKED`
//! so two workers never process the same row concurrently, and delivery is
//! at-least-once: a crash between delivery and `mark_processed` re-delivers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};

/// Notify channel signaled by the insert trigger.
pub const NOTIFY_CHANNEL: &str = "outbox_new";

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Enqueue a message inside the caller's transaction.
pub async fn enqueue(conn: &mut PgConnection, topic: &str, payload: Value) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into outbox (topic, payload)
        values ($1, $2)
        returning id
        "#,
    )
    .bind(topic)
    .bind(payload)
    .fetch_one(conn)
    .await
    .context("outbox enqueue failed")?;
    Ok(id)
}

/// Lock up to `limit` pending rows for this transaction, oldest first.
/// Rows held by a concurrent worker are skipped, not waited on. The locks
/// release on commit/rollback, so the caller must mark each row before
/// committing.
pub async fn lock_pending_batch(
    conn: &mut PgConnection,
    limit: i64,
) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query(
        r#"
        select id, topic, payload, status, attempts, last_attempt, created_at
        from outbox
        where status = 'pending'
        order by id asc
        limit $1
        for update skip locked
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
    .context("outbox lock batch failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(map_row(&row)?);
    }
    Ok(out)
}

/// Mark a locked row processed.
pub async fn mark_processed(conn: &mut PgConnection, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        update outbox
           set status = 'processed',
               attempts = attempts + 1,
               last_attempt = now()
         where id = $1
        "#,
    )
    .bind(id)
    .execute(conn)
    .await
    .context("outbox mark processed failed")?;
    Ok(())
}

/// Record a failed delivery attempt on a locked row. The row stays pending
/// until the retry budget is spent, then parks as dead.
pub async fn mark_attempt_failed(
    conn: &mut PgConnection,
    id: i64,
    max_attempts: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        update outbox
           set attempts = attempts + 1,
               last_attempt = now(),
               status = case when attempts + 1 >= $2 then 'dead' else 'pending' end
         where id = $1
        "#,
    )
    .bind(id)
    .bind(max_attempts)
    .execute(conn)
    .await
    .context("outbox mark attempt failed")?;
    Ok(())
}

/// Fetch one row by id.
pub async fn fetch(pool: &PgPool, id: i64) -> Result<Option<OutboxRow>> {
    let row = sqlx::query(
        r#"
        select id, topic, payload, status, attempts, last_attempt, created_at
        from outbox
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("outbox fetch failed")?;

    row.as_ref().map(map_row).transpose().map_err(Into::into)
}

/// Count rows by topic and status (test and introspection support).
pub async fn count_by_topic(pool: &PgPool, topic: &str, status: &str) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from outbox where topic = $1 and status = $2",
    )
    .bind(topic)
    .bind(status)
    .fetch_one(pool)
    .await
    .context("outbox count failed")?;
    Ok(n)
}

#[derive(Debug, Clone)]
pub struct OutboxDepth {
    pub pending: i64,
    pub dead: i64,
    pub oldest_pending_secs: Option<f64>,
}

/// Queue depth summary backing `db status` and the stuck-queue oracle.
pub async fn depth(pool: &PgPool) -> Result<OutboxDepth> {
    let row = sqlx::query(
        r#"
        select
            count(*) filter (where status = 'pending')::bigint           as pending,
            count(*) filter (where status = 'dead')::bigint              as dead,
            extract(epoch from now() - min(created_at)
                    filter (where status = 'pending'))::float8           as oldest_pending_secs
        from outbox
        "#,
    )
    .fetch_one(pool)
    .await
    .context("outbox depth failed")?;

    Ok(OutboxDepth {
        pending: row.try_get("pending")?,
        dead: row.try_get("dead")?,
        oldest_pending_secs: row.try_get("oldest_pending_secs")?,
    })
}

fn map_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRow, sqlx::Error> {
    Ok(OutboxRow {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        last_attempt: row.try_get("last_attempt")?,
        created_at: row.try_get("created_at")?,
    })
}

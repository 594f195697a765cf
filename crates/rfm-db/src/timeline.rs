//! WORM timeline ledger.
//!
//! Appends run on the business transaction's handle. The insert trigger
//! assigns `seq` from the per-agreement counter, stamps `actor_broker_id`
//! from the session context, and enforces the temporal gate; this module only
//! shapes the insert and maps rows back out.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use rfm_schemas::{Page, TimelineEventView, TIMELINE_PAYLOAD_VERSION};

/// Append one event. The caller must have set the actor-broker context on
/// this connection (see `set_actor_broker`) inside the current transaction;
/// the ledger refuses the write otherwise.
pub async fn append_event(
    conn: &mut PgConnection,
    agreement_id: Uuid,
    event_type: &str,
    payload: Value,
    actor_id: Option<Uuid>,
) -> Result<TimelineEventView, sqlx::Error> {
    // seq and actor_broker_id are deliberately absent: the insert trigger
    // fills both before the not-null checks run, so callers cannot supply
    // either.
    let row = sqlx::query(
        r#"
        insert into timeline_events (agreement_id, event_type, payload, payload_version, actor_id)
        values ($1, $2, $3, $4, $5)
        returning id, agreement_id, seq, event_type, payload, payload_version,
                  actor_id, actor_broker_id, ts
        "#,
    )
    .bind(agreement_id)
    .bind(event_type)
    .bind(payload)
    .bind(TIMELINE_PAYLOAD_VERSION)
    .bind(actor_id)
    .fetch_one(conn)
    .await?;

    map_row(&row)
}

/// Paged readout ordered by seq (backs the events listing).
pub async fn list_events(
    pool: &PgPool,
    agreement_id: Uuid,
    page: Page,
) -> Result<(Vec<TimelineEventView>, i64)> {
    let (total,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from timeline_events where agreement_id = $1",
    )
    .bind(agreement_id)
    .fetch_one(pool)
    .await
    .context("timeline count failed")?;

    let rows = sqlx::query(
        r#"
        select id, agreement_id, seq, event_type, payload, payload_version,
               actor_id, actor_broker_id, ts
        from timeline_events
        where agreement_id = $1
        order by seq asc
        limit $2 offset $3
        "#,
    )
    .bind(agreement_id)
    .bind(page.page_size)
    .bind(page.offset())
    .fetch_all(pool)
    .await
    .context("timeline list failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(map_row(&row).context("timeline row decode failed")?);
    }
    Ok((out, total))
}

/// Count events of one type for an agreement (test and oracle support).
pub async fn count_events_of_type(
    pool: &PgPool,
    agreement_id: Uuid,
    event_type: &str,
) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from timeline_events
        where agreement_id = $1 and event_type = $2
        "#,
    )
    .bind(agreement_id)
    .bind(event_type)
    .fetch_one(pool)
    .await
    .context("timeline count-by-type failed")?;
    Ok(n)
}

fn map_row(row: &sqlx::postgres::PgRow) -> Result<TimelineEventView, sqlx::Error> {
    Ok(TimelineEventView {
        id: row.try_get("id")?,
        agreement_id: row.try_get("agreement_id")?,
        seq: row.try_get("seq")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        payload_version: row.try_get("payload_version")?,
        actor_id: row.try_get("actor_id")?,
        actor_broker_id: row.try_get("actor_broker_id")?,
        ts: row.try_get::<DateTime<Utc>, _>("ts")?,
    })
}

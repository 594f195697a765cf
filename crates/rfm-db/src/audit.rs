//! Append-only audit log. Updates and deletes are rejected by trigger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: Uuid,
    pub agreement_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub metadata: Value,
    pub ts: DateTime<Utc>,
}

/// Append one audit row on the caller's transaction.
pub async fn append(
    conn: &mut PgConnection,
    agreement_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    action: &str,
    metadata: Value,
) -> Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into audit_logs (agreement_id, actor_id, action, metadata)
        values ($1, $2, $3, $4)
        returning id
        "#,
    )
    .bind(agreement_id)
    .bind(actor_id)
    .bind(action)
    .bind(metadata)
    .fetch_one(conn)
    .await
    .context("audit append failed")?;
    Ok(id)
}

/// All audit rows for an agreement, oldest first.
pub async fn list_for_agreement(pool: &PgPool, agreement_id: Uuid) -> Result<Vec<AuditRow>> {
    let rows = sqlx::query(
        r#"
        select id, agreement_id, actor_id, action, metadata, ts
        from audit_logs
        where agreement_id = $1
        order by ts asc, id asc
        "#,
    )
    .bind(agreement_id)
    .fetch_all(pool)
    .await
    .context("audit list failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(AuditRow {
            id: row.try_get("id")?,
            agreement_id: row.try_get("agreement_id")?,
            actor_id: row.try_get("actor_id")?,
            action: row.try_get("action")?,
            metadata: row.try_get("metadata")?,
            ts: row.try_get("ts")?,
        });
    }
    Ok(out)
}

/// Count audit rows of one action for an agreement.
pub async fn count_action(pool: &PgPool, agreement_id: Uuid, action: &str) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from audit_logs
        where agreement_id = $1 and action = $2
        "#,
    )
    .bind(agreement_id)
    .bind(action)
    .fetch_one(pool)
    .await
    .context("audit count failed")?;
    Ok(n)
}

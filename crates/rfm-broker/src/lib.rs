//! Broker lookup and user→broker binding reads.

use anyhow::Context;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use rfm_schemas::{BrokerSummary, CoreError, CoreResult, Page};

#[derive(Clone)]
pub struct BrokerService {
    pool: PgPool,
}

impl BrokerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, broker_id: Uuid) -> CoreResult<BrokerSummary> {
        let row = sqlx::query(
            r#"
            select id, name, fein, verified
            from brokers
            where id = $1
            "#,
        )
        .bind(broker_id)
        .fetch_optional(&self.pool)
        .await
        .context("broker get failed")?;

        let Some(row) = row else {
            return Err(CoreError::not_found(format!("broker {broker_id}")));
        };
        Ok(map_row(&row).context("broker row decode failed")?)
    }

    pub async fn list(&self, page: Page) -> CoreResult<(Vec<BrokerSummary>, i64)> {
        let (total,): (i64,) = sqlx::query_as("select count(*)::bigint from brokers")
            .fetch_one(&self.pool)
            .await
            .context("broker count failed")?;

        let rows = sqlx::query(
            r#"
            select id, name, fein, verified
            from brokers
            order by name asc
            limit $1 offset $2
            "#,
        )
        .bind(page.page_size)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .context("broker list failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_row(&row).context("broker row decode failed")?);
        }
        Ok((out, total))
    }
}

fn map_row(row: &sqlx::postgres::PgRow) -> Result<BrokerSummary, sqlx::Error> {
    Ok(BrokerSummary {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        fein: row.try_get("fein")?,
        verified: row.try_get("verified")?,
    })
}

/// The broker a user belongs to, read on the caller's transaction handle.
/// Used by match acceptance to bind both agreement parties.
pub async fn user_broker_id(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> CoreResult<Option<Uuid>> {
    let row: Option<(Option<Uuid>,)> =
        sqlx::query_as("select broker_id from users where id = $1")
            .bind(user_id)
            .fetch_optional(conn)
            .await
            .context("user broker lookup failed")?;

    match row {
        Some((broker,)) => Ok(broker),
        None => Err(CoreError::not_found(format!("user {user_id}"))),
    }
}

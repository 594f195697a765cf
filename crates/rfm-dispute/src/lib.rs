//! Dispute lifecycle. Resolution side effects (agreement to `disputed`, open
//! invoices invalidated) are a storage trigger, so they hold even for writers
//! that bypass this service.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use rfm_schemas::error::is_raised_exception;
use rfm_schemas::{Actor, CoreError, CoreResult, DisputeStatus};

#[derive(Debug, Clone)]
pub struct Dispute {
    pub id: Uuid,
    pub agreement_id: Uuid,
    pub status: DisputeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

const DISPUTE_COLUMNS: &str =
    "d.id, d.agreement_id, d.status, d.created_at, d.updated_at, d.resolved_at";

#[derive(Clone)]
pub struct DisputeService {
    pool: PgPool,
}

impl DisputeService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Disputes on agreements whose referral the caller created, optionally
    /// narrowed to one agreement.
    pub async fn list(&self, owner: &Actor, agreement_id: Option<Uuid>) -> CoreResult<Vec<Dispute>> {
        let rows = match agreement_id {
            Some(aid) => {
                sqlx::query(&format!(
                    r#"
                    select {DISPUTE_COLUMNS}
                    from disputes d
                    join agreements a on a.id = d.agreement_id
                    join referral_requests r on r.id = a.request_id
                    where r.creator_user_id = $1 and d.agreement_id = $2
                    order by d.created_at desc
                    "#
                ))
                .bind(owner.user_id)
                .bind(aid)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    select {DISPUTE_COLUMNS}
                    from disputes d
                    join agreements a on a.id = d.agreement_id
                    join referral_requests r on r.id = a.request_id
                    where r.creator_user_id = $1
                    order by d.created_at desc
                    "#
                ))
                .bind(owner.user_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("dispute list failed")?;

        rows.iter().map(map_row).collect()
    }

    /// Open a dispute on an agreement the caller owns.
    pub async fn create(&self, owner: &Actor, agreement_id: Uuid) -> CoreResult<Dispute> {
        let owned: Option<(Uuid,)> = sqlx::query_as(
            r#"
            select a.id
            from agreements a
            join referral_requests r on r.id = a.request_id
            where a.id = $1 and r.creator_user_id = $2
            "#,
        )
        .bind(agreement_id)
        .bind(owner.user_id)
        .fetch_optional(&self.pool)
        .await
        .context("dispute ownership probe failed")?;

        if owned.is_none() {
            return Err(CoreError::not_found(format!("agreement {agreement_id}")));
        }

        let row = sqlx::query(
            r#"
            insert into disputes (agreement_id)
            values ($1)
            returning id, agreement_id, status, created_at, updated_at, resolved_at
            "#,
        )
        .bind(agreement_id)
        .fetch_one(&self.pool)
        .await
        .context("dispute insert failed")?;

        let dispute = map_row(&row)?;
        info!(dispute_id = %dispute.id, agreement_id = %agreement_id, "dispute opened");
        Ok(dispute)
    }

    /// Resolve a dispute. The storage trigger moves the agreement to
    /// `disputed` and invalidates its open invoices in the same transaction.
    /// Resolving an already-resolved dispute fails with InvalidState.
    pub async fn resolve(&self, owner: &Actor, dispute_id: Uuid) -> CoreResult<Dispute> {
        let mut tx = self.pool.begin().await.context("begin resolve")?;

        let row = sqlx::query(&format!(
            r#"
            select {DISPUTE_COLUMNS}
            from disputes d
            join agreements a on a.id = d.agreement_id
            join referral_requests r on r.id = a.request_id
            where d.id = $1 and r.creator_user_id = $2
            for update of d
            "#
        ))
        .bind(dispute_id)
        .bind(owner.user_id)
        .fetch_optional(&mut *tx)
        .await
        .context("dispute lock failed")?;

        let Some(row) = row else {
            return Err(CoreError::not_found(format!("dispute {dispute_id}")));
        };
        let current = map_row(&row)?;

        if current.status == DisputeStatus::Resolved {
            return Err(CoreError::invalid_state("dispute already resolved"));
        }

        rfm_db::advisory_lock_agreement(&mut tx, current.agreement_id).await?;

        let row = sqlx::query(
            r#"
            update disputes
               set status = 'resolved'
             where id = $1
            returning id, agreement_id, status, created_at, updated_at, resolved_at
            "#,
        )
        .bind(dispute_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_raised_exception(&e) {
                CoreError::invalid_state("dispute already resolved")
            } else {
                CoreError::from(e)
            }
        })?;

        let dispute = map_row(&row)?;
        tx.commit().await.context("commit resolve")?;
        info!(dispute_id = %dispute.id, agreement_id = %dispute.agreement_id, "dispute resolved");
        Ok(dispute)
    }
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub id: Uuid,
    pub agreement_id: Uuid,
    pub amount: i64,
    pub status: String,
    pub is_invalidated: bool,
}

/// Invoices for an agreement (billing readout and test support).
pub async fn list_invoices(pool: &PgPool, agreement_id: Uuid) -> CoreResult<Vec<Invoice>> {
    let rows = sqlx::query(
        r#"
        select id, agreement_id, amount, status, is_invalidated
        from invoices
        where agreement_id = $1
        order by created_at asc
        "#,
    )
    .bind(agreement_id)
    .fetch_all(pool)
    .await
    .context("invoice list failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(Invoice {
            id: row.try_get("id").context("decode invoice id")?,
            agreement_id: row.try_get("agreement_id").context("decode agreement")?,
            amount: row.try_get("amount").context("decode amount")?,
            status: row.try_get("status").context("decode status")?,
            is_invalidated: row
                .try_get("is_invalidated")
                .context("decode is_invalidated")?,
        });
    }
    Ok(out)
}

fn map_row(row: &sqlx::postgres::PgRow) -> CoreResult<Dispute> {
    Ok(Dispute {
        id: row.try_get("id").context("decode dispute id")?,
        agreement_id: row.try_get("agreement_id").context("decode agreement")?,
        status: DisputeStatus::parse(
            row.try_get::<String, _>("status")
                .context("decode status")?
                .as_str(),
        )?,
        created_at: row.try_get("created_at").context("decode created_at")?,
        updated_at: row.try_get("updated_at").context("decode updated_at")?,
        resolved_at: row.try_get("resolved_at").context("decode resolved_at")?,
    })
}

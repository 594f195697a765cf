//! Agreement lifecycle: create, list, status transitions, and idempotent
//! e-sign completion.
//!
//! Lock discipline for every mutation: transaction-level advisory lock on the
//! agreement id first, then the row lock. The timeline insert trigger takes
//! the same advisory lock, so transitions and event appends share one global
//! lock order.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use rfm_schemas::error::is_raised_exception;
use rfm_schemas::{event_types, topics, Actor, AgreementState, CoreError, CoreResult, Page};

pub mod pii;

/// Edge-ledger route that absorbs replayed e-sign completion callbacks.
pub const ESIGN_ROUTE: &str = "agreement.esign";

pub const DEFAULT_FEE_RATE: f64 = 0.25;
pub const DEFAULT_PROTECT_DAYS: i32 = 90;

#[derive(Debug, Clone)]
pub struct Agreement {
    pub id: Uuid,
    pub request_id: Uuid,
    pub from_broker_id: Uuid,
    pub to_broker_id: Uuid,
    pub region: String,
    pub state: AgreementState,
    pub effective_at: Option<DateTime<Utc>>,
    pub pii_first_access_time: Option<DateTime<Utc>>,
    pub event_seq: i64,
    pub fee_rate: f64,
    pub protect_days: i32,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
    pub status_updated_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewPiiContact {
    pub client_name: String,
    pub client_email: String,
    pub client_phone: String,
}

const AGREEMENT_COLUMNS: &str = "id, request_id, from_broker_id, to_broker_id, region, state, \
     effective_at, pii_first_access_time, event_seq, fee_rate, protect_days, \
     created_at, status_updated_at, status_updated_by";

#[derive(Clone)]
pub struct AgreementService {
    pool: PgPool,
}

impl AgreementService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a draft agreement for a referral the actor owns, optionally
    /// attaching the client PII contact. Appends `AGREEMENT_CREATED` and
    /// emits `agreement.created` in the same transaction.
    pub async fn create(
        &self,
        actor: &Actor,
        request_id: Uuid,
        from_broker_id: Uuid,
        to_broker_id: Uuid,
        fee_rate: f64,
        protect_days: i32,
        contact: Option<NewPiiContact>,
    ) -> CoreResult<Agreement> {
        if fee_rate < 0.0 {
            return Err(CoreError::validation("fee_rate must be >= 0"));
        }
        if protect_days < 0 {
            return Err(CoreError::validation("protect_days must be >= 0"));
        }
        let Some(actor_broker) = actor.broker_id else {
            return Err(CoreError::forbidden("actor has no broker"));
        };
        if actor_broker != from_broker_id && actor_broker != to_broker_id {
            return Err(CoreError::forbidden("actor broker is not a party"));
        }

        let mut tx = self.pool.begin().await.context("begin agreement create")?;

        let req = sqlx::query(
            r#"
            select creator_user_id, array_to_string(region, ',') as region
            from referral_requests
            where id = $1
            for update
            "#,
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await
        .context("lock referral failed")?;

        let Some(req) = req else {
            return Err(CoreError::not_found(format!("referral {request_id}")));
        };
        let creator: Uuid = req.try_get("creator_user_id").context("decode creator")?;
        if creator != actor.user_id {
            return Err(CoreError::forbidden("not the referral owner"));
        }
        let region: String = req.try_get("region").context("decode region")?;

        let row = sqlx::query(&format!(
            r#"
            insert into agreements
                (request_id, from_broker_id, to_broker_id, region, state, fee_rate, protect_days)
            values ($1, $2, $3, $4, 'draft', $5, $6)
            returning {AGREEMENT_COLUMNS}
            "#
        ))
        .bind(request_id)
        .bind(from_broker_id)
        .bind(to_broker_id)
        .bind(&region)
        .bind(fee_rate)
        .bind(protect_days)
        .fetch_one(&mut *tx)
        .await
        .context("insert agreement failed")?;

        let agreement = map_row(&row).context("agreement row decode failed")?;

        if let Some(contact) = contact {
            rfm_db::open_pii_gate(&mut tx).await?;
            sqlx::query(
                r#"
                insert into pii_contacts (agreement_id, client_name, client_email, client_phone)
                values ($1, $2, $3, $4)
                "#,
            )
            .bind(agreement.id)
            .bind(&contact.client_name)
            .bind(&contact.client_email)
            .bind(&contact.client_phone)
            .execute(&mut *tx)
            .await
            .context("insert pii contact failed")?;
        }

        rfm_db::set_actor_broker(&mut tx, actor_broker).await?;
        rfm_db::timeline::append_event(
            &mut tx,
            agreement.id,
            event_types::AGREEMENT_CREATED,
            json!({ "request_id": request_id, "actor_id": actor.user_id }),
            Some(actor.user_id),
        )
        .await
        .map_err(map_ledger_err)?;

        rfm_db::outbox::enqueue(
            &mut tx,
            topics::AGREEMENT_CREATED,
            topics::agreement_created(
                agreement.id,
                request_id,
                agreement.state.as_str(),
                actor.user_id,
                None,
                None,
            ),
        )
        .await?;

        tx.commit().await.context("commit agreement create")?;
        info!(agreement_id = %agreement.id, "agreement created");
        Ok(agreement)
    }

    /// Agreements whose referral was created by the caller, newest first.
    pub async fn list(&self, creator_user_id: Uuid, page: Page) -> CoreResult<(Vec<Agreement>, i64)> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            select count(*)::bigint
            from agreements a
            join referral_requests r on r.id = a.request_id
            where r.creator_user_id = $1
            "#,
        )
        .bind(creator_user_id)
        .fetch_one(&self.pool)
        .await
        .context("agreement count failed")?;

        let rows = sqlx::query(&format!(
            r#"
            select {}
            from agreements a
            join referral_requests r on r.id = a.request_id
            where r.creator_user_id = $1
            order by a.created_at desc
            limit $2 offset $3
            "#,
            qualified_columns("a")
        ))
        .bind(creator_user_id)
        .bind(page.page_size)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .context("agreement list failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_row(&row).context("agreement row decode failed")?);
        }
        Ok((out, total))
    }

    pub async fn get(&self, agreement_id: Uuid) -> CoreResult<Agreement> {
        fetch(&self.pool, agreement_id).await
    }

    /// Move an agreement to `next_state`. The storage trigger revalidates the
    /// transition; this method fails fast on the same table so the common
    /// error path never burns a round trip.
    pub async fn transition(
        &self,
        agreement_id: Uuid,
        actor: &Actor,
        next_state: AgreementState,
        payload: Option<Value>,
    ) -> CoreResult<()> {
        let Some(actor_broker) = actor.broker_id else {
            return Err(CoreError::forbidden("actor has no broker"));
        };

        let mut tx = self.pool.begin().await.context("begin transition")?;
        rfm_db::advisory_lock_agreement(&mut tx, agreement_id).await?;

        let current = lock(&mut tx, agreement_id).await?;

        if actor_broker != current.from_broker_id && actor_broker != current.to_broker_id {
            return Err(CoreError::forbidden("actor broker is not a party"));
        }
        if !current.state.can_transition_to(next_state) {
            return Err(CoreError::invalid_state(format!(
                "cannot transition {} -> {}",
                current.state.as_str(),
                next_state.as_str()
            )));
        }

        sqlx::query(
            r#"
            update agreements
               set state = $2,
                   status_updated_at = now(),
                   status_updated_by = $3
             where id = $1
            "#,
        )
        .bind(agreement_id)
        .bind(next_state.as_str())
        .bind(actor.user_id)
        .execute(&mut *tx)
        .await
        .map_err(map_transition_err)?;

        rfm_db::set_actor_broker(&mut tx, actor_broker).await?;
        let mut event_payload = json!({
            "previous": current.state.as_str(),
            "next": next_state.as_str(),
        });
        if let Some(extra) = payload {
            event_payload["detail"] = extra;
        }
        rfm_db::timeline::append_event(
            &mut tx,
            agreement_id,
            event_types::AGREEMENT_STATUS_CHANGED,
            event_payload,
            Some(actor.user_id),
        )
        .await
        .map_err(map_ledger_err)?;

        rfm_db::outbox::enqueue(
            &mut tx,
            topics::AGREEMENT_STATUS_CHANGED,
            topics::agreement_status_changed(
                agreement_id,
                current.state.as_str(),
                next_state.as_str(),
            ),
        )
        .await?;

        tx.commit().await.context("commit transition")?;
        info!(
            agreement_id = %agreement_id,
            from = current.state.as_str(),
            to = next_state.as_str(),
            "agreement transitioned"
        );
        Ok(())
    }

    /// Idempotent e-sign completion. A replayed `idempotency_key` commits
    /// nothing and reports success; the first delivery moves the agreement to
    /// `effective`, stamps `effective_at` once, appends `ESIGN_COMPLETED`,
    /// and emits `agreement.effective` (or the caller-supplied topic).
    pub async fn handle_esign_completion(
        &self,
        agreement_id: Uuid,
        idempotency_key: &str,
        actor: Option<&Actor>,
        timeline_payload: Option<Value>,
        outbox_topic: Option<&str>,
        outbox_payload: Option<Value>,
    ) -> CoreResult<()> {
        if idempotency_key.trim().is_empty() {
            return Err(CoreError::validation("idempotency_key must not be empty"));
        }

        let mut tx = self.pool.begin().await.context("begin esign")?;
        rfm_db::advisory_lock_agreement(&mut tx, agreement_id).await?;

        let registered = rfm_db::edge::try_register(&mut tx, ESIGN_ROUTE, idempotency_key).await?;
        if !registered {
            // Replay: roll back the registration attempt and report success.
            drop(tx);
            info!(agreement_id = %agreement_id, key = idempotency_key, "esign replay absorbed");
            return Ok(());
        }

        let row = sqlx::query(&format!(
            r#"
            update agreements
               set state = 'effective',
                   effective_at = coalesce(effective_at, now()),
                   status_updated_at = now()
             where id = $1
            returning {AGREEMENT_COLUMNS}
            "#
        ))
        .bind(agreement_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_transition_err)?;

        let Some(row) = row else {
            return Err(CoreError::not_found(format!("agreement {agreement_id}")));
        };
        let agreement = map_row(&row).context("agreement row decode failed")?;
        let effective_at = agreement
            .effective_at
            .context("effective agreement missing effective_at")?;

        rfm_db::edge::mark_completed(&mut tx, ESIGN_ROUTE, idempotency_key, 200).await?;

        let actor_broker = actor
            .and_then(|a| a.broker_id)
            .filter(|b| *b == agreement.from_broker_id || *b == agreement.to_broker_id)
            .unwrap_or(agreement.to_broker_id);

        rfm_db::set_actor_broker(&mut tx, actor_broker).await?;
        rfm_db::timeline::append_event(
            &mut tx,
            agreement_id,
            event_types::ESIGN_COMPLETED,
            timeline_payload.unwrap_or_else(|| json!({ "idempotency_key": idempotency_key })),
            actor.map(|a| a.user_id),
        )
        .await
        .map_err(map_ledger_err)?;

        rfm_db::outbox::enqueue(
            &mut tx,
            outbox_topic.unwrap_or(topics::AGREEMENT_EFFECTIVE),
            outbox_payload.unwrap_or_else(|| topics::agreement_effective(agreement_id, effective_at)),
        )
        .await?;

        tx.commit().await.context("commit esign")?;
        info!(agreement_id = %agreement_id, "esign completed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared with the match service
// ---------------------------------------------------------------------------

pub async fn fetch(pool: &PgPool, agreement_id: Uuid) -> CoreResult<Agreement> {
    let row = sqlx::query(&format!(
        "select {AGREEMENT_COLUMNS} from agreements where id = $1"
    ))
    .bind(agreement_id)
    .fetch_optional(pool)
    .await
    .context("agreement fetch failed")?;

    let Some(row) = row else {
        return Err(CoreError::not_found(format!("agreement {agreement_id}")));
    };
    Ok(map_row(&row).context("agreement row decode failed")?)
}

/// Lock the agreement row for update on the caller's transaction. Callers
/// take the advisory lock first.
pub async fn lock(conn: &mut PgConnection, agreement_id: Uuid) -> CoreResult<Agreement> {
    let row = sqlx::query(&format!(
        "select {AGREEMENT_COLUMNS} from agreements where id = $1 for update"
    ))
    .bind(agreement_id)
    .fetch_optional(conn)
    .await
    .context("agreement lock failed")?;

    let Some(row) = row else {
        return Err(CoreError::not_found(format!("agreement {agreement_id}")));
    };
    Ok(map_row(&row).context("agreement row decode failed")?)
}

/// The agreement occupying the active slot for a referral, if any.
pub async fn active_for_request(
    conn: &mut PgConnection,
    request_id: Uuid,
) -> CoreResult<Option<Agreement>> {
    let row = sqlx::query(&format!(
        r#"
        select {AGREEMENT_COLUMNS}
        from agreements
        where request_id = $1
          and state in ('pending_signature','effective')
        "#
    ))
    .bind(request_id)
    .fetch_optional(conn)
    .await
    .context("active agreement fetch failed")?;

    row.map(|r| map_row(&r).context("agreement row decode failed"))
        .transpose()
        .map_err(Into::into)
}

/// Insert a `pending_signature` agreement, racing on the single-active
/// partial unique index. Returns None when a concurrent writer won the slot;
/// the caller falls back to `active_for_request`.
pub async fn insert_pending(
    conn: &mut PgConnection,
    request_id: Uuid,
    from_broker_id: Uuid,
    to_broker_id: Uuid,
    region: &str,
) -> CoreResult<Option<Agreement>> {
    let row = sqlx::query(&format!(
        r#"
        insert into agreements
            (request_id, from_broker_id, to_broker_id, region, state, fee_rate, protect_days)
        values ($1, $2, $3, $4, 'pending_signature', $5, $6)
        on conflict (request_id) where state in ('pending_signature','effective')
        do nothing
        returning {AGREEMENT_COLUMNS}
        "#
    ))
    .bind(request_id)
    .bind(from_broker_id)
    .bind(to_broker_id)
    .bind(region)
    .bind(DEFAULT_FEE_RATE)
    .bind(DEFAULT_PROTECT_DAYS)
    .fetch_optional(conn)
    .await
    .context("insert pending agreement failed")?;

    row.map(|r| map_row(&r).context("agreement row decode failed"))
        .transpose()
        .map_err(Into::into)
}

fn qualified_columns(alias: &str) -> String {
    AGREEMENT_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn map_row(row: &sqlx::postgres::PgRow) -> Result<Agreement, anyhow::Error> {
    Ok(Agreement {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        from_broker_id: row.try_get("from_broker_id")?,
        to_broker_id: row.try_get("to_broker_id")?,
        region: row.try_get("region")?,
        state: AgreementState::parse(row.try_get::<String, _>("state")?.as_str())
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        effective_at: row.try_get("effective_at")?,
        pii_first_access_time: row.try_get("pii_first_access_time")?,
        event_seq: row.try_get("event_seq")?,
        fee_rate: row.try_get("fee_rate")?,
        protect_days: row.try_get("protect_days")?,
        created_at: row.try_get("created_at")?,
        status_updated_at: row.try_get("status_updated_at")?,
        status_updated_by: row.try_get("status_updated_by")?,
    })
}

/// Trigger-raised exceptions out of the state machine surface as
/// InvalidState; everything else is infrastructure.
fn map_transition_err(e: sqlx::Error) -> CoreError {
    if is_raised_exception(&e) {
        CoreError::invalid_state(
            e.as_database_error()
                .map(|d| d.message().to_string())
                .unwrap_or_else(|| "invalid transition".to_string()),
        )
    } else {
        e.into()
    }
}

/// Ledger trigger failures (missing context, non-party actor, temporal gate)
/// surface as InvalidState with the trigger's message intact.
pub(crate) fn map_ledger_err(e: sqlx::Error) -> CoreError {
    if is_raised_exception(&e) {
        CoreError::invalid_state(
            e.as_database_error()
                .map(|d| d.message().to_string())
                .unwrap_or_else(|| "timeline append refused".to_string()),
        )
    } else {
        e.into()
    }
}

//! Match lifecycle: inviting candidates and projecting an acceptance into an
//! agreement.
//!
//! Acceptance is where the single-active invariant earns its keep: the match
//! row and the referral row are locked in order, the active slot is probed,
//! and the insert races on the partial unique index with an on-conflict
//! fallback to the winner's agreement. A replayed accept returns the same
//! agreement with no new rows.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use rfm_agreement::Agreement;
use rfm_schemas::error::is_unique_violation;
use rfm_schemas::{event_types, topics, CoreError, CoreResult, MatchState};

#[derive(Debug, Clone)]
pub struct Match {
    pub id: Uuid,
    pub request_id: Uuid,
    pub candidate_user_id: Uuid,
    pub state: MatchState,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a state update: declines carry no agreement, accepts always do.
#[derive(Debug, Clone)]
pub struct MatchUpdate {
    pub match_row: Match,
    pub agreement: Option<Agreement>,
}

const MATCH_COLUMNS: &str =
    "id, request_id, candidate_user_id, state, score, created_at, updated_at";

#[derive(Clone)]
pub struct MatchService {
    pool: PgPool,
}

impl MatchService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Matches for a request the caller owns. Ownership mismatch surfaces as
    /// NotFound so non-owners cannot probe for the request's existence.
    pub async fn list(&self, request_id: Uuid, owner_id: Uuid) -> CoreResult<Vec<Match>> {
        let owned: Option<(Uuid,)> = sqlx::query_as(
            "select id from referral_requests where id = $1 and creator_user_id = $2",
        )
        .bind(request_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .context("ownership probe failed")?;

        if owned.is_none() {
            return Err(CoreError::not_found(format!("referral {request_id}")));
        }

        let rows = sqlx::query(&format!(
            r#"
            select {MATCH_COLUMNS}
            from referral_matches
            where request_id = $1
            order by created_at asc
            "#
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .context("match list failed")?;

        rows.iter().map(map_row).collect()
    }

    /// Invite a candidate. Duplicate `(request_id, candidate)` pairs fail
    /// with Conflict via the storage unique constraint.
    pub async fn create(
        &self,
        request_id: Uuid,
        owner_id: Uuid,
        candidate_user_id: Uuid,
        score: Option<f64>,
        state: Option<MatchState>,
    ) -> CoreResult<Match> {
        let score = score.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&score) {
            return Err(CoreError::validation("score must be within [0, 1]"));
        }
        let state = state.unwrap_or(MatchState::Invited);

        let owned: Option<(Uuid,)> = sqlx::query_as(
            "select id from referral_requests where id = $1 and creator_user_id = $2",
        )
        .bind(request_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .context("ownership probe failed")?;

        if owned.is_none() {
            return Err(CoreError::not_found(format!("referral {request_id}")));
        }

        let res = sqlx::query(&format!(
            r#"
            insert into referral_matches (request_id, candidate_user_id, state, score)
            values ($1, $2, $3, $4)
            returning {MATCH_COLUMNS}
            "#
        ))
        .bind(request_id)
        .bind(candidate_user_id)
        .bind(state.as_str())
        .bind(score)
        .fetch_one(&self.pool)
        .await;

        match res {
            Ok(row) => {
                let m = map_row(&row)?;
                info!(match_id = %m.id, request_id = %request_id, "match created");
                Ok(m)
            }
            Err(e) if is_unique_violation(&e, "referral_matches_request_candidate_key") => {
                Err(CoreError::conflict("candidate already invited"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The candidate's inbox: every match addressed to them, newest first.
    pub async fn list_for_candidate(&self, candidate_user_id: Uuid) -> CoreResult<Vec<Match>> {
        let rows = sqlx::query(&format!(
            r#"
            select {MATCH_COLUMNS}
            from referral_matches
            where candidate_user_id = $1
            order by created_at desc
            "#
        ))
        .bind(candidate_user_id)
        .fetch_all(&self.pool)
        .await
        .context("candidate inbox failed")?;

        rows.iter().map(map_row).collect()
    }

    /// Candidate responds to an invitation. Accepting projects the match into
    /// a `pending_signature` agreement; declining is a plain terminal update.
    pub async fn update_state(
        &self,
        match_id: Uuid,
        candidate_user_id: Uuid,
        new_state: MatchState,
    ) -> CoreResult<MatchUpdate> {
        match new_state {
            MatchState::Accepted => self.accept(match_id, candidate_user_id).await,
            MatchState::Declined => self.decline(match_id, candidate_user_id).await,
            MatchState::Invited => Err(CoreError::validation(
                "matches cannot be moved back to invited",
            )),
        }
    }

    async fn decline(&self, match_id: Uuid, candidate_user_id: Uuid) -> CoreResult<MatchUpdate> {
        let mut tx = self.pool.begin().await.context("begin decline")?;

        let current = lock_match(&mut tx, match_id).await?;
        if current.candidate_user_id != candidate_user_id {
            return Err(CoreError::forbidden("not the invited candidate"));
        }
        if current.state != MatchState::Invited {
            return Err(CoreError::invalid_state(format!(
                "cannot decline a {} match",
                current.state.as_str()
            )));
        }

        let row = sqlx::query(&format!(
            r#"
            update referral_matches
               set state = 'declined', updated_at = now()
             where id = $1
            returning {MATCH_COLUMNS}
            "#
        ))
        .bind(match_id)
        .fetch_one(&mut *tx)
        .await
        .context("decline update failed")?;

        let match_row = map_row(&row)?;
        tx.commit().await.context("commit decline")?;
        info!(match_id = %match_id, "match declined");
        Ok(MatchUpdate {
            match_row,
            agreement: None,
        })
    }

    /// The accept algorithm: lock the match, verify the candidate, fall
    /// through idempotently on replay, mark accepted, lock the referral,
    /// resolve both brokers, reuse or insert the active agreement, CAS the
    /// referral to matched, append AGREEMENT_CREATED, enqueue
    /// agreement.created.
    async fn accept(&self, match_id: Uuid, candidate_user_id: Uuid) -> CoreResult<MatchUpdate> {
        let mut tx = self.pool.begin().await.context("begin accept")?;

        let current = lock_match(&mut tx, match_id).await?;
        if current.candidate_user_id != candidate_user_id {
            return Err(CoreError::forbidden("not the invited candidate"));
        }

        if current.state == MatchState::Accepted {
            // Replay: return the agreement this acceptance produced, no new rows.
            let agreement = rfm_agreement::active_for_request(&mut tx, current.request_id).await?;
            tx.commit().await.context("commit accept replay")?;
            return Ok(MatchUpdate {
                match_row: current,
                agreement,
            });
        }
        if current.state != MatchState::Invited {
            return Err(CoreError::invalid_state(format!(
                "cannot accept a {} match",
                current.state.as_str()
            )));
        }

        let row = sqlx::query(&format!(
            r#"
            update referral_matches
               set state = 'accepted', updated_at = now()
             where id = $1
            returning {MATCH_COLUMNS}
            "#
        ))
        .bind(match_id)
        .fetch_one(&mut *tx)
        .await
        .context("accept update failed")?;
        let match_row = map_row(&row)?;

        let req = sqlx::query(
            r#"
            select creator_user_id, status, array_to_string(region, ',') as region
            from referral_requests
            where id = $1
            for update
            "#,
        )
        .bind(current.request_id)
        .fetch_one(&mut *tx)
        .await
        .context("lock referral failed")?;

        let owner_id: Uuid = req.try_get("creator_user_id").context("decode owner")?;
        let referral_status: String = req.try_get("status").context("decode status")?;
        let region: String = req.try_get("region").context("decode region")?;

        let owner_broker = rfm_broker::user_broker_id(&mut tx, owner_id)
            .await?
            .ok_or_else(|| CoreError::validation("referral owner has no broker"))?;
        let candidate_broker = rfm_broker::user_broker_id(&mut tx, candidate_user_id)
            .await?
            .ok_or_else(|| CoreError::validation("candidate has no broker"))?;

        // Single-active guard: reuse the active agreement if one exists,
        // otherwise race for the slot on the partial unique index.
        let (agreement, created) =
            match rfm_agreement::active_for_request(&mut tx, current.request_id).await? {
                Some(existing) => (existing, false),
                None => {
                    match rfm_agreement::insert_pending(
                        &mut tx,
                        current.request_id,
                        owner_broker,
                        candidate_broker,
                        &region,
                    )
                    .await?
                    {
                        Some(created) => (created, true),
                        None => {
                            // Lost the insert race; the winner's row is committed.
                            let existing = rfm_agreement::active_for_request(
                                &mut tx,
                                current.request_id,
                            )
                            .await?
                            .ok_or_else(|| {
                                CoreError::infra("active agreement vanished after conflict")
                            })?;
                            (existing, false)
                        }
                    }
                }
            };

        if referral_status == "open" {
            sqlx::query(
                r#"
                update referral_requests
                   set status = 'matched', updated_at = now()
                 where id = $1 and status = 'open'
                "#,
            )
            .bind(current.request_id)
            .execute(&mut *tx)
            .await
            .context("referral CAS to matched failed")?;
        }

        if created {
            rfm_db::set_actor_broker(&mut tx, candidate_broker).await?;
            rfm_db::timeline::append_event(
                &mut tx,
                agreement.id,
                event_types::AGREEMENT_CREATED,
                json!({
                    "match_id": match_id,
                    "request_id": current.request_id,
                    "actor_id": candidate_user_id,
                }),
                Some(candidate_user_id),
            )
            .await
            .map_err(|e| CoreError::Infrastructure(anyhow::Error::new(e)))?;

            rfm_db::outbox::enqueue(
                &mut tx,
                topics::AGREEMENT_CREATED,
                topics::agreement_created(
                    agreement.id,
                    current.request_id,
                    agreement.state.as_str(),
                    owner_id,
                    Some(candidate_user_id),
                    Some(match_id),
                ),
            )
            .await?;
        }

        tx.commit().await.context("commit accept")?;
        info!(
            match_id = %match_id,
            agreement_id = %agreement.id,
            created = created,
            "match accepted"
        );
        Ok(MatchUpdate {
            match_row,
            agreement: Some(agreement),
        })
    }
}

async fn lock_match(conn: &mut sqlx::PgConnection, match_id: Uuid) -> CoreResult<Match> {
    let row = sqlx::query(&format!(
        "select {MATCH_COLUMNS} from referral_matches where id = $1 for update"
    ))
    .bind(match_id)
    .fetch_optional(conn)
    .await
    .context("match lock failed")?;

    let Some(row) = row else {
        return Err(CoreError::not_found(format!("match {match_id}")));
    };
    map_row(&row)
}

fn map_row(row: &sqlx::postgres::PgRow) -> CoreResult<Match> {
    Ok(Match {
        id: row.try_get("id").context("decode match id")?,
        request_id: row.try_get("request_id").context("decode request_id")?,
        candidate_user_id: row
            .try_get("candidate_user_id")
            .context("decode candidate")?,
        state: MatchState::parse(
            row.try_get::<String, _>("state")
                .context("decode state")?
                .as_str(),
        )?,
        score: row.try_get("score").context("decode score")?,
        created_at: row.try_get("created_at").context("decode created_at")?,
        updated_at: row.try_get("updated_at").context("decode updated_at")?,
    })
}

//! Referral request lifecycle: create, list, cancel.
//!
//! Every mutation runs in one transaction that also enqueues its outbox
//! message, so downstream consumers never observe a referral change without
//! the matching message.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use rfm_schemas::{topics, Actor, CoreError, CoreResult, Page, ReferralStatus, Role, SortOrder};

#[derive(Debug, Clone)]
pub struct ReferralRequest {
    pub id: Uuid,
    pub creator_user_id: Uuid,
    pub region: Vec<String>,
    pub price_min: i64,
    pub price_max: i64,
    pub property_type: String,
    pub deal_type: String,
    pub languages: Vec<String>,
    pub sla_hours: i32,
    pub status: ReferralStatus,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateReferral {
    pub region: Vec<String>,
    pub price_min: i64,
    pub price_max: i64,
    pub property_type: String,
    pub deal_type: String,
    pub languages: Vec<String>,
    pub sla_hours: i32,
}

/// Enumerated list filters. Sort keys are a closed set; anything else is a
/// validation error, never interpolated SQL.
#[derive(Debug, Clone, Default)]
pub struct ReferralFilters {
    pub creator_user_id: Option<Uuid>,
    pub status: Option<ReferralStatus>,
    pub region: Option<Vec<String>>,
    pub deal_type: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub sort_key: Option<ReferralSortKey>,
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralSortKey {
    CreatedAt,
    UpdatedAt,
    PriceMin,
    PriceMax,
    SlaHours,
    Status,
}

impl ReferralSortKey {
    pub fn as_column(&self) -> &'static str {
        match self {
            ReferralSortKey::CreatedAt => "created_at",
            ReferralSortKey::UpdatedAt => "updated_at",
            ReferralSortKey::PriceMin => "price_min",
            ReferralSortKey::PriceMax => "price_max",
            ReferralSortKey::SlaHours => "sla_hours",
            ReferralSortKey::Status => "status",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "createdAt" => Ok(ReferralSortKey::CreatedAt),
            "updatedAt" => Ok(ReferralSortKey::UpdatedAt),
            "priceMin" => Ok(ReferralSortKey::PriceMin),
            "priceMax" => Ok(ReferralSortKey::PriceMax),
            "slaHours" => Ok(ReferralSortKey::SlaHours),
            "status" => Ok(ReferralSortKey::Status),
            other => Err(CoreError::validation(format!("invalid sort key: {other}"))),
        }
    }
}

#[derive(Clone)]
pub struct ReferralService {
    pool: PgPool,
}

impl ReferralService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a referral request in `open` and emit `referral.created`.
    pub async fn create(&self, actor: &Actor, input: CreateReferral) -> CoreResult<ReferralRequest> {
        if !actor.role.can_manage_referrals() {
            return Err(CoreError::forbidden("role cannot create referrals"));
        }
        if input.region.is_empty() {
            return Err(CoreError::validation("region must not be empty"));
        }
        if input.price_min <= 0 {
            return Err(CoreError::validation("price_min must be positive"));
        }
        if input.price_max <= input.price_min {
            return Err(CoreError::validation("price_max must exceed price_min"));
        }
        if input.sla_hours <= 0 {
            return Err(CoreError::validation("sla_hours must be positive"));
        }

        let mut tx = self.pool.begin().await.context("begin create referral")?;

        let row = sqlx::query(
            r#"
            insert into referral_requests
                (creator_user_id, region, price_min, price_max, property_type,
                 deal_type, languages, sla_hours)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            returning id, creator_user_id, region, price_min, price_max,
                      property_type, deal_type, languages, sla_hours, status,
                      cancel_reason, created_at, updated_at
            "#,
        )
        .bind(actor.user_id)
        .bind(&input.region)
        .bind(input.price_min)
        .bind(input.price_max)
        .bind(&input.property_type)
        .bind(&input.deal_type)
        .bind(&input.languages)
        .bind(input.sla_hours)
        .fetch_one(&mut *tx)
        .await
        .context("insert referral failed")?;

        let referral = map_row(&row).context("referral row decode failed")?;

        rfm_db::outbox::enqueue(
            &mut tx,
            topics::REFERRAL_CREATED,
            topics::referral_created(referral.id, referral.status.as_str()),
        )
        .await?;

        tx.commit().await.context("commit create referral")?;
        info!(referral_id = %referral.id, "referral created");
        Ok(referral)
    }

    /// List with enumerated filters, paging, and whitelisted sorting.
    pub async fn list(&self, filters: &ReferralFilters) -> CoreResult<(Vec<ReferralRequest>, i64)> {
        let page = Page::clamped(filters.page, filters.page_size);
        let sort_key = filters.sort_key.unwrap_or(ReferralSortKey::CreatedAt);
        let sort_order = filters.sort_order.unwrap_or(SortOrder::Desc);

        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("select count(*)::bigint from referral_requests where true");
        push_filters(&mut count_qb, filters);
        let (total,): (i64,) = count_qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .context("referral count failed")?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "select id, creator_user_id, region, price_min, price_max, \
             property_type, deal_type, languages, sla_hours, status, \
             cancel_reason, created_at, updated_at \
             from referral_requests where true",
        );
        push_filters(&mut qb, filters);
        qb.push(format!(
            " order by {} {} limit ",
            sort_key.as_column(),
            sort_order.as_sql()
        ));
        qb.push_bind(page.page_size);
        qb.push(" offset ");
        qb.push_bind(page.offset());

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("referral list failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_row(&row).context("referral row decode failed")?);
        }
        Ok((out, total))
    }

    pub async fn get(&self, request_id: Uuid) -> CoreResult<ReferralRequest> {
        let row = sqlx::query(
            r#"
            select id, creator_user_id, region, price_min, price_max,
                   property_type, deal_type, languages, sla_hours, status,
                   cancel_reason, created_at, updated_at
            from referral_requests
            where id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .context("referral get failed")?;

        let Some(row) = row else {
            return Err(CoreError::not_found(format!("referral {request_id}")));
        };
        Ok(map_row(&row).context("referral row decode failed")?)
    }

    /// Cancel an open or matched referral and emit `referral.cancelled`.
    pub async fn cancel(
        &self,
        request_id: Uuid,
        actor: &Actor,
        reason: Option<&str>,
    ) -> CoreResult<ReferralRequest> {
        if !actor.role.can_manage_referrals() {
            return Err(CoreError::forbidden("role cannot cancel referrals"));
        }

        let mut tx = self.pool.begin().await.context("begin cancel referral")?;

        let row = sqlx::query(
            r#"
            select creator_user_id, status
            from referral_requests
            where id = $1
            for update
            "#,
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await
        .context("lock referral failed")?;

        let Some(row) = row else {
            return Err(CoreError::not_found(format!("referral {request_id}")));
        };

        let creator: Uuid = row.try_get("creator_user_id").context("decode creator")?;
        let status = ReferralStatus::parse(row.try_get::<String, _>("status").context("decode status")?.as_str())?;

        if actor.role != Role::BrokerAdmin && creator != actor.user_id {
            return Err(CoreError::forbidden("not the referral owner"));
        }
        if !status.cancellable() {
            return Err(CoreError::invalid_state(format!(
                "invalid state: cannot cancel a {} referral",
                status.as_str()
            )));
        }

        let reason = reason.map(str::trim).filter(|r| !r.is_empty());

        let row = sqlx::query(
            r#"
            update referral_requests
               set status = 'cancelled',
                   cancel_reason = $2,
                   updated_at = now()
             where id = $1
            returning id, creator_user_id, region, price_min, price_max,
                      property_type, deal_type, languages, sla_hours, status,
                      cancel_reason, created_at, updated_at
            "#,
        )
        .bind(request_id)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await
        .context("cancel referral update failed")?;

        let referral = map_row(&row).context("referral row decode failed")?;

        rfm_db::outbox::enqueue(
            &mut tx,
            topics::REFERRAL_CANCELLED,
            topics::referral_cancelled(referral.id, referral.status.as_str(), reason),
        )
        .await?;

        tx.commit().await.context("commit cancel referral")?;
        info!(referral_id = %referral.id, "referral cancelled");
        Ok(referral)
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &ReferralFilters) {
    if let Some(creator) = filters.creator_user_id {
        qb.push(" and creator_user_id = ");
        qb.push_bind(creator);
    }
    if let Some(status) = filters.status {
        qb.push(" and status = ");
        qb.push_bind(status.as_str());
    }
    if let Some(region) = &filters.region {
        // Set overlap; served by the GIN index.
        qb.push(" and region && ");
        qb.push_bind(region.clone());
    }
    if let Some(deal_type) = &filters.deal_type {
        qb.push(" and deal_type = ");
        qb.push_bind(deal_type.clone());
    }
}

fn map_row(row: &sqlx::postgres::PgRow) -> Result<ReferralRequest, anyhow::Error> {
    Ok(ReferralRequest {
        id: row.try_get("id")?,
        creator_user_id: row.try_get("creator_user_id")?,
        region: row.try_get("region")?,
        price_min: row.try_get("price_min")?,
        price_max: row.try_get("price_max")?,
        property_type: row.try_get("property_type")?,
        deal_type: row.try_get("deal_type")?,
        languages: row.try_get("languages")?,
        sla_hours: row.try_get("sla_hours")?,
        status: ReferralStatus::parse(row.try_get::<String, _>("status")?.as_str())
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        cancel_reason: row.try_get("cancel_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_keys_parse_from_api_names() {
        assert_eq!(
            ReferralSortKey::parse("createdAt").unwrap().as_column(),
            "created_at"
        );
        assert_eq!(
            ReferralSortKey::parse("slaHours").unwrap().as_column(),
            "sla_hours"
        );
        assert!(ReferralSortKey::parse("created_at").is_err());
        assert!(ReferralSortKey::parse("id; drop table users").is_err());
    }
}

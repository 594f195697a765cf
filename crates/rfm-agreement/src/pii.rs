//! Gated PII accessor.
//!
//! The only read path for client contact details. Row security denies every
//! other read; this accessor checks the agreement gate, stamps the first
//! access time, writes the audit row, and only then opens the
//! transaction-local policy gate to fetch the contact.

use anyhow::Context;
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use rfm_schemas::{audit_actions, Actor, AgreementState, CoreError, CoreResult, PiiContactView};

/// Tag recorded in every PII_READ audit row so readers can be distinguished
/// from future export/batch paths.
const ACCESS_SOURCE: &str = "gated_accessor";

#[derive(Clone)]
pub struct PiiAccessor {
    pool: PgPool,
}

impl PiiAccessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read the client contact for an agreement.
    ///
    /// Succeeds only while the agreement is `effective` and `tx_now()` has
    /// reached `effective_at`. The first successful read stamps
    /// `pii_first_access_time`; every successful read appends a `PII_READ`
    /// audit row. Returns only the contact fields, never row identifiers.
    pub async fn get_pii_contact(
        &self,
        agreement_id: Uuid,
        actor: &Actor,
    ) -> CoreResult<PiiContactView> {
        let mut tx = self.pool.begin().await.context("begin pii read")?;
        rfm_db::advisory_lock_agreement(&mut tx, agreement_id).await?;

        let agreement = crate::lock(&mut tx, agreement_id).await?;

        let now = rfm_db::tx_now(&mut tx).await?;
        let gate_open = agreement.state == AgreementState::Effective
            && agreement.effective_at.map(|t| now >= t).unwrap_or(false);
        if !gate_open {
            return Err(CoreError::forbidden(format!(
                "pii access requires an effective agreement (state is {})",
                agreement.state.as_str()
            )));
        }

        // Monotonic: set once, never moved afterwards.
        sqlx::query(
            r#"
            update agreements
               set pii_first_access_time = coalesce(pii_first_access_time, now())
             where id = $1
            "#,
        )
        .bind(agreement_id)
        .execute(&mut *tx)
        .await
        .context("stamp pii first access failed")?;

        rfm_db::audit::append(
            &mut tx,
            Some(agreement_id),
            Some(actor.user_id),
            audit_actions::PII_READ,
            json!({ "source": ACCESS_SOURCE }),
        )
        .await?;

        rfm_db::open_pii_gate(&mut tx).await?;
        let row = sqlx::query(
            r#"
            select client_name, client_phone, client_email
            from pii_contacts
            where agreement_id = $1
            "#,
        )
        .bind(agreement_id)
        .fetch_optional(&mut *tx)
        .await
        .context("gated pii read failed")?;

        let Some(row) = row else {
            return Err(CoreError::not_found(format!(
                "pii contact for agreement {agreement_id}"
            )));
        };

        let view = PiiContactView {
            client_name: row.try_get("client_name").context("decode client_name")?,
            client_phone: row.try_get("client_phone").context("decode client_phone")?,
            client_email: row.try_get("client_email").context("decode client_email")?,
        };

        tx.commit().await.context("commit pii read")?;
        info!(agreement_id = %agreement_id, actor_id = %actor.user_id, "pii contact read");
        Ok(view)
    }
}

//! Postgres access layer: pool bootstrap, embedded migrations, the
//! transaction-time oracle, and the session-scoped context helpers every
//! writer shares.
//!
//! Ledger operations live in submodules; entity services compose them on a
//! single transaction handle so business mutation, timeline append, and
//! outbox enqueue commit or roll back together.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

pub mod audit;
pub mod edge;
pub mod outbox;
pub mod timeline;

pub use rfm_config::ENV_DATABASE_URL;

/// Connect to Postgres using `DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DATABASE_URL)
        .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?;
    connect(&url).await
}

/// Connect to Postgres at the given url.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='agreements'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_agreements_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_agreements_table: bool,
}

/// The single source of time inside a transaction. Postgres `now()` is pinned
/// to the transaction start, so every writer in the same transaction observes
/// the same instant and competing actors cannot drift on wall clocks.
pub async fn tx_now(conn: &mut PgConnection) -> Result<DateTime<Utc>> {
    let (now,): (DateTime<Utc>,) = sqlx::query_as("select now()")
        .fetch_one(conn)
        .await
        .context("tx_now query failed")?;
    Ok(now)
}

/// Set the transaction-local actor-broker context required by the timeline
/// ledger. `set_config(..., true)` scopes the value to the enclosing
/// transaction; it resets on commit or rollback, so no writer can leak its
/// identity into another request's session.
pub async fn set_actor_broker(conn: &mut PgConnection, broker_id: Uuid) -> Result<()> {
    sqlx::query("select set_config('app.actor_broker_id', $1, true)")
        .bind(broker_id.to_string())
        .execute(conn)
        .await
        .context("set actor broker context failed")?;
    Ok(())
}

/// Open the PII gate for the enclosing transaction. Only the gated accessor
/// and the agreement-create contact insert call this; everything else sees
/// zero rows through the deny-all row security policy.
pub async fn open_pii_gate(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("select set_config('app.pii_gate', 'on', true)")
        .execute(conn)
        .await
        .context("open pii gate failed")?;
    Ok(())
}

/// Transaction-level advisory lock keyed by the agreement id. Every writer
/// that will lock the agreement row takes this first, which fixes a global
/// lock order (advisory, then row) shared with the timeline insert trigger
/// and removes the transition/append deadlock.
pub async fn advisory_lock_agreement(conn: &mut PgConnection, agreement_id: Uuid) -> Result<()> {
    sqlx::query("select pg_advisory_xact_lock(hashtext($1))")
        .bind(agreement_id.to_string())
        .execute(conn)
        .await
        .context("advisory lock failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // Connection-level behavior is covered by the scenario tests under
    // tests/, which require a live DATABASE_URL.
}

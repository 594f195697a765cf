//! Outbox worker and edge adapter.
//!
//! The worker wakes on the `outbox_new` notify channel (with an interval
//! fallback, since notifications are lossy across connection churn), locks a
//! pending batch with SKIP LOCKED, and hands each row to the caller-supplied
//! handler. Delivery is at-least-once; consumers must be idempotent, which is
//! what the edge adapter provides for external side effects.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use rfm_db::outbox::{self, OutboxRow, NOTIFY_CHANNEL};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Rows locked per drain transaction.
    pub batch_size: i64,
    /// Fallback poll interval when no notification arrives.
    pub poll_interval: Duration,
    /// Retry budget before a row is parked as dead.
    pub max_attempts: i32,
    /// Worker identity for logs.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            poll_interval: Duration::from_millis(500),
            max_attempts: rfm_config::DEFAULT_OUTBOX_MAX_ATTEMPTS,
            worker_id: "outbox-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed_attempts: u64,
    pub dead: u64,
}

/// Run the worker until the shutdown signal flips. The handler receives an
/// owned row and reports delivery success or failure; failures bump the
/// attempt counter and the row retries until the budget is spent.
pub async fn run_worker<F, Fut>(
    pool: PgPool,
    mut shutdown: watch::Receiver<bool>,
    config: WorkerConfig,
    mut handler: F,
) -> Result<WorkerStats>
where
    F: FnMut(OutboxRow) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut listener = PgListener::connect_with(&pool)
        .await
        .context("outbox listener connect failed")?;
    listener
        .listen(NOTIFY_CHANNEL)
        .await
        .context("outbox listen failed")?;

    let mut stats = WorkerStats::default();
    info!(worker = %config.worker_id, "outbox worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match drain_once(&pool, &config, &mut handler, &mut stats).await {
            Ok(drained) if drained > 0 => {
                // More work may be queued behind the batch; skip the wait.
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                // Connection churn (e.g. a terminated backend) is survivable;
                // back off one interval and retry.
                warn!(worker = %config.worker_id, error = %e, "outbox drain failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            res = listener.recv() => {
                if let Err(e) = res {
                    warn!(worker = %config.worker_id, error = %e, "outbox notify lost; reconnecting");
                    // recv() errors when the backing connection died; the
                    // listener reconnects lazily on the next call.
                    tokio::time::sleep(config.poll_interval).await;
                }
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    info!(
        worker = %config.worker_id,
        processed = stats.processed,
        dead = stats.dead,
        "outbox worker stopped"
    );
    Ok(stats)
}

/// Drain one locked batch inside a single transaction. Returns the number of
/// rows handled.
async fn drain_once<F, Fut>(
    pool: &PgPool,
    config: &WorkerConfig,
    handler: &mut F,
    stats: &mut WorkerStats,
) -> Result<usize>
where
    F: FnMut(OutboxRow) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut tx = pool.begin().await.context("begin outbox drain")?;
    let rows = outbox::lock_pending_batch(&mut tx, config.batch_size).await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let drained = rows.len();
    for row in rows {
        let id = row.id;
        let attempts = row.attempts;
        match handler(row).await {
            Ok(()) => {
                outbox::mark_processed(&mut tx, id).await?;
                stats.processed += 1;
            }
            Err(e) => {
                outbox::mark_attempt_failed(&mut tx, id, config.max_attempts).await?;
                stats.failed_attempts += 1;
                if attempts + 1 >= config.max_attempts {
                    stats.dead += 1;
                    warn!(outbox_id = id, error = %e, "outbox row parked as dead");
                } else {
                    warn!(outbox_id = id, attempt = attempts + 1, error = %e, "outbox delivery failed");
                }
            }
        }
    }

    tx.commit().await.context("commit outbox drain")?;
    Ok(drained)
}

// ---------------------------------------------------------------------------
// Edge adapter
// ---------------------------------------------------------------------------

/// Outcome of an idempotent edge invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// This caller registered the pair and performed the side effect.
    Performed { response_code: i32 },
    /// Another invocation already owns the pair; the side effect was skipped.
    Skipped,
}

/// Perform an external side effect at most once per `(route, key)`.
///
/// The registration commits before the effect runs, so a crash mid-effect
/// leaves a `pending` registration that blocks re-execution rather than
/// risking a duplicate external call; operators resolve those by hand.
pub async fn invoke_edge<F, Fut>(
    pool: &PgPool,
    route: &str,
    key: &str,
    effect: F,
) -> Result<EdgeOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<i32>>,
{
    let mut conn = pool.acquire().await.context("edge acquire failed")?;

    if !rfm_db::edge::try_register(&mut conn, route, key).await? {
        return Ok(EdgeOutcome::Skipped);
    }

    match effect().await {
        Ok(code) => {
            rfm_db::edge::mark_completed(&mut conn, route, key, code).await?;
            Ok(EdgeOutcome::Performed {
                response_code: code,
            })
        }
        Err(e) => {
            rfm_db::edge::mark_failed(&mut conn, route, key, &e.to_string()).await?;
            Err(e.context(format!("edge effect failed for {route}/{key}")))
        }
    }
}

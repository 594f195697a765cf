//! Stress actors. Each runs its own loop over the shared pool, tolerates
//! infrastructure errors (the chaos actor terminates backends on purpose),
//! and reports its counters when the shutdown signal flips.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use rfm_agreement::pii::PiiAccessor;
use rfm_agreement::AgreementService;
use rfm_dispute::DisputeService;
use rfm_schemas::error::is_any_unique_violation;
use rfm_schemas::{Actor, CoreError, Role};

use crate::{StressReport, StressWorld};

/// Sleep `ms` or until shutdown. Returns true when the actor should stop.
async fn pause(shutdown: &mut watch::Receiver<bool>, ms: u64) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
    }
    *shutdown.borrow()
}

fn owner_actor(world: &StressWorld) -> Actor {
    Actor::new(world.owner_user_id, Role::Agent, Some(world.owner_broker_id))
}

/// Repeatedly races for the single-active slot with a direct
/// `pending_signature` insert. Collisions on the partial unique index are the
/// expected outcome and are counted, not raised.
pub async fn creator(
    pool: PgPool,
    world: StressWorld,
    mut shutdown: watch::Receiver<bool>,
    seed: u64,
) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();

    loop {
        if pause(&mut shutdown, rng.gen_range(20..120)).await {
            break;
        }

        let result: anyhow::Result<()> = async {
            let mut tx = pool.begin().await?;
            let (agreement_id,): (Uuid,) = sqlx::query_as(
                r#"
                insert into agreements
                    (request_id, from_broker_id, to_broker_id, region, state)
                values ($1, $2, $3, 'stress', 'pending_signature')
                returning id
                "#,
            )
            .bind(world.referral_id)
            .bind(world.owner_broker_id)
            .bind(world.candidate_broker_id)
            .fetch_one(&mut *tx)
            .await?;

            rfm_db::open_pii_gate(&mut tx).await?;
            sqlx::query(
                r#"
                insert into pii_contacts (agreement_id, client_name, client_email, client_phone)
                values ($1, 'Stress Client', 'stress@client.test', '+1-555-0199')
                "#,
            )
            .bind(agreement_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => report.agreements_created += 1,
            Err(e) => {
                let unique = e
                    .downcast_ref::<sqlx::Error>()
                    .map(is_any_unique_violation)
                    .unwrap_or(false);
                if unique {
                    report.unique_violations += 1;
                } else {
                    debug!(error = %e, "creator insert failed");
                    report.infra_errors += 1;
                }
            }
        }
    }

    report
}

/// Picks a pending agreement and drives it to effective through the
/// idempotent e-sign path; concurrent signers of the same agreement are
/// absorbed by the idempotency key.
pub async fn signer(
    pool: PgPool,
    world: StressWorld,
    mut shutdown: watch::Receiver<bool>,
    seed: u64,
) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();
    let service = AgreementService::new(pool.clone());
    let actor = owner_actor(&world);

    loop {
        if pause(&mut shutdown, rng.gen_range(30..150)).await {
            break;
        }

        let pending: Result<Option<(Uuid,)>, sqlx::Error> = sqlx::query_as(
            r#"
            select id from agreements
            where request_id = $1 and state = 'pending_signature'
            limit 1
            "#,
        )
        .bind(world.referral_id)
        .fetch_optional(&pool)
        .await;

        let agreement_id = match pending {
            Ok(Some((id,))) => id,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "signer scan failed");
                report.infra_errors += 1;
                continue;
            }
        };

        match service
            .handle_esign_completion(
                agreement_id,
                &format!("esign-{agreement_id}"),
                Some(&actor),
                None,
                None,
                None,
            )
            .await
        {
            Ok(()) => report.esign_completed += 1,
            Err(CoreError::InvalidState(_)) | Err(CoreError::NotFound(_)) => {
                // Lost the race to another signer or a disputer; expected.
            }
            Err(e) => {
                debug!(error = %e, "signer esign failed");
                report.infra_errors += 1;
            }
        }
    }

    report
}

/// Alternates a direct PII table read (must come back empty through the
/// deny-all policy) with the gated accessor.
pub async fn pii_reader(
    pool: PgPool,
    world: StressWorld,
    mut shutdown: watch::Receiver<bool>,
    seed: u64,
) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();
    let accessor = PiiAccessor::new(pool.clone());
    let actor = owner_actor(&world);

    // Superusers bypass row security even under FORCE; the direct-read
    // assertion only means something for ordinary roles.
    let superuser: bool = sqlx::query_as::<_, (bool,)>(
        "select coalesce((select usesuper from pg_user where usename = current_user), false)",
    )
    .fetch_one(&pool)
    .await
    .map(|(b,)| b)
    .unwrap_or(false);

    loop {
        if pause(&mut shutdown, rng.gen_range(40..160)).await {
            break;
        }

        if !superuser {
            match sqlx::query_as::<_, (i64,)>("select count(*)::bigint from pii_contacts")
                .fetch_one(&pool)
                .await
            {
                Ok((n,)) => {
                    if n > 0 {
                        warn!(rows = n, "direct pii read saw rows through RLS");
                        report.pii_direct_rows_seen += n as u64;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "direct pii read failed");
                    report.infra_errors += 1;
                }
            }
        }

        let effective: Option<(Uuid,)> = sqlx::query_as(
            r#"
            select id from agreements
            where request_id = $1 and state = 'effective'
            limit 1
            "#,
        )
        .bind(world.referral_id)
        .fetch_optional(&pool)
        .await
        .ok()
        .flatten();

        if let Some((agreement_id,)) = effective {
            match accessor.get_pii_contact(agreement_id, &actor).await {
                Ok(_) => report.pii_gated_reads += 1,
                Err(CoreError::Forbidden(_)) | Err(CoreError::NotFound(_)) => {
                    // The agreement moved on between scan and read; expected.
                }
                Err(e) => {
                    debug!(error = %e, "gated pii read failed");
                    report.infra_errors += 1;
                }
            }
        }
    }

    report
}

/// Appends random temporal-gated events; rejections are the temporal gate
/// working and are counted separately from infrastructure noise.
pub async fn event_writer(
    pool: PgPool,
    world: StressWorld,
    mut shutdown: watch::Receiver<bool>,
    seed: u64,
) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();

    loop {
        if pause(&mut shutdown, rng.gen_range(30..140)).await {
            break;
        }

        let target: Option<(Uuid,)> = sqlx::query_as(
            "select id from agreements where request_id = $1 order by created_at desc limit 1",
        )
        .bind(world.referral_id)
        .fetch_optional(&pool)
        .await
        .ok()
        .flatten();

        let Some((agreement_id,)) = target else {
            continue;
        };

        let event_type = if rng.gen_bool(0.5) {
            rfm_schemas::event_types::OFFER_MADE
        } else {
            rfm_schemas::event_types::DEAL_CLOSED
        };
        let broker = if rng.gen_bool(0.5) {
            world.owner_broker_id
        } else {
            world.candidate_broker_id
        };

        let result: anyhow::Result<()> = async {
            let mut tx = pool.begin().await?;
            rfm_db::set_actor_broker(&mut tx, broker).await?;
            rfm_db::timeline::append_event(
                &mut tx,
                agreement_id,
                event_type,
                serde_json::json!({ "source": "stress" }),
                Some(world.owner_user_id),
            )
            .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => report.events_appended += 1,
            Err(e) => {
                let rejected = e
                    .downcast_ref::<sqlx::Error>()
                    .map(rfm_schemas::error::is_raised_exception)
                    .unwrap_or(false);
                if rejected {
                    report.events_rejected += 1;
                } else {
                    debug!(error = %e, "event append failed");
                    report.infra_errors += 1;
                }
            }
        }
    }

    report
}

/// Drains the outbox with a deliberately flaky handler to exercise the retry
/// budget and the dead-parking path.
pub async fn outbox_worker(
    pool: PgPool,
    shutdown: watch::Receiver<bool>,
    seed: u64,
) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();

    let config = rfm_outbox::WorkerConfig {
        worker_id: format!("stress-worker-{seed}"),
        ..Default::default()
    };

    let result = rfm_outbox::run_worker(pool, shutdown, config, move |row| {
        let flaky = rng.gen_bool(0.3);
        async move {
            if flaky {
                anyhow::bail!("injected delivery failure for outbox {}", row.id);
            }
            Ok(())
        }
    })
    .await;

    match result {
        Ok(stats) => {
            report.outbox_processed = stats.processed;
            report.outbox_dead = stats.dead;
        }
        Err(e) => {
            warn!(error = %e, "outbox worker crashed");
            report.infra_errors += 1;
        }
    }

    report
}

/// Registers (route, key) pairs from a small keyspace and completes them;
/// repeats on the same key must skip.
pub async fn edge_adapter(
    pool: PgPool,
    mut shutdown: watch::Receiver<bool>,
    seed: u64,
) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();

    loop {
        if pause(&mut shutdown, rng.gen_range(20..100)).await {
            break;
        }

        let key = format!("k{}", rng.gen_range(0..64));
        match rfm_outbox::invoke_edge(&pool, "stress.edge", &key, || async { Ok(200) }).await {
            Ok(rfm_outbox::EdgeOutcome::Performed { .. }) => report.edge_performed += 1,
            Ok(rfm_outbox::EdgeOutcome::Skipped) => report.edge_skipped += 1,
            Err(e) => {
                debug!(error = %e, "edge invoke failed");
                report.infra_errors += 1;
            }
        }
    }

    report
}

/// Opens and resolves disputes against effective agreements, exercising the
/// resolution cascade.
pub async fn disputer(
    pool: PgPool,
    world: StressWorld,
    mut shutdown: watch::Receiver<bool>,
    seed: u64,
) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();
    let service = DisputeService::new(pool.clone());
    let actor = owner_actor(&world);

    loop {
        if pause(&mut shutdown, rng.gen_range(200..600)).await {
            break;
        }

        let effective: Option<(Uuid,)> = sqlx::query_as(
            r#"
            select id from agreements
            where request_id = $1 and state = 'effective'
            limit 1
            "#,
        )
        .bind(world.referral_id)
        .fetch_optional(&pool)
        .await
        .ok()
        .flatten();

        let Some((agreement_id,)) = effective else {
            continue;
        };

        let outcome: Result<(), CoreError> = async {
            let dispute = service.create(&actor, agreement_id).await?;
            service.resolve(&actor, dispute.id).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => report.disputes_resolved += 1,
            Err(CoreError::InvalidState(_)) | Err(CoreError::NotFound(_)) => {}
            Err(e) => {
                debug!(error = %e, "dispute cycle failed");
                report.infra_errors += 1;
            }
        }
    }

    report
}

/// Terminates a random backend of the test database at random intervals.
pub async fn chaos(pool: PgPool, mut shutdown: watch::Receiver<bool>, seed: u64) -> StressReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = StressReport::default();

    loop {
        if pause(&mut shutdown, rng.gen_range(3000..8000)).await {
            break;
        }

        let killed: Result<Option<(bool,)>, sqlx::Error> = sqlx::query_as(
            r#"
            select pg_terminate_backend(pid)
            from pg_stat_activity
            where datname = current_database()
              and pid <> pg_backend_pid()
              and backend_type = 'client backend'
            order by random()
            limit 1
            "#,
        )
        .fetch_optional(&pool)
        .await;

        match killed {
            Ok(Some((true,))) => report.chaos_kills += 1,
            Ok(_) => {}
            Err(e) => debug!(error = %e, "chaos kill failed"),
        }
    }

    report
}

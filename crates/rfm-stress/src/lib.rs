//! Concurrency stress harness.
//!
//! Spawns competing actors against one shared referral for a bounded
//! duration while a chaos task terminates random backends and an oracle
//! sampler re-verifies the storage invariants every two seconds. Replay is
//! deterministic from `{seed, duration, concurrency}`: every actor derives
//! its RNG from the seed plus its index.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod actors;
pub mod oracles;

use oracles::OracleFailure;

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub dsn: String,
    pub duration: Duration,
    /// Creator/signer count; the remaining actor kinds run one instance each.
    pub concurrency: usize,
    pub seed: u64,
}

impl StressConfig {
    pub fn new(dsn: String) -> Self {
        Self {
            dsn,
            duration: Duration::from_secs(90),
            concurrency: 8,
            seed: 42,
        }
    }

    /// The replay tuple printed on any oracle failure.
    pub fn replay_tuple(&self) -> String {
        format!(
            "{{seed: {}, duration: {}s, concurrency: {}}}",
            self.seed,
            self.duration.as_secs(),
            self.concurrency
        )
    }
}

/// The shared world every actor operates on.
#[derive(Debug, Clone)]
pub struct StressWorld {
    pub owner_broker_id: Uuid,
    pub candidate_broker_id: Uuid,
    pub owner_user_id: Uuid,
    pub candidate_user_id: Uuid,
    pub referral_id: Uuid,
}

#[derive(Debug, Default, Clone)]
pub struct StressReport {
    pub agreements_created: u64,
    pub unique_violations: u64,
    pub esign_completed: u64,
    pub events_appended: u64,
    pub events_rejected: u64,
    pub outbox_processed: u64,
    pub outbox_dead: u64,
    pub edge_performed: u64,
    pub edge_skipped: u64,
    pub disputes_resolved: u64,
    pub pii_gated_reads: u64,
    pub pii_direct_rows_seen: u64,
    pub chaos_kills: u64,
    pub infra_errors: u64,
    pub oracle_failures: Vec<OracleFailure>,
}

impl StressReport {
    fn absorb(&mut self, other: StressReport) {
        self.agreements_created += other.agreements_created;
        self.unique_violations += other.unique_violations;
        self.esign_completed += other.esign_completed;
        self.events_appended += other.events_appended;
        self.events_rejected += other.events_rejected;
        self.outbox_processed += other.outbox_processed;
        self.outbox_dead += other.outbox_dead;
        self.edge_performed += other.edge_performed;
        self.edge_skipped += other.edge_skipped;
        self.disputes_resolved += other.disputes_resolved;
        self.pii_gated_reads += other.pii_gated_reads;
        self.pii_direct_rows_seen += other.pii_direct_rows_seen;
        self.chaos_kills += other.chaos_kills;
        self.infra_errors += other.infra_errors;
        self.oracle_failures.extend(other.oracle_failures);
    }

    pub fn invariants_held(&self) -> bool {
        self.oracle_failures.is_empty() && self.pii_direct_rows_seen == 0
    }
}

/// Seed the shared world: two brokers, an owner and a candidate agent, and
/// one referral everybody fights over.
pub async fn seed_world(pool: &PgPool) -> Result<StressWorld> {
    let tag = Uuid::new_v4().simple().to_string()[..10].to_string();

    let (owner_broker_id,): (Uuid,) = sqlx::query_as(
        "insert into brokers (name, fein, verified) values ($1, $2, true) returning id",
    )
    .bind(format!("stress-owner-{tag}"))
    .bind(format!("stress-fein-a-{tag}"))
    .fetch_one(pool)
    .await
    .context("seed owner broker")?;

    let (candidate_broker_id,): (Uuid,) = sqlx::query_as(
        "insert into brokers (name, fein, verified) values ($1, $2, true) returning id",
    )
    .bind(format!("stress-candidate-{tag}"))
    .bind(format!("stress-fein-b-{tag}"))
    .fetch_one(pool)
    .await
    .context("seed candidate broker")?;

    let (owner_user_id,): (Uuid,) = sqlx::query_as(
        "insert into users (email, role, broker_id) values ($1, 'agent', $2) returning id",
    )
    .bind(format!("stress-owner-{tag}@example.test"))
    .bind(owner_broker_id)
    .fetch_one(pool)
    .await
    .context("seed owner user")?;

    let (candidate_user_id,): (Uuid,) = sqlx::query_as(
        "insert into users (email, role, broker_id) values ($1, 'agent', $2) returning id",
    )
    .bind(format!("stress-candidate-{tag}@example.test"))
    .bind(candidate_broker_id)
    .fetch_one(pool)
    .await
    .context("seed candidate user")?;

    let (referral_id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into referral_requests
            (creator_user_id, region, price_min, price_max, property_type,
             deal_type, languages, sla_hours)
        values ($1, '{stress}', 100000, 900000, 'condo', 'sale', '{en}', 24)
        returning id
        "#,
    )
    .bind(owner_user_id)
    .fetch_one(pool)
    .await
    .context("seed referral")?;

    Ok(StressWorld {
        owner_broker_id,
        candidate_broker_id,
        owner_user_id,
        candidate_user_id,
        referral_id,
    })
}

/// Run the harness to completion. Oracle failures do not abort the run; they
/// are collected, dumped, and reported at the end.
pub async fn run(config: StressConfig) -> Result<StressReport> {
    let max_conns = (config.concurrency * 2 + 10).min(50) as u32;
    let pool = PgPoolOptions::new()
        .max_connections(max_conns)
        .connect(&config.dsn)
        .await
        .context("stress pool connect failed")?;
    rfm_db::migrate(&pool).await?;

    let world = seed_world(&pool).await?;
    info!(
        referral_id = %world.referral_id,
        replay = %config.replay_tuple(),
        "stress world seeded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for i in 0..config.concurrency {
        handles.push(tokio::spawn(actors::creator(
            pool.clone(),
            world.clone(),
            shutdown_rx.clone(),
            config.seed.wrapping_add(i as u64),
        )));
        handles.push(tokio::spawn(actors::signer(
            pool.clone(),
            world.clone(),
            shutdown_rx.clone(),
            config.seed.wrapping_add(1000 + i as u64),
        )));
    }
    handles.push(tokio::spawn(actors::pii_reader(
        pool.clone(),
        world.clone(),
        shutdown_rx.clone(),
        config.seed.wrapping_add(2001),
    )));
    handles.push(tokio::spawn(actors::event_writer(
        pool.clone(),
        world.clone(),
        shutdown_rx.clone(),
        config.seed.wrapping_add(2002),
    )));
    handles.push(tokio::spawn(actors::outbox_worker(
        pool.clone(),
        shutdown_rx.clone(),
        config.seed.wrapping_add(2003),
    )));
    handles.push(tokio::spawn(actors::edge_adapter(
        pool.clone(),
        shutdown_rx.clone(),
        config.seed.wrapping_add(2004),
    )));
    handles.push(tokio::spawn(actors::disputer(
        pool.clone(),
        world.clone(),
        shutdown_rx.clone(),
        config.seed.wrapping_add(2005),
    )));
    handles.push(tokio::spawn(actors::chaos(
        pool.clone(),
        shutdown_rx.clone(),
        config.seed.wrapping_add(2006),
    )));

    // Oracle sampler runs inline so failures surface as they happen.
    let oracle_pool = pool.clone();
    let oracle_world = world.clone();
    let oracle_config = config.clone();
    let mut oracle_shutdown = shutdown_rx.clone();
    let oracle_handle = tokio::spawn(async move {
        let mut failures: Vec<OracleFailure> = Vec::new();
        loop {
            tokio::select! {
                _ = oracle_shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
            if *oracle_shutdown.borrow() {
                break;
            }
            match oracles::run_all(&oracle_pool, &oracle_world).await {
                Ok(mut found) => {
                    if !found.is_empty() {
                        for f in &found {
                            error!(oracle = %f.name, rows = f.rows.len(), "oracle violated");
                        }
                        if let Err(e) =
                            oracles::dump_ledgers(&oracle_pool, &oracle_config.replay_tuple()).await
                        {
                            warn!(error = %e, "ledger dump failed");
                        }
                        failures.append(&mut found);
                    }
                }
                Err(e) => warn!(error = %e, "oracle sampling failed"),
            }
        }
        failures
    });

    tokio::time::sleep(config.duration).await;
    let _ = shutdown_tx.send(true);

    let mut report = StressReport::default();
    for handle in handles {
        match handle.await {
            Ok(stats) => report.absorb(stats),
            Err(e) => {
                warn!(error = %e, "actor task panicked");
                report.infra_errors += 1;
            }
        }
    }

    match oracle_handle.await {
        Ok(failures) => report.oracle_failures.extend(failures),
        Err(e) => warn!(error = %e, "oracle task panicked"),
    }

    // Final sweep after all actors stopped.
    let mut final_failures = oracles::run_all(&pool, &world).await?;
    if !final_failures.is_empty() {
        oracles::dump_ledgers(&pool, &config.replay_tuple()).await?;
        report.oracle_failures.append(&mut final_failures);
    }

    info!(
        agreements = report.agreements_created,
        collisions = report.unique_violations,
        esigns = report.esign_completed,
        oracle_failures = report.oracle_failures.len(),
        "stress run complete"
    );
    Ok(report)
}

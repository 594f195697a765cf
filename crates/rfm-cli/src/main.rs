use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rfm")]
#[command(about = "RefMesh core CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Run the concurrency stress harness against a database
    Stress {
        /// Run duration in seconds
        #[arg(long, default_value_t = 90)]
        duration: u64,

        /// Creator/signer count (other actors run one instance each)
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Replay seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Database DSN; falls back to STRESS_TEST_PG_DSN, then DATABASE_URL
        #[arg(long)]
        dsn: Option<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = rfm_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = rfm_db::status(&pool).await?;
                    let depth = if s.has_agreements_table {
                        Some(rfm_db::outbox::depth(&pool).await?)
                    } else {
                        None
                    };
                    println!("db_ok={} has_agreements_table={}", s.ok, s.has_agreements_table);
                    if let Some(d) = depth {
                        println!(
                            "outbox_pending={} outbox_dead={} oldest_pending_secs={}",
                            d.pending,
                            d.dead,
                            d.oldest_pending_secs
                                .map(|s| format!("{s:.1}"))
                                .unwrap_or_else(|| "none".to_string())
                        );
                    }
                }
                DbCmd::Migrate => {
                    rfm_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Stress {
            duration,
            concurrency,
            seed,
            dsn,
        } => {
            let dsn = dsn
                .or_else(rfm_config::stress_dsn)
                .ok_or_else(|| anyhow::anyhow!("no DSN: pass --dsn or set STRESS_TEST_PG_DSN"))?;

            let config = rfm_stress::StressConfig {
                dsn,
                duration: Duration::from_secs(duration),
                concurrency,
                seed,
            };
            let replay = config.replay_tuple();

            let report = rfm_stress::run(config).await?;

            println!("replay={replay}");
            println!(
                "agreements_created={} unique_violations={} esign_completed={}",
                report.agreements_created, report.unique_violations, report.esign_completed
            );
            println!(
                "events_appended={} events_rejected={} outbox_processed={} outbox_dead={}",
                report.events_appended,
                report.events_rejected,
                report.outbox_processed,
                report.outbox_dead
            );
            println!(
                "edge_performed={} edge_skipped={} disputes_resolved={} pii_gated_reads={} chaos_kills={}",
                report.edge_performed,
                report.edge_skipped,
                report.disputes_resolved,
                report.pii_gated_reads,
                report.chaos_kills
            );

            if report.invariants_held() {
                println!("invariants_held=true");
            } else {
                for f in &report.oracle_failures {
                    eprintln!("oracle_failed={} rows={}", f.name, f.rows.len());
                }
                anyhow::bail!("invariants violated; replay with {replay}");
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

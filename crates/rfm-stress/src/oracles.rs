//! The nine invariant oracles. Each is a SQL query whose empty result set
//! asserts the invariant; any returned row is a violation.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::StressWorld;

#[derive(Debug, Clone)]
pub struct OracleFailure {
    pub name: &'static str,
    pub rows: Vec<String>,
}

struct Oracle {
    name: &'static str,
    sql: &'static str,
}

/// Every query returns text-ish rows; content is only used for the
/// failure dump, emptiness is the assertion.
const ORACLES: &[Oracle] = &[
    Oracle {
        // At most one active agreement per referral.
        name: "single_active_agreement",
        sql: r#"
            select request_id::text || ' count=' || count(*)::text as violation
            from agreements
            where state in ('pending_signature','effective')
            group by request_id
            having count(*) > 1
        "#,
    },
    Oracle {
        // Temporal-gated events require an effective-or-later parent and
        // must not precede effective_at.
        name: "temporal_events",
        sql: r#"
            select e.id::text || ' type=' || e.event_type as violation
            from timeline_events e
            join agreements a on a.id = e.agreement_id
            where e.event_type in ('OFFER_MADE','ESIGN_COMPLETED','DEAL_CLOSED')
              and (a.state not in ('effective','success','disputed')
                   or a.effective_at is null
                   or e.ts < a.effective_at)
        "#,
    },
    Oracle {
        // seq is gap-free 1..n per agreement.
        name: "seq_gap_free",
        sql: r#"
            select agreement_id::text || ' n=' || count(*)::text
                   || ' max=' || max(seq)::text as violation
            from timeline_events
            group by agreement_id
            having count(*) <> max(seq) or min(seq) <> 1
        "#,
    },
    Oracle {
        // No PII_READ audit row at or before effective_at.
        name: "pii_read_after_effective",
        sql: r#"
            select l.id::text as violation
            from audit_logs l
            join agreements a on a.id = l.agreement_id
            where l.action = 'PII_READ'
              and l.ts <= a.effective_at
        "#,
    },
    Oracle {
        // No outbox row pending for more than five minutes.
        name: "outbox_not_stuck",
        sql: r#"
            select id::text || ' topic=' || topic as violation
            from outbox
            where status = 'pending'
              and created_at < now() - interval '5 minutes'
        "#,
    },
    Oracle {
        // At most one completed edge invocation per (route, key).
        name: "edge_single_completion",
        sql: r#"
            select route || '/' || key as violation
            from edge_invocations
            where status = 'completed'
            group by route, key
            having count(*) > 1
        "#,
    },
    Oracle {
        // Resolved disputes leave no open invoice non-invalidated.
        name: "invoices_invalidated",
        sql: r#"
            select i.id::text as violation
            from invoices i
            join disputes d on d.agreement_id = i.agreement_id
            where d.status = 'resolved'
              and i.status not in ('paid','written_off')
              and not i.is_invalidated
        "#,
    },
    Oracle {
        // No committed region-mutation attempt.
        name: "region_audit_empty",
        sql: "select id::text as violation from agreements_region_audit",
    },
    Oracle {
        // Every timeline event carries its actor broker.
        name: "actor_broker_stamped",
        sql: r#"
            select id::text as violation
            from timeline_events
            where actor_broker_id is null
        "#,
    },
    Oracle {
        // The agreements delete guard is installed.
        name: "delete_guard_present",
        sql: r#"
            select 'agreements_delete_guard missing' as violation
            where not exists (
                select 1 from pg_trigger
                where tgname = 'agreements_delete_guard'
                  and tgrelid = 'agreements'::regclass
            )
        "#,
    },
];

/// Run every oracle once. The world parameter scopes nothing today (the
/// queries are global); it is threaded so scoped variants can narrow to the
/// stress referral without changing call sites.
pub async fn run_all(pool: &PgPool, _world: &StressWorld) -> Result<Vec<OracleFailure>> {
    let mut failures = Vec::new();

    for oracle in ORACLES {
        let rows = sqlx::query(oracle.sql)
            .fetch_all(pool)
            .await
            .with_context(|| format!("oracle {} query failed", oracle.name))?;

        if !rows.is_empty() {
            let rendered = rows
                .iter()
                .map(|r| {
                    r.try_get::<String, _>("violation")
                        .unwrap_or_else(|_| "<unrenderable>".to_string())
                })
                .collect();
            failures.push(OracleFailure {
                name: oracle.name,
                rows: rendered,
            });
        }
    }

    Ok(failures)
}

/// Dump the last 50 rows of each ledger plus the replay tuple. Called on any
/// oracle failure so a violated run can be reproduced and inspected.
pub async fn dump_ledgers(pool: &PgPool, replay_tuple: &str) -> Result<()> {
    warn!(replay = replay_tuple, "invariant violated; dumping ledgers");

    for (table, order) in [
        ("timeline_events", "ts"),
        ("outbox", "created_at"),
        ("edge_invocations", "last_attempt_at"),
        ("audit_logs", "ts"),
    ] {
        let sql = format!(
            "select to_jsonb(t)::text as row from (select * from {table} order by {order} desc limit 50) t"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .with_context(|| format!("dump of {table} failed"))?;

        warn!(table = table, rows = rows.len(), "ledger tail");
        for row in rows {
            let rendered: String = row
                .try_get("row")
                .unwrap_or_else(|_| "<unrenderable>".to_string());
            warn!(table = table, "{rendered}");
        }
    }

    Ok(())
}

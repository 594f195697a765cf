//! Runtime configuration, read once from the environment.
//!
//! `.env.local` is loaded first when present (dev convenience); production
//! injects env vars directly. Every recognized option has a default except
//! `DATABASE_URL`, which callers must supply.

use anyhow::{Context, Result};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_PORT: &str = "PORT";
pub const ENV_OUTBOX_MAX_ATTEMPTS: &str = "OUTBOX_MAX_ATTEMPTS";
pub const ENV_STRESS_DSN: &str = "STRESS_TEST_PG_DSN";

pub const DEFAULT_PORT: u16 = 8080;
/// Retry budget before an outbox row is parked as dead.
pub const DEFAULT_OUTBOX_MAX_ATTEMPTS: i32 = 8;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Listening port for the (external) HTTP collaborator.
    pub port: u16,
    pub outbox_max_attempts: i32,
}

impl Config {
    /// Load from the process environment. Fails if `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::from_filename(".env.local");

        let database_url = std::env::var(ENV_DATABASE_URL)
            .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?;

        let port = match std::env::var(ENV_PORT) {
            Ok(v) => v
                .parse::<u16>()
                .with_context(|| format!("invalid {ENV_PORT}: {v}"))?,
            Err(_) => DEFAULT_PORT,
        };

        let outbox_max_attempts = match std::env::var(ENV_OUTBOX_MAX_ATTEMPTS) {
            Ok(v) => {
                let n = v
                    .parse::<i32>()
                    .with_context(|| format!("invalid {ENV_OUTBOX_MAX_ATTEMPTS}: {v}"))?;
                anyhow::ensure!(n > 0, "{ENV_OUTBOX_MAX_ATTEMPTS} must be > 0, got {n}");
                n
            }
            Err(_) => DEFAULT_OUTBOX_MAX_ATTEMPTS,
        };

        Ok(Self {
            database_url,
            port,
            outbox_max_attempts,
        })
    }
}

/// The stress harness DSN: `STRESS_TEST_PG_DSN`, falling back to
/// `DATABASE_URL`. Returns None when neither is set (harness skips).
pub fn stress_dsn() -> Option<String> {
    std::env::var(ENV_STRESS_DSN)
        .or_else(|_| std::env::var(ENV_DATABASE_URL))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        assert_eq!(DEFAULT_PORT, 8080);
        assert_eq!(DEFAULT_OUTBOX_MAX_ATTEMPTS, 8);
    }
}

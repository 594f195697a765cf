//! Error taxonomy shared by every service.
//!
//! Kinds map onto external status codes at the HTTP boundary:
//! Validation/InvalidState → 400, Unauthorized → 401, Forbidden → 403,
//! NotFound → 404, Conflict → 409, Infrastructure → 500. Services never
//! swallow a kind, with two deliberate exceptions: a duplicate e-sign
//! idempotency key is converted to success, and a match accept replay is
//! converted into the existing agreement.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or out-of-range input.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing or invalid authentication context.
    #[error("unauthorized")]
    Unauthorized,

    /// Authorization failed (role or ownership).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Entity absent, or ownership mismatch surfaced as absence to avoid
    /// leaking existence to non-owners.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation (duplicate match, duplicate email).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Disallowed state transition or operation on a terminal state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Storage or transport failure.
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        CoreError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        CoreError::InvalidState(msg.into())
    }

    pub fn infra(msg: impl Into<String>) -> Self {
        CoreError::Infrastructure(anyhow::anyhow!(msg.into()))
    }

    /// The external status code this kind maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) | CoreError::InvalidState(_) => 400,
            CoreError::Unauthorized => 401,
            CoreError::Forbidden(_) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Infrastructure(_) => 500,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                CoreError::Conflict(
                    db.constraint()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unique violation".to_string()),
                )
            }
            _ => CoreError::Infrastructure(anyhow::Error::new(e)),
        }
    }
}

/// True if `err` is a Postgres unique violation (23505) on the named
/// constraint. Callers that race on partial unique indexes use this to take
/// the fall-back path instead of surfacing Conflict.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
                && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

/// True if `err` is any Postgres unique violation (23505).
pub fn is_any_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// True if `err` is a CHECK constraint violation (23514).
pub fn is_check_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23514"),
        _ => false,
    }
}

/// True if `err` is a trigger-raised exception (P0001), as thrown by the
/// WORM, region-immutability, and delete-guard triggers.
pub fn is_raised_exception(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("P0001"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(CoreError::validation("x").status_code(), 400);
        assert_eq!(CoreError::Unauthorized.status_code(), 401);
        assert_eq!(CoreError::forbidden("x").status_code(), 403);
        assert_eq!(CoreError::not_found("x").status_code(), 404);
        assert_eq!(CoreError::conflict("x").status_code(), 409);
        assert_eq!(CoreError::invalid_state("x").status_code(), 400);
        assert_eq!(CoreError::infra("x").status_code(), 500);
    }
}

//! Shared domain vocabulary for the RefMesh core.
//!
//! Every state enum mirrors a CHECK-constrained text column in the schema;
//! `as_str`/`parse` are the only conversion points, so an out-of-range value
//! coming back from the DB is an `Infrastructure` error, never a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod topics;

pub use error::CoreError;

/// Convenience alias used by every service method.
pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    BrokerAdmin,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::BrokerAdmin => "broker_admin",
            Role::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "agent" => Ok(Role::Agent),
            "broker_admin" => Ok(Role::BrokerAdmin),
            "client" => Ok(Role::Client),
            other => Err(CoreError::infra(format!("invalid role: {other}"))),
        }
    }

    /// Roles allowed to create or cancel referral requests.
    pub fn can_manage_referrals(&self) -> bool {
        matches!(self, Role::Agent | Role::BrokerAdmin)
    }
}

// ---------------------------------------------------------------------------
// Referral request status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Open,
    Matched,
    Signed,
    InProgress,
    Closed,
    Cancelled,
    Disputed,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Open => "open",
            ReferralStatus::Matched => "matched",
            ReferralStatus::Signed => "signed",
            ReferralStatus::InProgress => "in_progress",
            ReferralStatus::Closed => "closed",
            ReferralStatus::Cancelled => "cancelled",
            ReferralStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "open" => Ok(ReferralStatus::Open),
            "matched" => Ok(ReferralStatus::Matched),
            "signed" => Ok(ReferralStatus::Signed),
            "in_progress" => Ok(ReferralStatus::InProgress),
            "closed" => Ok(ReferralStatus::Closed),
            "cancelled" => Ok(ReferralStatus::Cancelled),
            "disputed" => Ok(ReferralStatus::Disputed),
            other => Err(CoreError::infra(format!("invalid referral status: {other}"))),
        }
    }

    /// Cancellation is only permitted before signing.
    pub fn cancellable(&self) -> bool {
        matches!(self, ReferralStatus::Open | ReferralStatus::Matched)
    }
}

// ---------------------------------------------------------------------------
// Match state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    Invited,
    Accepted,
    Declined,
}

impl MatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchState::Invited => "invited",
            MatchState::Accepted => "accepted",
            MatchState::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "invited" => Ok(MatchState::Invited),
            "accepted" => Ok(MatchState::Accepted),
            "declined" => Ok(MatchState::Declined),
            other => Err(CoreError::infra(format!("invalid match state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Agreement state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementState {
    Draft,
    PendingSignature,
    Effective,
    Success,
    Void,
    Disputed,
    Closed,
}

impl AgreementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementState::Draft => "draft",
            AgreementState::PendingSignature => "pending_signature",
            AgreementState::Effective => "effective",
            AgreementState::Success => "success",
            AgreementState::Void => "void",
            AgreementState::Disputed => "disputed",
            AgreementState::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "draft" => Ok(AgreementState::Draft),
            "pending_signature" => Ok(AgreementState::PendingSignature),
            "effective" => Ok(AgreementState::Effective),
            "success" => Ok(AgreementState::Success),
            "void" => Ok(AgreementState::Void),
            "disputed" => Ok(AgreementState::Disputed),
            "closed" => Ok(AgreementState::Closed),
            other => Err(CoreError::infra(format!("invalid agreement state: {other}"))),
        }
    }

    /// The transition table. Mirrors `agreement_transition_ok` in the schema;
    /// the DB trigger is authoritative, this copy exists so services can fail
    /// fast with `InvalidState` before touching the row.
    pub fn can_transition_to(&self, next: AgreementState) -> bool {
        use AgreementState::*;
        matches!(
            (self, next),
            (Draft, PendingSignature)
                | (Draft, Void)
                | (PendingSignature, Effective)
                | (PendingSignature, Void)
                | (Effective, Success)
                | (Effective, Disputed)
                | (Effective, Void)
                | (Effective, Closed)
                | (Disputed, Void)
                | (Disputed, Closed)
                | (Success, Closed)
                | (Void, Closed)
        )
    }

    /// States in which `effective_at` must be set and PII obligations can apply.
    pub fn requires_effective_at(&self) -> bool {
        matches!(
            self,
            AgreementState::Effective | AgreementState::Success | AgreementState::Disputed
        )
    }

    /// States that occupy the single-active slot for a referral request.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgreementState::PendingSignature | AgreementState::Effective
        )
    }
}

// ---------------------------------------------------------------------------
// Disputes / invoices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    UnderReview,
    Resolved,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::UnderReview => "under_review",
            DisputeStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "under_review" => Ok(DisputeStatus::UnderReview),
            "resolved" => Ok(DisputeStatus::Resolved),
            other => Err(CoreError::infra(format!("invalid dispute status: {other}"))),
        }
    }
}

/// Invoice statuses that are terminal for billing purposes. A resolved dispute
/// invalidates every invoice NOT in one of these.
pub const INVOICE_TERMINAL_STATUSES: &[&str] = &["paid", "written_off"];

// ---------------------------------------------------------------------------
// Outbox / edge ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processed" => Ok(OutboxStatus::Processed),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(CoreError::infra(format!("invalid outbox status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    Pending,
    Completed,
    Failed,
}

impl EdgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeStatus::Pending => "pending",
            EdgeStatus::Completed => "completed",
            EdgeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(EdgeStatus::Pending),
            "completed" => Ok(EdgeStatus::Completed),
            "failed" => Ok(EdgeStatus::Failed),
            other => Err(CoreError::infra(format!("invalid edge status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeline event types
// ---------------------------------------------------------------------------

/// Timeline event type tags. Stored as text; the temporal trigger keys off the
/// `TEMPORAL_GATED` subset.
pub mod event_types {
    pub const AGREEMENT_CREATED: &str = "AGREEMENT_CREATED";
    pub const AGREEMENT_STATUS_CHANGED: &str = "AGREEMENT_STATUS_CHANGED";
    pub const OFFER_MADE: &str = "OFFER_MADE";
    pub const ESIGN_COMPLETED: &str = "ESIGN_COMPLETED";
    pub const DEAL_CLOSED: &str = "DEAL_CLOSED";

    /// Types that may only be appended while the agreement is effective (or
    /// later) and whose ts must not precede `effective_at`.
    pub const TEMPORAL_GATED: &[&str] = &[OFFER_MADE, ESIGN_COMPLETED, DEAL_CLOSED];
}

/// Audit actions recorded in `audit_logs`.
pub mod audit_actions {
    pub const PII_READ: &str = "PII_READ";
    pub const REGION_CHANGE_BLOCKED: &str = "REGION_CHANGE_BLOCKED";
}

/// Current timeline payload schema version. Bump when payload keys change;
/// readers dispatch on the stored `payload_version`.
pub const TIMELINE_PAYLOAD_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Cross-crate row shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSummary {
    pub id: Uuid,
    pub name: String,
    pub fein: String,
    pub verified: bool,
}

/// The only shape the PII accessor ever returns. Never carries row ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiContactView {
    pub client_name: String,
    pub client_phone: String,
    pub client_email: String,
}

/// Paging envelope shared by every list operation.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    pub const DEFAULT_SIZE: i64 = 20;
    pub const MAX_SIZE: i64 = 100;

    /// Clamp raw caller input into the allowed window.
    pub fn clamped(page: Option<i64>, page_size: Option<i64>) -> Self {
        let page = page.unwrap_or(1).max(1);
        let page_size = page_size
            .unwrap_or(Self::DEFAULT_SIZE)
            .clamp(1, Self::MAX_SIZE);
        Self { page, page_size }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }
}

/// Sort order for list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(CoreError::validation(format!("invalid sort order: {other}"))),
        }
    }
}

/// Actor identity threaded through every service call. The HTTP layer builds
/// this from its auth context; tests build it from seeded users.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
    pub broker_id: Option<Uuid>,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role, broker_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            role,
            broker_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEventView {
    pub id: Uuid,
    pub agreement_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub payload_version: i32,
    pub actor_id: Option<Uuid>,
    pub actor_broker_id: Uuid,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_transitions_match_table() {
        use AgreementState::*;
        assert!(Draft.can_transition_to(PendingSignature));
        assert!(Draft.can_transition_to(Void));
        assert!(PendingSignature.can_transition_to(Effective));
        assert!(Effective.can_transition_to(Disputed));
        assert!(Disputed.can_transition_to(Closed));
        assert!(Success.can_transition_to(Closed));
        assert!(Void.can_transition_to(Closed));

        assert!(!Draft.can_transition_to(Effective));
        assert!(!Effective.can_transition_to(PendingSignature));
        assert!(!Closed.can_transition_to(Void));
        assert!(!Success.can_transition_to(Disputed));
        assert!(!Void.can_transition_to(Effective));
    }

    #[test]
    fn active_states_are_exactly_pending_and_effective() {
        use AgreementState::*;
        for s in [Draft, PendingSignature, Effective, Success, Void, Disputed, Closed] {
            assert_eq!(
                s.is_active(),
                matches!(s, PendingSignature | Effective),
                "active flag wrong for {s:?}"
            );
        }
    }

    #[test]
    fn effective_at_states_match_check_constraint() {
        use AgreementState::*;
        for s in [Effective, Success, Disputed] {
            assert!(s.requires_effective_at());
        }
        for s in [Draft, PendingSignature, Void, Closed] {
            assert!(!s.requires_effective_at());
        }
    }

    #[test]
    fn enum_round_trips() {
        for s in [
            "draft",
            "pending_signature",
            "effective",
            "success",
            "void",
            "disputed",
            "closed",
        ] {
            assert_eq!(AgreementState::parse(s).unwrap().as_str(), s);
        }
        for s in ["open", "matched", "signed", "in_progress", "closed", "cancelled", "disputed"] {
            assert_eq!(ReferralStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["invited", "accepted", "declined"] {
            assert_eq!(MatchState::parse(s).unwrap().as_str(), s);
        }
        assert!(AgreementState::parse("EFFECTIVE").is_err());
    }

    #[test]
    fn page_clamps_to_bounds() {
        let p = Page::clamped(None, None);
        assert_eq!((p.page, p.page_size), (1, 20));

        let p = Page::clamped(Some(0), Some(1000));
        assert_eq!((p.page, p.page_size), (1, 100));

        let p = Page::clamped(Some(3), Some(25));
        assert_eq!(p.offset(), 50);
    }
}

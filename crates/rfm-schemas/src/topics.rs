//! Outbox topic names and their default payload shapes.
//!
//! Payload builders keep the key set consistent between the producing service
//! and the consumers; extra keys may be layered on by callers that need them.

use serde_json::{json, Value};
use uuid::Uuid;

pub const REFERRAL_CREATED: &str = "referral.created";
pub const REFERRAL_CANCELLED: &str = "referral.cancelled";
pub const AGREEMENT_CREATED: &str = "agreement.created";
pub const AGREEMENT_EFFECTIVE: &str = "agreement.effective";
pub const AGREEMENT_STATUS_CHANGED: &str = "agreement.status_changed";

pub fn referral_created(referral_id: Uuid, status: &str) -> Value {
    json!({ "referral_id": referral_id, "status": status })
}

pub fn referral_cancelled(referral_id: Uuid, status: &str, reason: Option<&str>) -> Value {
    match reason {
        Some(r) => json!({ "referral_id": referral_id, "status": status, "reason": r }),
        None => json!({ "referral_id": referral_id, "status": status }),
    }
}

pub fn agreement_created(
    agreement_id: Uuid,
    referral_id: Uuid,
    status: &str,
    owner_id: Uuid,
    candidate_id: Option<Uuid>,
    match_id: Option<Uuid>,
) -> Value {
    let mut v = json!({
        "agreement_id": agreement_id,
        "referral_id": referral_id,
        "status": status,
        "owner_id": owner_id,
    });
    if let Some(c) = candidate_id {
        v["candidate_id"] = json!(c);
    }
    if let Some(m) = match_id {
        v["match_id"] = json!(m);
    }
    v
}

pub fn agreement_effective(agreement_id: Uuid, effective_at: chrono::DateTime<chrono::Utc>) -> Value {
    json!({ "agreement_id": agreement_id, "effective_at": effective_at })
}

pub fn agreement_status_changed(agreement_id: Uuid, previous: &str, next: &str) -> Value {
    json!({ "agreement_id": agreement_id, "previous": previous, "next": next })
}

use chrono::Duration;
use serde_json::json;

use crate::audit;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{opt_bool, opt_str, require_db, required_str, HandlerErr, PlanRow};
use crate::ipc::types::{AppState, Request};

fn handle_request_unlock(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let reason = required_str(&req.params, "reason")?;
        if reason.trim().is_empty() {
            return Err(HandlerErr::validation("unlock reason must not be empty"));
        }

        let plan = PlanRow::load_active(conn, &id)?;
        conn.execute(
            "UPDATE action_plans SET unlock_status = 'pending', unlock_reason = ?,
             unlock_requested_at = ?, rejection_reason = NULL, updated_at = ?
             WHERE id = ?",
            (reason.trim(), db::ts(now), db::ts(now), &id),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_UNLOCK_REQUEST,
            Some(&json!({ "unlockStatus": plan.unlock_status })),
            Some(&json!({ "unlockStatus": "pending", "reason": reason.trim() })),
            "unlock requested",
            opt_str(&req.params, "requestedBy").as_deref(),
            now,
        );
        Ok(json!({ "plan": PlanRow::load(conn, &id)?.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_approve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let plan = PlanRow::load_active(conn, &id)?;

        // No expiry means an indefinite grant; only an explicit revoke (or a
        // reject of a later request) closes it.
        let approved_until = if opt_bool(&req.params, "indefinite").unwrap_or(false) {
            None
        } else if let Some(raw) = opt_str(&req.params, "expiresAt") {
            let parsed = db::parse_ts(&raw).ok_or_else(|| {
                HandlerErr::bad_params(format!("expiresAt must be RFC 3339: {}", raw))
            })?;
            Some(db::ts(parsed))
        } else {
            let settings = db::load_lock_settings(conn).map_err(HandlerErr::db_query)?;
            Some(db::ts(now + Duration::days(settings.unlock_grant_days)))
        };

        let approved_by = opt_str(&req.params, "approvedBy");
        conn.execute(
            "UPDATE action_plans SET unlock_status = 'approved', approved_by = ?,
             approved_until = ?, rejection_reason = NULL, updated_at = ?
             WHERE id = ?",
            (&approved_by, &approved_until, db::ts(now), &id),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_UNLOCK_DECISION,
            Some(&json!({ "unlockStatus": plan.unlock_status })),
            Some(&json!({ "unlockStatus": "approved", "approvedUntil": approved_until })),
            "unlock approved",
            approved_by.as_deref(),
            now,
        );
        audit::notify(
            conn,
            &id,
            "unlock_decision",
            json!({ "decision": "approved", "approvedUntil": approved_until }),
            now,
        );
        Ok(json!({ "plan": PlanRow::load(conn, &id)?.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_reject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let reason = required_str(&req.params, "reason")?;
        if reason.trim().is_empty() {
            return Err(HandlerErr::validation("rejection reason must not be empty"));
        }

        let plan = PlanRow::load_active(conn, &id)?;
        conn.execute(
            "UPDATE action_plans SET unlock_status = 'rejected', rejection_reason = ?,
             approved_until = NULL, updated_at = ? WHERE id = ?",
            (reason.trim(), db::ts(now), &id),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_UNLOCK_DECISION,
            Some(&json!({ "unlockStatus": plan.unlock_status })),
            Some(&json!({ "unlockStatus": "rejected", "reason": reason.trim() })),
            "unlock rejected",
            opt_str(&req.params, "rejectedBy").as_deref(),
            now,
        );
        audit::notify(
            conn,
            &id,
            "unlock_decision",
            json!({ "decision": "rejected", "reason": reason.trim() }),
            now,
        );
        Ok(json!({ "plan": PlanRow::load(conn, &id)?.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

// Clears the whole unlock record, re-subjecting the plan to the deadline
// check immediately.
fn handle_revoke(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let plan = PlanRow::load_active(conn, &id)?;

        conn.execute(
            "UPDATE action_plans SET unlock_status = NULL, unlock_reason = NULL,
             unlock_requested_at = NULL, approved_by = NULL, approved_until = NULL,
             rejection_reason = NULL, updated_at = ? WHERE id = ?",
            (db::ts(now), &id),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_UNLOCK_DECISION,
            Some(&json!({ "unlockStatus": plan.unlock_status })),
            Some(&json!({ "unlockStatus": serde_json::Value::Null })),
            "unlock revoked",
            opt_str(&req.params, "actor").as_deref(),
            now,
        );
        Ok(json!({ "plan": PlanRow::load(conn, &id)?.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "unlock.request" => Some(handle_request_unlock(state, req)),
        "unlock.approve" => Some(handle_approve(state, req)),
        "unlock.reject" => Some(handle_reject(state, req)),
        "unlock.revoke" => Some(handle_revoke(state, req)),
        _ => None,
    }
}

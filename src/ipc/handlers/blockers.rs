use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;

use crate::audit;
use crate::db;
use crate::escalation;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_unlocked, is_terminal_status, opt_bool, opt_str, require_db, required_str, HandlerErr,
    PlanRow, PLAN_COLUMNS, STATUS_BLOCKED, STATUS_ON_PROGRESS,
};
use crate::ipc::types::{AppState, Request};

fn handle_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let reason = required_str(&req.params, "reason")?;

        let plan = PlanRow::load_active(conn, &id)?;
        if is_terminal_status(&plan.status) {
            return Err(HandlerErr::validation(
                "completed plans cannot carry a blocker",
            ));
        }

        let level = opt_str(&req.params, "attentionLevel")
            .unwrap_or_else(|| plan.attention_level.clone());
        if !escalation::is_valid_level(&level) {
            return Err(HandlerErr::validation(format!(
                "attentionLevel must be one of: {}",
                escalation::ATTENTION_LEVELS.join(", ")
            )));
        }
        escalation::validate_reason(&level, &reason).map_err(HandlerErr::validation)?;

        ensure_unlocked(
            conn,
            &plan,
            opt_bool(&req.params, "adminOverride").unwrap_or(false),
            now,
        )?;

        conn.execute(
            "UPDATE action_plans SET is_blocked = 1, blocker_reason = ?,
             blocker_category = ?, attention_level = ?, updated_at = ? WHERE id = ?",
            (
                reason.trim(),
                opt_str(&req.params, "category"),
                &level,
                db::ts(now),
                &id,
            ),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_BLOCKER_REPORT,
            Some(&json!({
                "isBlocked": plan.is_blocked,
                "attentionLevel": plan.attention_level,
            })),
            Some(&json!({
                "isBlocked": true,
                "attentionLevel": level,
                "reason": reason.trim(),
            })),
            "blocker reported",
            opt_str(&req.params, "actor").as_deref(),
            now,
        );
        if level != escalation::LEVEL_STANDARD {
            audit::notify(
                conn,
                &id,
                "blocker_escalated",
                json!({ "attentionLevel": level, "reason": reason.trim() }),
                now,
            );
        }
        Ok(json!({ "plan": PlanRow::load(conn, &id)?.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let note = required_str(&req.params, "note")?;

        let plan = PlanRow::load_active(conn, &id)?;
        if !plan.is_blocked {
            return Err(HandlerErr::validation("plan has no blocker to resolve"));
        }
        escalation::validate_reason(&plan.attention_level, &note)
            .map_err(HandlerErr::validation)?;

        ensure_unlocked(
            conn,
            &plan,
            opt_bool(&req.params, "adminOverride").unwrap_or(false),
            now,
        )?;

        // One statement: a partial blocker reset is a correctness bug.
        conn.execute(
            "UPDATE action_plans SET is_blocked = 0, blocker_reason = NULL,
             blocker_category = NULL, attention_level = ?,
             status = CASE WHEN status = ? THEN ? ELSE status END,
             updated_at = ? WHERE id = ?",
            (
                escalation::LEVEL_STANDARD,
                STATUS_BLOCKED,
                STATUS_ON_PROGRESS,
                db::ts(now),
                &id,
            ),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_BLOCKER_RESOLVE,
            Some(&json!({
                "isBlocked": true,
                "attentionLevel": plan.attention_level,
                "blockerReason": plan.blocker_reason,
            })),
            Some(&json!({ "isBlocked": false, "note": note.trim() })),
            "blocker resolved",
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

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();

        let mut sql = format!(
            "SELECT {} FROM action_plans
             WHERE deleted_at IS NULL AND (is_blocked = 1 OR status = ?)",
            PLAN_COLUMNS
        );
        let mut binds = vec![Value::Text(STATUS_BLOCKED.to_string())];
        if let Some(dept) = opt_str(&req.params, "departmentCode") {
            sql.push_str(" AND department_code = ?");
            binds.push(Value::Text(dept));
        }
        sql.push_str(" ORDER BY updated_at");

        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
        let plans = stmt
            .query_map(params_from_iter(binds), PlanRow::from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;

        let rows = plans
            .iter()
            .map(|p| {
                let days = escalation::blocked_days(&p.status, db::parse_ts(&p.updated_at), now);
                json!({
                    "id": p.id,
                    "departmentCode": p.department_code,
                    "month": p.month,
                    "year": p.year,
                    "status": p.status,
                    "attentionLevel": p.attention_level,
                    "blockerReason": p.blocker_reason,
                    "blockerCategory": p.blocker_category,
                    "blockedDays": days,
                    "severity": escalation::severity(days),
                    "escalated": escalation::is_escalated(&p.status, Some(&p.attention_level)),
                })
            })
            .collect::<Vec<_>>();

        Ok(json!({ "escalations": rows }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "blockers.report" => Some(handle_report(state, req)),
        "blockers.resolve" => Some(handle_resolve(state, req)),
        "escalations.list" => Some(handle_list(state, req)),
        _ => None,
    }
}

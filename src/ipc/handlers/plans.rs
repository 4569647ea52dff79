use crate::audit;
use crate::db;
use crate::deadline;
use crate::ipc::error::{codes, ok};
use crate::ipc::helpers::{
    ensure_period_unlocked, ensure_unlocked, opt_bool, opt_str, require_db, required_str,
    HandlerErr, PlanRow, CARRY_LATE_2, PLAN_COLUMNS, RESOLUTION_CARRIED_OVER, RESOLUTION_DROPPED,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::params_from_iter;
use serde_json::json;
use uuid::Uuid;

// Fields the caller may touch through plans.update. Lifecycle, lock, and
// grading fields move only through their dedicated operations.
const UPDATABLE_FIELDS: [(&str, &str); 12] = [
    ("goalStrategy", "goal_strategy"),
    ("actionPlan", "action_plan"),
    ("indicator", "indicator"),
    ("pic", "pic"),
    ("evidence", "evidence"),
    ("outcomeLink", "outcome_link"),
    ("attachments", "attachments"),
    ("remark", "remark"),
    ("gapCategory", "gap_category"),
    ("gapAnalysis", "gap_analysis"),
    ("specifyReason", "specify_reason"),
    ("resolutionType", "resolution_type"),
];

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();

        let company_id = required_str(&req.params, "companyId")?;
        let department_code = required_str(&req.params, "departmentCode")?;
        let month_raw = required_str(&req.params, "month")?;
        let month_index = deadline::month_index(&month_raw)
            .ok_or_else(|| HandlerErr::bad_params(format!("unrecognized month: {}", month_raw)))?;
        // Stored canonically so period queries can match on equality.
        let month = deadline::month_name(month_index)
            .ok_or_else(|| HandlerErr::bad_params("unrecognized month"))?;
        let year = req
            .params
            .get("year")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr::bad_params("missing year"))?;

        // A closed period takes no new rows; they would be born unwritable.
        ensure_period_unlocked(
            conn,
            month,
            year as i32,
            opt_bool(&req.params, "adminOverride").unwrap_or(false),
            now,
        )?;

        let id = Uuid::new_v4().to_string();
        let ts = db::ts(now);
        conn.execute(
            "INSERT INTO action_plans(
                id, company_id, department_code, month, year,
                goal_strategy, action_plan, indicator, pic, evidence,
                outcome_link, attachments, remark, created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params_from_iter([
                Value::Text(id.clone()),
                Value::Text(company_id),
                Value::Text(department_code),
                Value::Text(month.to_string()),
                Value::Integer(year),
                text_or_null(opt_str(&req.params, "goalStrategy")),
                text_or_null(opt_str(&req.params, "actionPlan")),
                text_or_null(opt_str(&req.params, "indicator")),
                text_or_null(opt_str(&req.params, "pic")),
                text_or_null(opt_str(&req.params, "evidence")),
                text_or_null(opt_str(&req.params, "outcomeLink")),
                text_or_null(opt_str(&req.params, "attachments")),
                text_or_null(opt_str(&req.params, "remark")),
                Value::Text(ts.clone()),
                Value::Text(ts),
            ]),
        )
        .map_err(HandlerErr::db_insert)?;

        let plan = PlanRow::load(conn, &id)?;
        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_CREATE,
            None,
            Some(&plan.to_json()),
            "plan created",
            opt_str(&req.params, "actor").as_deref(),
            now,
        );
        Ok(json!({ "plan": plan.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn text_or_null(v: Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let id = required_str(&req.params, "id")?;
        let plan = PlanRow::load(conn, &id)?;
        Ok(json!({ "plan": plan.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<Value> = Vec::new();

        if let Some(dept) = opt_str(&req.params, "departmentCode") {
            clauses.push("department_code = ?".to_string());
            binds.push(Value::Text(dept));
        }
        if let Some(month_raw) = opt_str(&req.params, "month") {
            let mi = deadline::month_index(&month_raw).ok_or_else(|| {
                HandlerErr::bad_params(format!("unrecognized month: {}", month_raw))
            })?;
            clauses.push("month = ?".to_string());
            binds.push(Value::Text(
                deadline::month_name(mi).unwrap_or_default().to_string(),
            ));
        }
        if let Some(year) = req.params.get("year").and_then(|v| v.as_i64()) {
            clauses.push("year = ?".to_string());
            binds.push(Value::Integer(year));
        }
        if !opt_bool(&req.params, "includeDeleted").unwrap_or(false) {
            clauses.push("deleted_at IS NULL".to_string());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM action_plans{} ORDER BY year, month, created_at",
            PLAN_COLUMNS, where_sql
        );
        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
        let plans = stmt
            .query_map(params_from_iter(binds), PlanRow::from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;

        Ok(json!({
            "plans": plans.iter().map(|p| p.to_json()).collect::<Vec<_>>(),
        }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let Some(fields) = req.params.get("fields").and_then(|v| v.as_object()) else {
            return Err(HandlerErr::bad_params("missing fields{}"));
        };

        let plan = PlanRow::load_active(conn, &id)?;
        if plan.is_graded() {
            return Err(HandlerErr::validation(
                "plan is graded and immutable; an admin grade reset or verdict is required",
            ));
        }
        if plan.submission_status == "submitted" {
            return Err(HandlerErr::validation(
                "plan is submitted; recall the month to edit it",
            ));
        }
        ensure_unlocked(
            conn,
            &plan,
            opt_bool(&req.params, "adminOverride").unwrap_or(false),
            now,
        )?;

        let mut sets: Vec<String> = Vec::new();
        let mut binds: Vec<Value> = Vec::new();
        let mut prev = serde_json::Map::new();
        let mut next = serde_json::Map::new();

        for (key, value) in fields {
            let Some((_, column)) = UPDATABLE_FIELDS.iter().find(|(k, _)| k == key) else {
                return Err(HandlerErr::validation(format!(
                    "field not updatable here: {}",
                    key
                ))
                .with_details(json!({ "field": key })));
            };
            let bound = match value {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::String(s) => Value::Text(s.clone()),
                _ => {
                    return Err(HandlerErr::validation(format!(
                        "field {} must be a string or null",
                        key
                    )))
                }
            };
            if *column == "resolution_type" {
                validate_resolution_tag(&plan, value)?;
            }
            sets.push(format!("{} = ?", column));
            binds.push(bound);
            prev.insert(key.clone(), field_snapshot(&plan, column));
            next.insert(key.clone(), value.clone());
        }

        if sets.is_empty() {
            return Err(HandlerErr::validation("no updatable fields supplied"));
        }

        sets.push("updated_at = ?".to_string());
        binds.push(Value::Text(db::ts(now)));
        binds.push(Value::Text(id.clone()));
        let sql = format!("UPDATE action_plans SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, params_from_iter(binds))
            .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_FIELD_UPDATE,
            Some(&serde_json::Value::Object(prev)),
            Some(&serde_json::Value::Object(next)),
            "plan fields updated",
            opt_str(&req.params, "actor").as_deref(),
            now,
        );

        let plan = PlanRow::load(conn, &id)?;
        Ok(json!({ "plan": plan.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn validate_resolution_tag(plan: &PlanRow, value: &serde_json::Value) -> Result<(), HandlerErr> {
    match value.as_str() {
        None if value.is_null() => Ok(()),
        Some(RESOLUTION_CARRIED_OVER) => {
            // A twice-carried item must resolve this period.
            if plan.carry_over_status == CARRY_LATE_2 {
                return Err(HandlerErr::new(
                    codes::CARRY_OVER_CAP,
                    "plan already carried over twice; it must be resolved this period",
                )
                .with_details(json!({ "planId": plan.id })));
            }
            Ok(())
        }
        Some(RESOLUTION_DROPPED) => Ok(()),
        _ => Err(HandlerErr::validation(
            "resolutionType must be null, carried_over, or dropped",
        )),
    }
}

fn field_snapshot(plan: &PlanRow, column: &str) -> serde_json::Value {
    let v = match column {
        "goal_strategy" => &plan.goal_strategy,
        "action_plan" => &plan.action_plan,
        "indicator" => &plan.indicator,
        "pic" => &plan.pic,
        "evidence" => &plan.evidence,
        "outcome_link" => &plan.outcome_link,
        "attachments" => &plan.attachments,
        "remark" => &plan.remark,
        "gap_category" => &plan.gap_category,
        "gap_analysis" => &plan.gap_analysis,
        "specify_reason" => &plan.specify_reason,
        "resolution_type" => &plan.resolution_type,
        _ => &None,
    };
    match v {
        Some(s) => json!(s),
        None => serde_json::Value::Null,
    }
}

fn handle_soft_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let reason = required_str(&req.params, "reason")?;
        if reason.trim().is_empty() {
            return Err(HandlerErr::validation("deletion reason must not be empty"));
        }

        let plan = PlanRow::load_active(conn, &id)?;
        ensure_unlocked(
            conn,
            &plan,
            opt_bool(&req.params, "adminOverride").unwrap_or(false),
            now,
        )?;

        conn.execute(
            "UPDATE action_plans SET deleted_at = ?, deleted_by = ?, deletion_reason = ?, updated_at = ?
             WHERE id = ?",
            (
                db::ts(now),
                opt_str(&req.params, "deletedBy"),
                reason.trim(),
                db::ts(now),
                &id,
            ),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_SOFT_DELETE,
            None,
            Some(&json!({ "reason": reason.trim() })),
            "plan soft-deleted",
            opt_str(&req.params, "deletedBy").as_deref(),
            now,
        );
        Ok(json!({ "deleted": true }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_restore(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let plan = PlanRow::load(conn, &id)?;
        if plan.deleted_at.is_none() {
            return Err(HandlerErr::validation("plan is not deleted"));
        }

        conn.execute(
            "UPDATE action_plans SET deleted_at = NULL, deleted_by = NULL, deletion_reason = NULL,
             updated_at = ? WHERE id = ?",
            (db::ts(now), &id),
        )
        .map_err(HandlerErr::db_update)?;

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_RESTORE,
            None,
            None,
            "plan restored",
            opt_str(&req.params, "actor").as_deref(),
            now,
        );
        let plan = PlanRow::load(conn, &id)?;
        Ok(json!({ "plan": plan.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

// Permanent delete is deliberately audit-exempt. Children referencing the
// purged plan keep their origin_plan_id; orphans are valid.
fn handle_purge(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let id = required_str(&req.params, "id")?;
        let removed = conn
            .execute("DELETE FROM action_plans WHERE id = ?", [&id])
            .map_err(HandlerErr::db_update)?;
        Ok(json!({ "purged": removed > 0 }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "plans.create" => Some(handle_create(state, req)),
        "plans.get" => Some(handle_get(state, req)),
        "plans.list" => Some(handle_list(state, req)),
        "plans.update" => Some(handle_update(state, req)),
        "plans.softDelete" => Some(handle_soft_delete(state, req)),
        "plans.restore" => Some(handle_restore(state, req)),
        "plans.purge" => Some(handle_purge(state, req)),
        _ => None,
    }
}

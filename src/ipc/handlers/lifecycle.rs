use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;

use crate::audit;
use crate::db;
use crate::escalation;
use crate::ipc::error::{codes, ok};
use crate::ipc::handlers::carryover::{self, CarryOutcome};
use crate::ipc::helpers::{
    ensure_period_unlocked, ensure_unlocked, is_terminal_status, opt_bool, opt_str, require_db,
    required_period, required_str, HandlerErr, PlanRow, AUTO_SCORE_FEEDBACK, PLAN_COLUMNS,
    RESOLUTION_CARRIED_OVER, STATUSES, STATUS_BLOCKED, STATUS_NOT_ACHIEVED,
};
use crate::ipc::types::{AppState, Request};

fn handle_update_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let new_status = required_str(&req.params, "status")?;
        if !STATUSES.contains(&new_status.as_str()) {
            return Err(HandlerErr::validation(format!(
                "status must be one of: {}",
                STATUSES.join(", ")
            )));
        }

        let plan = PlanRow::load_active(conn, &id)?;
        if plan.is_graded() {
            return Err(HandlerErr::validation(
                "plan is graded and immutable; an admin grade reset or verdict is required",
            ));
        }
        ensure_unlocked(
            conn,
            &plan,
            opt_bool(&req.params, "adminOverride").unwrap_or(false),
            now,
        )?;

        if new_status == STATUS_BLOCKED && !plan.is_blocked {
            return Err(HandlerErr::validation(
                "report a blocker before marking the plan Blocked",
            ));
        }

        let mut sets = vec!["status = ?".to_string(), "updated_at = ?".to_string()];
        let mut binds = vec![Value::Text(new_status.clone()), Value::Text(db::ts(now))];

        // Stale failure analysis must not leak into a reopened item.
        let leaving_not_achieved =
            plan.status == STATUS_NOT_ACHIEVED && new_status != STATUS_NOT_ACHIEVED;
        if leaving_not_achieved {
            for col in [
                "gap_category",
                "gap_analysis",
                "specify_reason",
                "remark",
                "outcome_link",
            ] {
                sets.push(format!("{} = NULL", col));
            }
        }

        // Completion always clears a blocker, in the same write.
        let clearing_blocker = is_terminal_status(&new_status) && plan.is_blocked;
        if clearing_blocker {
            sets.push("is_blocked = 0".to_string());
            sets.push("blocker_reason = NULL".to_string());
            sets.push("blocker_category = NULL".to_string());
            sets.push("attention_level = ?".to_string());
            binds.push(Value::Text(escalation::LEVEL_STANDARD.to_string()));
        }

        binds.push(Value::Text(id.clone()));
        let sql = format!("UPDATE action_plans SET {} WHERE id = ?", sets.join(", "));

        // STATUS_UPDATE audit entries are mandatory: commit the write and its
        // record together or not at all.
        let tx = conn.unchecked_transaction().map_err(HandlerErr::db_update)?;
        tx.execute(&sql, params_from_iter(binds))
            .map_err(HandlerErr::db_update)?;
        audit::record(
            &tx,
            &id,
            audit::CHANGE_STATUS_UPDATE,
            Some(&json!({
                "status": plan.status,
                "isBlocked": plan.is_blocked,
                "blockerReason": plan.blocker_reason,
            })),
            Some(&json!({
                "status": new_status,
                "clearedFailureAnalysis": leaving_not_achieved,
                "clearedBlocker": clearing_blocker,
            })),
            "status updated",
            opt_str(&req.params, "actor").as_deref(),
            now,
        )
        .map_err(HandlerErr::db_update)?;
        tx.commit().map_err(HandlerErr::db_update)?;

        let plan = PlanRow::load(conn, &id)?;
        Ok(json!({ "plan": plan.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn period_plans(
    conn: &rusqlite::Connection,
    month: &str,
    year: i32,
    department: Option<&str>,
    submission_status: &str,
) -> Result<Vec<PlanRow>, HandlerErr> {
    let mut sql = format!(
        "SELECT {} FROM action_plans
         WHERE deleted_at IS NULL AND month = ? AND year = ? AND submission_status = ?",
        PLAN_COLUMNS
    );
    let mut binds = vec![
        Value::Text(month.to_string()),
        Value::Integer(year as i64),
        Value::Text(submission_status.to_string()),
    ];
    if let Some(dept) = department {
        sql.push_str(" AND department_code = ?");
        binds.push(Value::Text(dept.to_string()));
    }
    sql.push_str(" ORDER BY created_at");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    stmt.query_map(params_from_iter(binds), PlanRow::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)
}

fn handle_finalize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let period = required_period(&req.params)?;
        let month = period.month.as_str();
        let department = opt_str(&req.params, "departmentCode");
        let submitted_by = opt_str(&req.params, "submittedBy");
        let admin = opt_bool(&req.params, "adminOverride").unwrap_or(false);

        // Locking gates submission: a period past its deadline cannot be
        // finalized without an admin override.
        ensure_period_unlocked(conn, month, period.year, admin, now)?;

        let drafts = period_plans(conn, month, period.year, department.as_deref(), "draft")?;
        let mut submitted = 0usize;
        let mut auto_scored = 0usize;
        let ts = db::ts(now);

        for plan in &drafts {
            if plan.status == STATUS_NOT_ACHIEVED {
                // Failed items skip the human grading queue.
                conn.execute(
                    "UPDATE action_plans SET submission_status = 'submitted',
                     submitted_at = ?, submitted_by = ?, quality_score = 0,
                     feedback = ?, updated_at = ? WHERE id = ?",
                    (&ts, &submitted_by, AUTO_SCORE_FEEDBACK, &ts, &plan.id),
                )
                .map_err(HandlerErr::db_update)?;
                auto_scored += 1;
            } else {
                conn.execute(
                    "UPDATE action_plans SET submission_status = 'submitted',
                     submitted_at = ?, submitted_by = ?, updated_at = ? WHERE id = ?",
                    (&ts, &submitted_by, &ts, &plan.id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            submitted += 1;
            audit::record_soft(
                conn,
                &plan.id,
                audit::CHANGE_SUBMIT,
                Some(&json!({ "submissionStatus": "draft" })),
                Some(&json!({
                    "submissionStatus": "submitted",
                    "autoScoredZero": plan.status == STATUS_NOT_ACHIEVED,
                })),
                "month finalized",
                submitted_by.as_deref(),
                now,
            );
        }

        // Carry-over pass over everything now submitted in the period, so a
        // retried finalize is idempotent: sources with an existing child are
        // skipped.
        let candidates = period_plans(conn, month, period.year, department.as_deref(), "submitted")?;
        let mut created = 0usize;
        let mut skipped_existing = 0usize;
        let mut cap_blocked: Vec<String> = Vec::new();
        for plan in &candidates {
            if plan.status != STATUS_NOT_ACHIEVED
                || plan.resolution_type.as_deref() != Some(RESOLUTION_CARRIED_OVER)
            {
                continue;
            }
            match carryover::carry_over_source(conn, plan, now, submitted_by.as_deref()) {
                Ok(CarryOutcome::Created { .. }) => created += 1,
                Ok(CarryOutcome::SkippedExisting { .. }) => skipped_existing += 1,
                Err(e) if e.code == codes::CARRY_OVER_CAP => cap_blocked.push(plan.id.clone()),
                Err(e) => return Err(e),
            }
        }

        Ok(json!({
            "month": month,
            "year": period.year,
            "submitted": submitted,
            "autoScored": auto_scored,
            "carryOver": {
                "created": created,
                "skippedExisting": skipped_existing,
                "capBlocked": cap_blocked,
            },
        }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn is_auto_scored(plan: &PlanRow) -> bool {
    plan.status == STATUS_NOT_ACHIEVED
        && plan.quality_score == Some(0.0)
        && plan.feedback.as_deref() == Some(AUTO_SCORE_FEEDBACK)
}

fn handle_recall(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let period = required_period(&req.params)?;
        let month = period.month.as_str();
        let department = opt_str(&req.params, "departmentCode");
        let actor = opt_str(&req.params, "actor");

        let submitted = period_plans(conn, month, period.year, department.as_deref(), "submitted")?;
        let ts = db::ts(now);
        let mut recalled = 0usize;
        let mut graded_untouched = 0usize;
        let mut deleted_children = 0usize;
        let mut skipped_children: Vec<String> = Vec::new();

        for plan in &submitted {
            let auto = is_auto_scored(plan);
            // Human-graded items are immutable here: this is a partial
            // recall, not all-or-nothing.
            if plan.quality_score.is_some() && !auto {
                graded_untouched += 1;
                continue;
            }

            if auto {
                conn.execute(
                    "UPDATE action_plans SET submission_status = 'draft',
                     submitted_at = NULL, submitted_by = NULL,
                     quality_score = NULL, feedback = NULL, updated_at = ?
                     WHERE id = ?",
                    (&ts, &plan.id),
                )
                .map_err(HandlerErr::db_update)?;
            } else {
                conn.execute(
                    "UPDATE action_plans SET submission_status = 'draft',
                     submitted_at = NULL, submitted_by = NULL, updated_at = ?
                     WHERE id = ?",
                    (&ts, &plan.id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            recalled += 1;
            audit::record_soft(
                conn,
                &plan.id,
                audit::CHANGE_RECALL,
                Some(&json!({ "submissionStatus": "submitted", "autoScored": auto })),
                Some(&json!({ "submissionStatus": "draft" })),
                "month recalled",
                actor.as_deref(),
                now,
            );

            // Unwind carry-over children created by the submission, but only
            // the ones nobody has touched yet.
            if plan.resolution_type.as_deref() != Some(RESOLUTION_CARRIED_OVER) {
                continue;
            }
            let children = child_plans(conn, &plan.id)?;
            for child in children {
                let untouched = child.status == "Open"
                    && child.submission_status == "draft"
                    && child.quality_score.is_none()
                    && child.deleted_at.is_none();
                if untouched {
                    conn.execute("DELETE FROM action_plans WHERE id = ?", [&child.id])
                        .map_err(HandlerErr::db_update)?;
                    deleted_children += 1;
                } else {
                    skipped_children.push(child.id.clone());
                    audit::record_soft(
                        conn,
                        &child.id,
                        audit::CHANGE_RECALL,
                        None,
                        Some(&json!({ "keptOnRecall": true, "originPlanId": plan.id })),
                        "carry-over child kept on recall: already edited",
                        actor.as_deref(),
                        now,
                    );
                }
            }
        }

        Ok(json!({
            "month": month,
            "year": period.year,
            "recalled": recalled,
            "gradedUntouched": graded_untouched,
            "deletedChildren": deleted_children,
            "skippedChildren": skipped_children,
        }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn child_plans(conn: &rusqlite::Connection, origin_id: &str) -> Result<Vec<PlanRow>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM action_plans WHERE origin_plan_id = ?",
        PLAN_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    stmt.query_map([origin_id], PlanRow::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "plans.updateStatus" => Some(handle_update_status(state, req)),
        "month.finalize" => Some(handle_finalize(state, req)),
        "month.recall" => Some(handle_recall(state, req)),
        _ => None,
    }
}

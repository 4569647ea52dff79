use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;

use crate::audit;
use crate::db;
use crate::deadline::revision_unlock_expiry;
use crate::escalation;
use crate::ipc::error::{codes, ok};
use crate::ipc::handlers::carryover::{self, outcome_json};
use crate::ipc::helpers::{
    opt_bool, opt_f64, opt_i64, opt_str, require_db, required_str, HandlerErr, PlanRow,
    CARRY_LATE_2, RESOLUTION_CARRIED_OVER, RESOLUTION_DROPPED, STATUS_ACHIEVED,
    STATUS_NOT_ACHIEVED, STATUS_ON_PROGRESS, STATUS_OPEN,
};
use crate::ipc::types::{AppState, Request};

const VERDICTS: [&str; 3] = ["revision", "carry_over", "failed"];

// The grade write is the one strictly ordered operation in the system: it is
// conditioned on the row still being submitted and ungraded, so a grade can
// never land on an item that was concurrently recalled to draft.
const GRADE_GUARD: &str = " WHERE id = ? AND submission_status = 'submitted' AND quality_score IS NULL";

fn handle_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let plan = PlanRow::load_active(conn, &id)?;

        let verdict = opt_str(&req.params, "verdict");
        let score = opt_f64(&req.params, "score");
        if let Some(s) = score {
            if !(0.0..=plan.max_possible_score).contains(&s) {
                return Err(HandlerErr::validation(format!(
                    "score must be within 0..={}",
                    plan.max_possible_score
                ))
                .with_details(json!({ "score": s, "maxPossibleScore": plan.max_possible_score })));
            }
        }

        // Fail fast with zero side effects. The authoritative race check is
        // still the guarded UPDATE below.
        if plan.submission_status != "submitted" || plan.quality_score.is_some() {
            return Err(HandlerErr::new(
                codes::ITEM_RECALLED,
                "item is not awaiting grading; refresh and retry",
            )
            .with_details(json!({
                "submissionStatus": plan.submission_status,
                "graded": plan.quality_score.is_some(),
            })));
        }

        let feedback = opt_str(&req.params, "feedback");
        let graded_by = opt_str(&req.params, "gradedBy");
        let ts = db::ts(now);

        let mut sets: Vec<String> = vec!["updated_at = ?".to_string()];
        let mut binds: Vec<Value> = vec![Value::Text(ts.clone())];
        let push = |sets: &mut Vec<String>, binds: &mut Vec<Value>, set: &str, v: Value| {
            sets.push(set.to_string());
            binds.push(v);
        };
        let mut terminal_status: Option<&str> = None;
        let mut run_carry_over = false;

        match verdict.as_deref() {
            Some("revision") => {
                let days = opt_i64(&req.params, "revisionDays").unwrap_or_else(|| {
                    db::load_lock_settings(conn)
                        .map(|s| s.revision_grace_days)
                        .unwrap_or(3)
                });
                if days < 1 {
                    return Err(HandlerErr::validation("revisionDays must be >= 1"));
                }
                let expiry = revision_unlock_expiry(now, days);
                push(&mut sets, &mut binds, "status = ?", Value::Text(STATUS_ON_PROGRESS.into()));
                sets.push("submission_status = 'draft'".into());
                sets.push("quality_score = NULL".into());
                sets.push("submitted_at = NULL".into());
                sets.push("submitted_by = NULL".into());
                push(&mut sets, &mut binds, "feedback = ?", text_or_null(feedback.clone()));
                push(
                    &mut sets,
                    &mut binds,
                    "temporary_unlock_expiry = ?",
                    Value::Text(db::ts(expiry)),
                );
            }
            Some(v @ ("carry_over" | "failed")) => {
                let Some(s) = score else {
                    return Err(HandlerErr::validation(format!(
                        "verdict {} requires a score",
                        v
                    )));
                };
                if v == "carry_over" {
                    if plan.carry_over_status == CARRY_LATE_2 {
                        return Err(HandlerErr::new(
                            codes::CARRY_OVER_CAP,
                            "plan already carried over twice; it must be resolved this period",
                        )
                        .with_details(json!({ "planId": plan.id })));
                    }
                    run_carry_over = true;
                }
                terminal_status = Some(STATUS_NOT_ACHIEVED);
                push(&mut sets, &mut binds, "status = ?", Value::Text(STATUS_NOT_ACHIEVED.into()));
                push(&mut sets, &mut binds, "quality_score = ?", Value::Real(s));
                push(&mut sets, &mut binds, "feedback = ?", text_or_null(feedback.clone()));
                push(
                    &mut sets,
                    &mut binds,
                    "resolution_type = ?",
                    Value::Text(
                        if v == "carry_over" {
                            RESOLUTION_CARRIED_OVER
                        } else {
                            RESOLUTION_DROPPED
                        }
                        .into(),
                    ),
                );
                push(&mut sets, &mut binds, "graded_at = ?", Value::Text(ts.clone()));
                push(&mut sets, &mut binds, "graded_by = ?", text_or_null(graded_by.clone()));
            }
            None if score.is_none() && opt_str(&req.params, "status").is_none() => {
                // Kickback-to-draft shortcut: no score, no verdict, no status.
                sets.push("submission_status = 'draft'".into());
                sets.push("submitted_at = NULL".into());
                sets.push("submitted_by = NULL".into());
                push(&mut sets, &mut binds, "feedback = ?", text_or_null(feedback.clone()));
            }
            None => {
                let status = required_str(&req.params, "status")?;
                if status != STATUS_ACHIEVED && status != STATUS_NOT_ACHIEVED {
                    return Err(HandlerErr::validation(
                        "grading status must be Achieved or Not Achieved",
                    ));
                }
                terminal_status = Some(if status == STATUS_ACHIEVED {
                    STATUS_ACHIEVED
                } else {
                    STATUS_NOT_ACHIEVED
                });
                push(&mut sets, &mut binds, "status = ?", Value::Text(status));
                let Some(s) = score else {
                    return Err(HandlerErr::validation("grading with a status requires a score"));
                };
                push(&mut sets, &mut binds, "quality_score = ?", Value::Real(s));
                push(&mut sets, &mut binds, "feedback = ?", text_or_null(feedback.clone()));
                push(&mut sets, &mut binds, "graded_at = ?", Value::Text(ts.clone()));
                push(&mut sets, &mut binds, "graded_by = ?", text_or_null(graded_by.clone()));
            }
            Some(other) => {
                return Err(HandlerErr::validation(format!(
                    "verdict must be one of: {} (got {})",
                    VERDICTS.join(", "),
                    other
                )))
            }
        }

        // Completion always clears a blocker.
        if terminal_status.is_some() && plan.is_blocked {
            sets.push("is_blocked = 0".into());
            sets.push("blocker_reason = NULL".into());
            sets.push("blocker_category = NULL".into());
            push(
                &mut sets,
                &mut binds,
                "attention_level = ?",
                Value::Text(escalation::LEVEL_STANDARD.into()),
            );
        }

        binds.push(Value::Text(id.clone()));
        let sql = format!(
            "UPDATE action_plans SET {}{}",
            sets.join(", "),
            GRADE_GUARD
        );
        let changed = conn
            .execute(&sql, params_from_iter(binds))
            .map_err(HandlerErr::db_update)?;
        if changed == 0 {
            return Err(HandlerErr::new(
                codes::ITEM_RECALLED,
                "grade lost the race: item was recalled to draft; refresh and retry",
            ));
        }

        audit::record_soft(
            conn,
            &id,
            audit::CHANGE_GRADE,
            Some(&json!({
                "status": plan.status,
                "qualityScore": plan.quality_score,
            })),
            Some(&json!({
                "score": score,
                "verdict": verdict,
                "feedback": feedback,
            })),
            "plan graded",
            graded_by.as_deref(),
            now,
        );
        audit::notify(
            conn,
            &id,
            "graded",
            json!({ "score": score, "verdict": verdict }),
            now,
        );

        let mut result = json!({ "plan": PlanRow::load(conn, &id)?.to_json() });
        if run_carry_over {
            let source = PlanRow::load(conn, &id)?;
            let outcome =
                carryover::carry_over_source(conn, &source, now, graded_by.as_deref())?;
            result["carryOver"] = outcome_json(&outcome);
            result["plan"] = PlanRow::load(conn, &id)?.to_json();
        }
        Ok(result)
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

// Admin-only full wipe: stronger than a revision verdict, audited under its
// own mandatory log type.
fn reset_one(
    conn: &rusqlite::Connection,
    plan: &PlanRow,
    actor: Option<&str>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), HandlerErr> {
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_update)?;
    tx.execute(
        "UPDATE action_plans SET quality_score = NULL, feedback = NULL,
         status = ?, submission_status = 'draft',
         submitted_at = NULL, submitted_by = NULL,
         graded_at = NULL, graded_by = NULL,
         outcome_link = NULL, remark = NULL,
         updated_at = ? WHERE id = ?",
        (STATUS_OPEN, db::ts(now), &plan.id),
    )
    .map_err(HandlerErr::db_update)?;
    audit::record(
        &tx,
        &plan.id,
        audit::CHANGE_GRADE_RESET,
        Some(&json!({
            "status": plan.status,
            "submissionStatus": plan.submission_status,
            "qualityScore": plan.quality_score,
        })),
        Some(&json!({ "status": STATUS_OPEN, "submissionStatus": "draft" })),
        "grade reset: score, status, and submitted evidence wiped",
        actor,
        now,
    )
    .map_err(HandlerErr::db_update)?;
    tx.commit().map_err(HandlerErr::db_update)?;
    Ok(())
}

fn handle_reset_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let actor = opt_str(&req.params, "actor");

        if opt_bool(&req.params, "all").unwrap_or(false) {
            let sql = format!(
                "SELECT {} FROM action_plans
                 WHERE deleted_at IS NULL AND submission_status = 'submitted'
                   AND quality_score IS NOT NULL",
                crate::ipc::helpers::PLAN_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
            let graded = stmt
                .query_map([], PlanRow::from_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            for plan in &graded {
                reset_one(conn, plan, actor.as_deref(), now)?;
            }
            return Ok(json!({ "reset": graded.len() }));
        }

        let id = required_str(&req.params, "id")?;
        let plan = PlanRow::load_active(conn, &id)?;
        reset_one(conn, &plan, actor.as_deref(), now)?;
        Ok(json!({ "plan": PlanRow::load(conn, &id)?.to_json() }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.grade" => Some(handle_grade(state, req)),
        "grading.resetGrade" => Some(handle_reset_grade(state, req)),
        _ => None,
    }
}

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::db;
use crate::deadline;
use crate::ipc::error::{codes, ok};
use crate::ipc::helpers::{
    opt_str, require_db, required_str, HandlerErr, PlanRow, CARRY_LATE_1, CARRY_LATE_2,
    RESOLUTION_CARRIED_OVER, STATUS_NOT_ACHIEVED,
};
use crate::ipc::types::{AppState, Request};

const LATE_1_SCORE_CAP: f64 = 80.0;
const LATE_2_SCORE_CAP: f64 = 50.0;

pub enum CarryOutcome {
    Created { child_id: String },
    SkippedExisting { child_id: String },
}

/// Creates (or finds) the successor plan for a failed, carried-over source.
///
/// Idempotent per source: an existing child referencing the source via
/// origin_plan_id short-circuits, so retried finalize calls and duplicate
/// triggers never fan out into duplicates.
pub fn carry_over_source(
    conn: &Connection,
    source: &PlanRow,
    now: DateTime<Utc>,
    actor: Option<&str>,
) -> Result<CarryOutcome, HandlerErr> {
    if source.carry_over_status == CARRY_LATE_2 {
        return Err(HandlerErr::new(
            codes::CARRY_OVER_CAP,
            "plan already carried over twice; it must be resolved this period",
        )
        .with_details(json!({ "planId": source.id })));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM action_plans WHERE origin_plan_id = ? LIMIT 1",
            [&source.id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if let Some(child_id) = existing {
        return Ok(CarryOutcome::SkippedExisting { child_id });
    }

    let mi = deadline::month_index(&source.month).ok_or_else(|| {
        HandlerErr::validation(format!("plan month is unparseable: {}", source.month))
    })?;
    let (next_mi, next_year) = deadline::next_period(mi, source.year as i32);
    let next_month = deadline::month_name(next_mi)
        .ok_or_else(|| HandlerErr::validation("month rollover out of range"))?;

    let (child_carry, score_cap) = if source.carry_over_status == CARRY_LATE_1 {
        (CARRY_LATE_2, LATE_2_SCORE_CAP)
    } else {
        (CARRY_LATE_1, LATE_1_SCORE_CAP)
    };

    let child_id = Uuid::new_v4().to_string();
    let ts = db::ts(now);
    conn.execute(
        "INSERT INTO action_plans(
            id, company_id, department_code, month, year,
            goal_strategy, action_plan, indicator, pic,
            max_possible_score, origin_plan_id, carry_over_status,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &child_id,
            &source.company_id,
            &source.department_code,
            next_month,
            next_year as i64,
            &source.goal_strategy,
            &source.action_plan,
            &source.indicator,
            &source.pic,
            score_cap,
            &source.id,
            child_carry,
            &ts,
            &ts,
        ),
    )
    .map_err(HandlerErr::db_insert)?;

    audit::record_soft(
        conn,
        &source.id,
        audit::CHANGE_CARRY_OVER,
        Some(&json!({ "carryOverStatus": source.carry_over_status })),
        Some(&json!({
            "childId": child_id,
            "childCarryOverStatus": child_carry,
            "childMaxPossibleScore": score_cap,
            "childMonth": next_month,
            "childYear": next_year,
        })),
        "carry-over child created",
        actor,
        now,
    );

    Ok(CarryOutcome::Created { child_id })
}

pub fn outcome_json(outcome: &CarryOutcome) -> serde_json::Value {
    match outcome {
        CarryOutcome::Created { child_id } => json!({
            "created": true,
            "childId": child_id,
        }),
        CarryOutcome::SkippedExisting { child_id } => json!({
            "created": false,
            "childId": child_id,
        }),
    }
}

// Manual trigger for a source that finalize missed (e.g. tagged after the
// month was finalized).
fn handle_trigger(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let now = state.now();
        let id = required_str(&req.params, "id")?;
        let plan = PlanRow::load_active(conn, &id)?;

        if plan.submission_status != "submitted"
            || plan.status != STATUS_NOT_ACHIEVED
            || plan.resolution_type.as_deref() != Some(RESOLUTION_CARRIED_OVER)
        {
            return Err(HandlerErr::validation(
                "carry-over requires a submitted Not Achieved plan tagged carried_over",
            )
            .with_details(json!({
                "status": plan.status,
                "submissionStatus": plan.submission_status,
                "resolutionType": plan.resolution_type,
            })));
        }

        let outcome =
            carry_over_source(conn, &plan, now, opt_str(&req.params, "actor").as_deref())?;
        Ok(outcome_json(&outcome))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "carryover.trigger" => Some(handle_trigger(state, req)),
        _ => None,
    }
}

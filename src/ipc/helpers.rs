use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

use crate::db;
use crate::deadline::{self, PlanLockInput};
use crate::ipc::error::{codes, err};
use crate::ipc::types::AppState;

pub const STATUS_OPEN: &str = "Open";
pub const STATUS_ON_PROGRESS: &str = "On Progress";
pub const STATUS_BLOCKED: &str = "Blocked";
pub const STATUS_ACHIEVED: &str = "Achieved";
pub const STATUS_NOT_ACHIEVED: &str = "Not Achieved";

pub const STATUSES: [&str; 5] = [
    STATUS_OPEN,
    STATUS_ON_PROGRESS,
    STATUS_BLOCKED,
    STATUS_ACHIEVED,
    STATUS_NOT_ACHIEVED,
];

pub fn is_terminal_status(status: &str) -> bool {
    status == STATUS_ACHIEVED || status == STATUS_NOT_ACHIEVED
}

pub const CARRY_LATE_1: &str = "Late_Month_1";
pub const CARRY_LATE_2: &str = "Late_Month_2";

pub const RESOLUTION_CARRIED_OVER: &str = "carried_over";
pub const RESOLUTION_DROPPED: &str = "dropped";

/// Feedback string stamped on items auto-scored at submission. Recall keys
/// off it to tell system zeros from human-graded zeros.
pub const AUTO_SCORE_FEEDBACK: &str = "Auto-scored 0: target not achieved at submission";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new(codes::BAD_PARAMS, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(codes::VALIDATION, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn db_query(e: impl std::fmt::Display) -> Self {
        Self::new(codes::DB_QUERY_FAILED, e.to_string())
    }

    pub fn db_update(e: impl std::fmt::Display) -> Self {
        Self::new(codes::DB_UPDATE_FAILED, e.to_string())
    }

    pub fn db_insert(e: impl std::fmt::Display) -> Self {
        Self::new(codes::DB_INSERT_FAILED, e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new(codes::NO_WORKSPACE, "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn opt_f64(params: &serde_json::Value, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

pub fn opt_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// A (month, year) period taken from request params. The month is validated
/// and canonicalized to its full name so period queries match on equality.
pub struct Period {
    pub month: String,
    pub year: i32,
}

pub fn required_period(params: &serde_json::Value) -> Result<Period, HandlerErr> {
    let raw = required_str(params, "month")?;
    let month_index = deadline::month_index(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unrecognized month: {}", raw)))?;
    let month = deadline::month_name(month_index)
        .ok_or_else(|| HandlerErr::bad_params("unrecognized month"))?
        .to_string();
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing year"))? as i32;
    Ok(Period { month, year })
}

#[derive(Debug, Clone)]
pub struct PlanRow {
    pub id: String,
    pub company_id: String,
    pub department_code: String,
    pub month: String,
    pub year: i64,
    pub goal_strategy: Option<String>,
    pub action_plan: Option<String>,
    pub indicator: Option<String>,
    pub pic: Option<String>,
    pub evidence: Option<String>,
    pub outcome_link: Option<String>,
    pub attachments: Option<String>,
    pub remark: Option<String>,
    pub status: String,
    pub submission_status: String,
    pub quality_score: Option<f64>,
    pub max_possible_score: f64,
    pub feedback: Option<String>,
    pub submitted_at: Option<String>,
    pub submitted_by: Option<String>,
    pub graded_at: Option<String>,
    pub graded_by: Option<String>,
    pub unlock_status: Option<String>,
    pub unlock_reason: Option<String>,
    pub unlock_requested_at: Option<String>,
    pub approved_by: Option<String>,
    pub approved_until: Option<String>,
    pub rejection_reason: Option<String>,
    pub temporary_unlock_expiry: Option<String>,
    pub is_blocked: bool,
    pub blocker_reason: Option<String>,
    pub blocker_category: Option<String>,
    pub attention_level: String,
    pub gap_category: Option<String>,
    pub gap_analysis: Option<String>,
    pub specify_reason: Option<String>,
    pub origin_plan_id: Option<String>,
    pub resolution_type: Option<String>,
    pub carry_over_status: String,
    pub deleted_at: Option<String>,
    pub deleted_by: Option<String>,
    pub deletion_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub const PLAN_COLUMNS: &str = "id, company_id, department_code, month, year, \
    goal_strategy, action_plan, indicator, pic, evidence, outcome_link, attachments, remark, \
    status, submission_status, quality_score, max_possible_score, feedback, \
    submitted_at, submitted_by, graded_at, graded_by, \
    unlock_status, unlock_reason, unlock_requested_at, approved_by, approved_until, \
    rejection_reason, temporary_unlock_expiry, \
    is_blocked, blocker_reason, blocker_category, attention_level, \
    gap_category, gap_analysis, specify_reason, \
    origin_plan_id, resolution_type, carry_over_status, \
    deleted_at, deleted_by, deletion_reason, created_at, updated_at";

impl PlanRow {
    pub fn from_row(r: &Row) -> rusqlite::Result<PlanRow> {
        Ok(PlanRow {
            id: r.get(0)?,
            company_id: r.get(1)?,
            department_code: r.get(2)?,
            month: r.get(3)?,
            year: r.get(4)?,
            goal_strategy: r.get(5)?,
            action_plan: r.get(6)?,
            indicator: r.get(7)?,
            pic: r.get(8)?,
            evidence: r.get(9)?,
            outcome_link: r.get(10)?,
            attachments: r.get(11)?,
            remark: r.get(12)?,
            status: r.get(13)?,
            submission_status: r.get(14)?,
            quality_score: r.get(15)?,
            max_possible_score: r.get(16)?,
            feedback: r.get(17)?,
            submitted_at: r.get(18)?,
            submitted_by: r.get(19)?,
            graded_at: r.get(20)?,
            graded_by: r.get(21)?,
            unlock_status: r.get(22)?,
            unlock_reason: r.get(23)?,
            unlock_requested_at: r.get(24)?,
            approved_by: r.get(25)?,
            approved_until: r.get(26)?,
            rejection_reason: r.get(27)?,
            temporary_unlock_expiry: r.get(28)?,
            is_blocked: r.get::<_, i64>(29)? != 0,
            blocker_reason: r.get(30)?,
            blocker_category: r.get(31)?,
            attention_level: r.get(32)?,
            gap_category: r.get(33)?,
            gap_analysis: r.get(34)?,
            specify_reason: r.get(35)?,
            origin_plan_id: r.get(36)?,
            resolution_type: r.get(37)?,
            carry_over_status: r.get(38)?,
            deleted_at: r.get(39)?,
            deleted_by: r.get(40)?,
            deletion_reason: r.get(41)?,
            created_at: r.get(42)?,
            updated_at: r.get(43)?,
        })
    }

    pub fn load(conn: &Connection, id: &str) -> Result<PlanRow, HandlerErr> {
        let sql = format!("SELECT {} FROM action_plans WHERE id = ?", PLAN_COLUMNS);
        conn.query_row(&sql, [id], PlanRow::from_row)
            .optional()
            .map_err(HandlerErr::db_query)?
            .ok_or_else(|| {
                HandlerErr::not_found("plan not found").with_details(json!({ "id": id }))
            })
    }

    /// Like [`load`], but treats a soft-deleted row as missing.
    pub fn load_active(conn: &Connection, id: &str) -> Result<PlanRow, HandlerErr> {
        let plan = PlanRow::load(conn, id)?;
        if plan.deleted_at.is_some() {
            return Err(
                HandlerErr::not_found("plan is deleted").with_details(json!({ "id": id }))
            );
        }
        Ok(plan)
    }

    pub fn lock_input(&self) -> PlanLockInput<'_> {
        PlanLockInput {
            month: &self.month,
            year: Some(self.year as i32),
            unlock_status: self.unlock_status.as_deref(),
            approved_until: self.approved_until.as_deref().and_then(db::parse_ts),
            temporary_unlock_expiry: self
                .temporary_unlock_expiry
                .as_deref()
                .and_then(db::parse_ts),
        }
    }

    pub fn is_graded(&self) -> bool {
        self.submission_status == "submitted" && self.quality_score.is_some()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "companyId": self.company_id,
            "departmentCode": self.department_code,
            "month": self.month,
            "year": self.year,
            "goalStrategy": self.goal_strategy,
            "actionPlan": self.action_plan,
            "indicator": self.indicator,
            "pic": self.pic,
            "evidence": self.evidence,
            "outcomeLink": self.outcome_link,
            "attachments": self.attachments,
            "remark": self.remark,
            "status": self.status,
            "submissionStatus": self.submission_status,
            "qualityScore": self.quality_score,
            "maxPossibleScore": self.max_possible_score,
            "feedback": self.feedback,
            "submittedAt": self.submitted_at,
            "submittedBy": self.submitted_by,
            "gradedAt": self.graded_at,
            "gradedBy": self.graded_by,
            "unlockStatus": self.unlock_status,
            "unlockReason": self.unlock_reason,
            "unlockRequestedAt": self.unlock_requested_at,
            "approvedBy": self.approved_by,
            "approvedUntil": self.approved_until,
            "rejectionReason": self.rejection_reason,
            "temporaryUnlockExpiry": self.temporary_unlock_expiry,
            "isBlocked": self.is_blocked,
            "blockerReason": self.blocker_reason,
            "blockerCategory": self.blocker_category,
            "attentionLevel": self.attention_level,
            "gapCategory": self.gap_category,
            "gapAnalysis": self.gap_analysis,
            "specifyReason": self.specify_reason,
            "originPlanId": self.origin_plan_id,
            "resolutionType": self.resolution_type,
            "carryOverStatus": self.carry_over_status,
            "deletedAt": self.deleted_at,
            "deletedBy": self.deleted_by,
            "deletionReason": self.deletion_reason,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

/// Mandatory pre-flight for every lock-gated write: re-reads LockSettings
/// from the store (never a cached copy) and evaluates the plan's period.
pub fn ensure_unlocked(
    conn: &Connection,
    plan: &PlanRow,
    admin_override: bool,
    now: DateTime<Utc>,
) -> Result<(), HandlerErr> {
    if admin_override {
        return Ok(());
    }
    let settings = db::load_lock_settings(conn).map_err(HandlerErr::db_query)?;
    if deadline::is_locked(&plan.lock_input(), &settings, now) {
        let deadline = deadline::resolve_deadline(
            &plan.month,
            Some(plan.year as i32),
            settings.lock_cutoff_day,
            &settings.overrides,
        );
        return Err(HandlerErr::new(
            codes::PERIOD_LOCKED,
            "reporting period is locked; request an unlock to edit",
        )
        .with_details(json!({
            "planId": plan.id,
            "month": plan.month,
            "year": plan.year,
            "deadline": deadline.map(db::ts),
        })));
    }
    Ok(())
}

/// Period-level variant of the lock pre-flight for month-wide operations
/// (finalize). Per-plan grants do not apply here.
pub fn ensure_period_unlocked(
    conn: &Connection,
    month: &str,
    year: i32,
    admin_override: bool,
    now: DateTime<Utc>,
) -> Result<(), HandlerErr> {
    if admin_override {
        return Ok(());
    }
    let settings = db::load_lock_settings(conn).map_err(HandlerErr::db_query)?;
    let input = PlanLockInput {
        month,
        year: Some(year),
        unlock_status: None,
        approved_until: None,
        temporary_unlock_expiry: None,
    };
    if deadline::is_locked(&input, &settings, now) {
        return Err(HandlerErr::new(
            codes::PERIOD_LOCKED,
            "reporting period is locked",
        )
        .with_details(json!({ "month": month, "year": year })));
    }
    Ok(())
}

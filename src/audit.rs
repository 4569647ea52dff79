use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::db;

pub const CHANGE_CREATE: &str = "CREATE";
pub const CHANGE_FIELD_UPDATE: &str = "FIELD_UPDATE";
pub const CHANGE_STATUS_UPDATE: &str = "STATUS_UPDATE";
pub const CHANGE_SUBMIT: &str = "SUBMIT";
pub const CHANGE_RECALL: &str = "RECALL";
pub const CHANGE_GRADE: &str = "GRADE";
pub const CHANGE_GRADE_RESET: &str = "GRADE_RESET";
pub const CHANGE_UNLOCK_REQUEST: &str = "UNLOCK_REQUEST";
pub const CHANGE_UNLOCK_DECISION: &str = "UNLOCK_DECISION";
pub const CHANGE_BLOCKER_REPORT: &str = "BLOCKER_REPORT";
pub const CHANGE_BLOCKER_RESOLVE: &str = "BLOCKER_RESOLVE";
pub const CHANGE_CARRY_OVER: &str = "CARRY_OVER";
pub const CHANGE_SOFT_DELETE: &str = "SOFT_DELETE";
pub const CHANGE_RESTORE: &str = "RESTORE";

/// Appends an audit record. Callers on the mandatory paths (STATUS_UPDATE,
/// GRADE_RESET) must propagate the error; everything else goes through
/// [`record_soft`].
pub fn record(
    conn: &Connection,
    plan_id: &str,
    change_type: &str,
    previous_value: Option<&serde_json::Value>,
    new_value: Option<&serde_json::Value>,
    description: &str,
    actor: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(id, plan_id, change_type, previous_value, new_value, description, actor, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            plan_id,
            change_type,
            previous_value.map(|v| v.to_string()),
            new_value.map(|v| v.to_string()),
            description,
            actor,
            db::ts(now),
        ),
    )?;
    Ok(())
}

/// Best-effort audit append: a failure is logged to stderr and swallowed.
pub fn record_soft(
    conn: &Connection,
    plan_id: &str,
    change_type: &str,
    previous_value: Option<&serde_json::Value>,
    new_value: Option<&serde_json::Value>,
    description: &str,
    actor: Option<&str>,
    now: DateTime<Utc>,
) {
    if let Err(e) = record(
        conn,
        plan_id,
        change_type,
        previous_value,
        new_value,
        description,
        actor,
        now,
    ) {
        eprintln!("plantrackd: audit append failed ({change_type}): {e}");
    }
}

/// Best-effort notification outbox write: the dispatcher is informed, never
/// required to succeed.
pub fn notify(
    conn: &Connection,
    plan_id: &str,
    kind: &str,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) {
    let res = conn.execute(
        "INSERT INTO notifications(id, plan_id, kind, payload, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            plan_id,
            kind,
            payload.to_string(),
            db::ts(now),
        ),
    );
    if let Err(e) = res {
        eprintln!("plantrackd: notification enqueue failed ({kind}): {e}");
    }
}

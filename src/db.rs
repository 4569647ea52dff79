use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;

use crate::deadline::{LockSettings, MonthlyOverride};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("plantrack.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS action_plans(
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            department_code TEXT NOT NULL,
            month TEXT NOT NULL,
            year INTEGER NOT NULL,
            goal_strategy TEXT,
            action_plan TEXT,
            indicator TEXT,
            pic TEXT,
            evidence TEXT,
            outcome_link TEXT,
            attachments TEXT,
            remark TEXT,
            status TEXT NOT NULL DEFAULT 'Open',
            submission_status TEXT NOT NULL DEFAULT 'draft',
            quality_score REAL,
            max_possible_score REAL NOT NULL DEFAULT 100,
            feedback TEXT,
            submitted_at TEXT,
            submitted_by TEXT,
            graded_at TEXT,
            graded_by TEXT,
            unlock_status TEXT,
            unlock_reason TEXT,
            unlock_requested_at TEXT,
            approved_by TEXT,
            approved_until TEXT,
            rejection_reason TEXT,
            temporary_unlock_expiry TEXT,
            is_blocked INTEGER NOT NULL DEFAULT 0,
            blocker_reason TEXT,
            blocker_category TEXT,
            attention_level TEXT NOT NULL DEFAULT 'Standard',
            gap_category TEXT,
            gap_analysis TEXT,
            specify_reason TEXT,
            origin_plan_id TEXT,
            resolution_type TEXT,
            carry_over_status TEXT NOT NULL DEFAULT 'Normal',
            deleted_at TEXT,
            deleted_by TEXT,
            deletion_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    // origin_plan_id is a weak reference on purpose: deleting a parent must
    // never cascade, and orphan children stay valid.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plans_period ON action_plans(year, month)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plans_department ON action_plans(department_code)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plans_origin ON action_plans(origin_plan_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plans_deleted ON action_plans(deleted_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lock_settings(
            id INTEGER PRIMARY KEY CHECK (id = 1),
            is_lock_enabled INTEGER NOT NULL DEFAULT 1,
            lock_cutoff_day INTEGER NOT NULL DEFAULT 6
        )",
        [],
    )?;
    // Grace-window knobs arrived after the first schema cut. Add and default
    // if missing.
    ensure_lock_settings_grace_columns(&conn)?;
    conn.execute(
        "INSERT OR IGNORE INTO lock_settings(id, is_lock_enabled, lock_cutoff_day, revision_grace_days, unlock_grant_days)
         VALUES(1, 1, 6, 3, 7)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS monthly_overrides(
            month_index INTEGER NOT NULL,
            year INTEGER NOT NULL,
            lock_date TEXT,
            is_force_open INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(month_index, year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            change_type TEXT NOT NULL,
            previous_value TEXT,
            new_value TEXT,
            description TEXT,
            actor TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_plan ON audit_log(plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_plan ON notifications(plan_id)",
        [],
    )?;

    ensure_plans_temporary_unlock(&conn)?;

    Ok(conn)
}

fn ensure_lock_settings_grace_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "lock_settings", "revision_grace_days")? {
        conn.execute(
            "ALTER TABLE lock_settings ADD COLUMN revision_grace_days INTEGER NOT NULL DEFAULT 3",
            [],
        )?;
    }
    if !table_has_column(conn, "lock_settings", "unlock_grant_days")? {
        conn.execute(
            "ALTER TABLE lock_settings ADD COLUMN unlock_grant_days INTEGER NOT NULL DEFAULT 7",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn ensure_plans_temporary_unlock(conn: &Connection) -> anyhow::Result<()> {
    // Revision-verdict grace windows postdate the original action_plans
    // schema.
    if table_has_column(conn, "action_plans", "temporary_unlock_expiry")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE action_plans ADD COLUMN temporary_unlock_expiry TEXT",
        [],
    )?;
    Ok(())
}

/// Fresh read of lock settings and overrides, straight from the store.
///
/// Every mutating handler calls this at entry; nothing caches settings
/// across requests, so an admin change is always seen by the next write.
pub fn load_lock_settings(conn: &Connection) -> anyhow::Result<LockSettings> {
    let (is_lock_enabled, lock_cutoff_day, revision_grace_days, unlock_grant_days) = conn
        .query_row(
            "SELECT is_lock_enabled, lock_cutoff_day, revision_grace_days, unlock_grant_days
             FROM lock_settings WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, i64>(0)? != 0,
                    r.get::<_, i64>(1)? as u32,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )?;

    let mut stmt = conn.prepare(
        "SELECT month_index, year, lock_date, is_force_open FROM monthly_overrides
         ORDER BY year, month_index",
    )?;
    let overrides = stmt
        .query_map([], |r| {
            Ok(MonthlyOverride {
                month_index: r.get::<_, i64>(0)? as u32,
                year: r.get::<_, i64>(1)? as i32,
                lock_date: r
                    .get::<_, Option<String>>(2)?
                    .as_deref()
                    .and_then(parse_ts),
                is_force_open: r.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LockSettings {
        is_lock_enabled,
        lock_cutoff_day,
        revision_grace_days,
        unlock_grant_days,
        overrides,
    })
}

pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.to_utc())
}

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{opt_bool, opt_i64, opt_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn settings_json(settings: &crate::deadline::LockSettings) -> serde_json::Value {
    json!({
        "isLockEnabled": settings.is_lock_enabled,
        "lockCutoffDay": settings.lock_cutoff_day,
        "revisionGraceDays": settings.revision_grace_days,
        "unlockGrantDays": settings.unlock_grant_days,
        "monthlyOverrides": settings.overrides.iter().map(|o| json!({
            "monthIndex": o.month_index,
            "year": o.year,
            "lockDate": o.lock_date.map(db::ts),
            "isForceOpen": o.is_force_open,
        })).collect::<Vec<_>>(),
    })
}

fn handle_get_lock(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let settings = db::load_lock_settings(conn).map_err(HandlerErr::db_query)?;
        Ok(settings_json(&settings))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_update_lock(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let mut settings = db::load_lock_settings(conn).map_err(HandlerErr::db_query)?;

        if let Some(v) = opt_bool(&req.params, "isLockEnabled") {
            settings.is_lock_enabled = v;
        }
        if let Some(v) = opt_i64(&req.params, "lockCutoffDay") {
            if !(1..=28).contains(&v) {
                return Err(HandlerErr::validation("lockCutoffDay must be 1..=28")
                    .with_details(json!({ "lockCutoffDay": v })));
            }
            settings.lock_cutoff_day = v as u32;
        }
        if let Some(v) = opt_i64(&req.params, "revisionGraceDays") {
            if v < 1 {
                return Err(HandlerErr::validation("revisionGraceDays must be >= 1"));
            }
            settings.revision_grace_days = v;
        }
        if let Some(v) = opt_i64(&req.params, "unlockGrantDays") {
            if v < 1 {
                return Err(HandlerErr::validation("unlockGrantDays must be >= 1"));
            }
            settings.unlock_grant_days = v;
        }

        conn.execute(
            "UPDATE lock_settings SET is_lock_enabled = ?, lock_cutoff_day = ?,
             revision_grace_days = ?, unlock_grant_days = ? WHERE id = 1",
            (
                settings.is_lock_enabled as i64,
                settings.lock_cutoff_day as i64,
                settings.revision_grace_days,
                settings.unlock_grant_days,
            ),
        )
        .map_err(HandlerErr::db_update)?;

        Ok(settings_json(&settings))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_set_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let month_index = opt_i64(&req.params, "monthIndex")
            .ok_or_else(|| HandlerErr::bad_params("missing monthIndex"))?;
        if !(1..=12).contains(&month_index) {
            return Err(HandlerErr::validation("monthIndex must be 1..=12"));
        }
        let year = opt_i64(&req.params, "year")
            .ok_or_else(|| HandlerErr::bad_params("missing year"))?;

        let lock_date = match opt_str(&req.params, "lockDate") {
            Some(raw) => {
                let parsed = db::parse_ts(&raw).ok_or_else(|| {
                    HandlerErr::validation(format!("lockDate must be RFC 3339: {}", raw))
                })?;
                Some(db::ts(parsed))
            }
            None => None,
        };
        let is_force_open = opt_bool(&req.params, "isForceOpen").unwrap_or(false);

        conn.execute(
            "INSERT INTO monthly_overrides(month_index, year, lock_date, is_force_open)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(month_index, year) DO UPDATE SET
               lock_date = excluded.lock_date,
               is_force_open = excluded.is_force_open",
            (month_index, year, &lock_date, is_force_open as i64),
        )
        .map_err(HandlerErr::db_insert)?;

        Ok(json!({
            "monthIndex": month_index,
            "year": year,
            "lockDate": lock_date,
            "isForceOpen": is_force_open,
        }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_clear_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let month_index = opt_i64(&req.params, "monthIndex")
            .ok_or_else(|| HandlerErr::bad_params("missing monthIndex"))?;
        let year = opt_i64(&req.params, "year")
            .ok_or_else(|| HandlerErr::bad_params("missing year"))?;
        let removed = conn
            .execute(
                "DELETE FROM monthly_overrides WHERE month_index = ? AND year = ?",
                (month_index, year),
            )
            .map_err(HandlerErr::db_update)?;
        Ok(json!({ "removed": removed > 0 }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.getLock" => Some(handle_get_lock(state, req)),
        "settings.updateLock" => Some(handle_update_lock(state, req)),
        "settings.setMonthlyOverride" => Some(handle_set_override(state, req)),
        "settings.clearMonthlyOverride" => Some(handle_clear_override(state, req)),
        _ => None,
    }
}

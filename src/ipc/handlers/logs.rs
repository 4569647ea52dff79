use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{opt_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let mut sql = String::from(
            "SELECT id, plan_id, change_type, previous_value, new_value, description, actor, created_at
             FROM audit_log WHERE 1 = 1",
        );
        let mut binds: Vec<Value> = Vec::new();
        if let Some(plan_id) = opt_str(&req.params, "planId") {
            sql.push_str(" AND plan_id = ?");
            binds.push(Value::Text(plan_id));
        }
        if let Some(change_type) = opt_str(&req.params, "changeType") {
            sql.push_str(" AND change_type = ?");
            binds.push(Value::Text(change_type));
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
        let entries = stmt
            .query_map(params_from_iter(binds), |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "planId": r.get::<_, String>(1)?,
                    "changeType": r.get::<_, String>(2)?,
                    "previousValue": parse_or_raw(r.get::<_, Option<String>>(3)?),
                    "newValue": parse_or_raw(r.get::<_, Option<String>>(4)?),
                    "description": r.get::<_, Option<String>>(5)?,
                    "actor": r.get::<_, Option<String>>(6)?,
                    "createdAt": r.get::<_, String>(7)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        Ok(json!({ "entries": entries }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn parse_or_raw(v: Option<String>) -> serde_json::Value {
    match v {
        None => serde_json::Value::Null,
        Some(s) => serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)),
    }
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = require_db(state)?;
        let mut sql = String::from(
            "SELECT id, plan_id, kind, payload, created_at FROM notifications WHERE 1 = 1",
        );
        let mut binds: Vec<Value> = Vec::new();
        if let Some(plan_id) = opt_str(&req.params, "planId") {
            sql.push_str(" AND plan_id = ?");
            binds.push(Value::Text(plan_id));
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
        let entries = stmt
            .query_map(params_from_iter(binds), |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "planId": r.get::<_, String>(1)?,
                    "kind": r.get::<_, String>(2)?,
                    "payload": parse_or_raw(r.get::<_, Option<String>>(3)?),
                    "createdAt": r.get::<_, String>(4)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        Ok(json!({ "notifications": entries }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        "notifications.list" => Some(handle_notifications_list(state, req)),
        _ => None,
    }
}

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "clockPinned": state.now_override.is_some(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

// Tests pin the clock so deadline and expiry math is deterministic. All
// handlers read time through AppState::now().
fn handle_clock_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("now").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.now", None);
    };
    let Some(now) = db::parse_ts(raw) else {
        return err(
            &req.id,
            "bad_params",
            format!("now must be RFC 3339: {}", raw),
            None,
        );
    };
    state.now_override = Some(now);
    ok(&req.id, json!({ "now": db::ts(now) }))
}

fn handle_clock_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.now_override = None;
    ok(&req.id, json!({ "cleared": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "clock.set" => Some(handle_clock_set(state, req)),
        "clock.clear" => Some(handle_clock_clear(state, req)),
        _ => None,
    }
}

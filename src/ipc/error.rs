use serde_json::json;

/// Stable error codes surfaced to the caller. Lock and validation failures
/// are raised before any write; `ITEM_RECALLED` only after losing the grade
/// compare-and-swap.
pub mod codes {
    pub const PERIOD_LOCKED: &str = "period_locked";
    pub const ITEM_RECALLED: &str = "item_recalled";
    pub const VALIDATION: &str = "validation";
    pub const CARRY_OVER_CAP: &str = "carry_over_cap";
    pub const BAD_PARAMS: &str = "bad_params";
    pub const NOT_FOUND: &str = "not_found";
    pub const NO_WORKSPACE: &str = "no_workspace";
    pub const DB_QUERY_FAILED: &str = "db_query_failed";
    pub const DB_INSERT_FAILED: &str = "db_insert_failed";
    pub const DB_UPDATE_FAILED: &str = "db_update_failed";
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

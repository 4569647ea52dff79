use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_plantrackd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn plantrackd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value["error"]["code"]
        .as_str()
        .expect("error code")
        .to_string()
}

#[test]
fn create_update_soft_delete_restore() {
    let workspace = temp_dir("plantrack-crud");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "clock.set",
        json!({ "now": "2026-01-15T09:00:00Z" }),
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "plans.create",
        json!({ "companyId": "acme", "departmentCode": "IT", "month": "Smarch", "year": 2026 }),
    );
    assert_eq!(code, "bad_params");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "plans.create",
        json!({
            "companyId": "acme",
            "departmentCode": "IT",
            "month": "january",
            "year": 2026,
            "goalStrategy": "Lift uptime",
            "actionPlan": "Migrate to redundant links",
            "indicator": "Uptime percentage",
            "pic": "Agus"
        }),
    );
    let plan_id = created["plan"]["id"].as_str().expect("plan id").to_string();
    assert_eq!(created["plan"]["month"].as_str(), Some("January"));
    assert_eq!(created["plan"]["status"].as_str(), Some("Open"));
    assert_eq!(created["plan"]["submissionStatus"].as_str(), Some("draft"));
    assert_eq!(created["plan"]["maxPossibleScore"].as_f64(), Some(100.0));

    // Grading fields never move through the generic update.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "5",
        "plans.update",
        json!({ "id": plan_id, "fields": { "qualityScore": 50 } }),
    );
    assert_eq!(code, "validation");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "plans.update",
        json!({ "id": plan_id, "fields": {} }),
    );
    assert_eq!(code, "validation");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "plans.update",
        json!({ "id": plan_id, "fields": { "goalStrategy": "Lift uptime to 99.9", "remark": null } }),
    );
    assert_eq!(
        updated["plan"]["goalStrategy"].as_str(),
        Some("Lift uptime to 99.9")
    );

    let audit = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "audit.list",
        json!({ "planId": plan_id }),
    );
    let types: Vec<&str> = audit["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .filter_map(|e| e["changeType"].as_str())
        .collect();
    assert!(types.contains(&"CREATE"));
    assert!(types.contains(&"FIELD_UPDATE"));

    // Soft delete needs a reason, hides the plan, and is reversible.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "9",
        "plans.softDelete",
        json!({ "id": plan_id }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "10",
        "plans.softDelete",
        json!({ "id": plan_id, "reason": "   " }),
    );
    assert_eq!(code, "validation");
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "plans.softDelete",
        json!({ "id": plan_id, "reason": "duplicate entry", "deletedBy": "agus" }),
    );
    assert_eq!(deleted["deleted"].as_bool(), Some(true));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "plans.list",
        json!({ "departmentCode": "IT" }),
    );
    assert_eq!(listed["plans"].as_array().expect("plans").len(), 0);
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "plans.list",
        json!({ "departmentCode": "IT", "includeDeleted": true }),
    );
    let rows = listed["plans"].as_array().expect("plans");
    assert_eq!(rows.len(), 1);
    assert!(rows[0]["deletedAt"].as_str().is_some());
    assert_eq!(rows[0]["deletionReason"].as_str(), Some("duplicate entry"));

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "14",
        "plans.update",
        json!({ "id": plan_id, "fields": { "remark": "editing a tombstone" } }),
    );
    assert_eq!(code, "not_found");

    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "plans.restore",
        json!({ "id": plan_id }),
    );
    assert!(restored["plan"]["deletedAt"].is_null());
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "16",
        "plans.restore",
        json!({ "id": plan_id }),
    );
    assert_eq!(code, "validation");
}

#[test]
fn purge_leaves_children_as_valid_orphans() {
    let workspace = temp_dir("plantrack-purge");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "clock.set",
        json!({ "now": "2026-01-15T09:00:00Z" }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "plans.create",
        json!({
            "companyId": "acme",
            "departmentCode": "IT",
            "month": "January",
            "year": 2026,
            "goalStrategy": "Retire legacy servers",
            "actionPlan": "Decommission rack by rack",
            "indicator": "Servers remaining",
            "pic": "Agus"
        }),
    );
    let parent_id = created["plan"]["id"].as_str().expect("plan id").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "plans.updateStatus",
        json!({ "id": parent_id, "status": "Not Achieved" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "plans.update",
        json!({ "id": parent_id, "fields": { "resolutionType": "carried_over" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "month.finalize",
        json!({ "month": "January", "year": 2026 }),
    );

    let feb = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "plans.list",
        json!({ "month": "February", "year": 2026 }),
    );
    let child_id = feb["plans"].as_array().expect("plans")[0]["id"]
        .as_str()
        .expect("child id")
        .to_string();

    let purged = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "plans.purge",
        json!({ "id": parent_id }),
    );
    assert_eq!(purged["purged"].as_bool(), Some(true));
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "9",
        "plans.get",
        json!({ "id": parent_id }),
    );
    assert_eq!(code, "not_found");

    // The child keeps its lineage pointer even though the parent is gone.
    let child = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "plans.get",
        json!({ "id": child_id }),
    );
    assert_eq!(
        child["plan"]["originPlanId"].as_str(),
        Some(parent_id.as_str())
    );

    let purged = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "plans.purge",
        json!({ "id": parent_id }),
    );
    assert_eq!(purged["purged"].as_bool(), Some(false));
}

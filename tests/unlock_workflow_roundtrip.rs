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
fn unlock_grants_expire_reject_and_revoke() {
    let workspace = temp_dir("plantrack-unlock");
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
        json!({ "now": "2026-01-10T09:00:00Z" }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "plans.create",
        json!({
            "companyId": "acme",
            "departmentCode": "MKT",
            "month": "January",
            "year": 2026,
            "goalStrategy": "Grow qualified leads",
            "actionPlan": "Quarterly webinar series",
            "indicator": "Leads per month",
            "pic": "Tono"
        }),
    );
    let plan_id = created["plan"]["id"].as_str().expect("plan id").to_string();

    // Past the Feb 6 deadline the plan is frozen.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "clock.set",
        json!({ "now": "2026-02-10T00:00:00Z" }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "5",
        "plans.update",
        json!({ "id": plan_id, "fields": { "remark": "frozen" } }),
    );
    assert_eq!(code, "period_locked");

    // A blank reason does not open a request.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "unlock.request",
        json!({ "id": plan_id, "reason": "   " }),
    );
    assert_eq!(code, "validation");

    let requested = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "unlock.request",
        json!({ "id": plan_id, "reason": "KPI figure was transposed", "requestedBy": "tono" }),
    );
    assert_eq!(requested["plan"]["unlockStatus"].as_str(), Some("pending"));

    // An approved grant opens the plan until its expiry, then lapses back
    // to the deadline rule.
    let approved = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "unlock.approve",
        json!({ "id": plan_id, "expiresAt": "2026-02-20T00:00:00Z", "approvedBy": "boss" }),
    );
    assert_eq!(approved["plan"]["unlockStatus"].as_str(), Some("approved"));
    assert_eq!(
        approved["plan"]["approvedUntil"].as_str(),
        Some("2026-02-20T00:00:00.000Z")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "plans.update",
        json!({ "id": plan_id, "fields": { "remark": "fixed the figure" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "clock.set",
        json!({ "now": "2026-02-21T00:00:00Z" }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "11",
        "plans.update",
        json!({ "id": plan_id, "fields": { "remark": "grant lapsed" } }),
    );
    assert_eq!(code, "period_locked");

    // An indefinite grant holds until explicitly revoked.
    let approved = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "unlock.approve",
        json!({ "id": plan_id, "indefinite": true, "approvedBy": "boss" }),
    );
    assert!(approved["plan"]["approvedUntil"].is_null());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "clock.set",
        json!({ "now": "2027-05-01T00:00:00Z" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "plans.update",
        json!({ "id": plan_id, "fields": { "remark": "a year later, still open" } }),
    );

    let revoked = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "unlock.revoke",
        json!({ "id": plan_id, "actor": "boss" }),
    );
    assert!(revoked["plan"]["unlockStatus"].is_null());
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "16",
        "plans.update",
        json!({ "id": plan_id, "fields": { "remark": "revoked" } }),
    );
    assert_eq!(code, "period_locked");

    // Rejection records its reason and grants nothing.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "unlock.request",
        json!({ "id": plan_id, "reason": "one more correction" }),
    );
    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "unlock.reject",
        json!({ "id": plan_id, "reason": "period is closed for audit", "rejectedBy": "boss" }),
    );
    assert_eq!(rejected["plan"]["unlockStatus"].as_str(), Some("rejected"));
    assert_eq!(
        rejected["plan"]["rejectionReason"].as_str(),
        Some("period is closed for audit")
    );
    assert!(rejected["plan"]["approvedUntil"].is_null());
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "19",
        "plans.update",
        json!({ "id": plan_id, "fields": { "remark": "still locked" } }),
    );
    assert_eq!(code, "period_locked");

    // Without an explicit expiry the grant runs for the configured days.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "clock.set",
        json!({ "now": "2026-02-10T00:00:00Z" }),
    );
    let approved = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "unlock.approve",
        json!({ "id": plan_id, "approvedBy": "boss" }),
    );
    assert_eq!(
        approved["plan"]["approvedUntil"].as_str(),
        Some("2026-02-17T00:00:00.000Z")
    );

    // Both decisions landed in the outbox.
    let outbox = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "notifications.list",
        json!({ "planId": plan_id }),
    );
    let kinds: Vec<&str> = outbox["notifications"]
        .as_array()
        .expect("notifications")
        .iter()
        .filter_map(|n| n["kind"].as_str())
        .collect();
    assert!(kinds.contains(&"unlock_decision"));
    assert!(kinds.iter().filter(|k| **k == "unlock_decision").count() >= 3);
}

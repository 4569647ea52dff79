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

fn create_plan(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    seq: u32,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "plans.create",
        json!({
            "companyId": "acme",
            "departmentCode": "FIN",
            "month": "March",
            "year": 2026,
            "goalStrategy": format!("Goal {}", seq),
            "actionPlan": format!("Plan {}", seq),
            "indicator": "Close days",
            "pic": "Budi"
        }),
    );
    created["plan"]["id"].as_str().expect("plan id").to_string()
}

#[test]
fn recall_reopens_ungraded_and_unwinds_untouched_children() {
    let workspace = temp_dir("plantrack-recall");
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
        json!({ "now": "2026-03-10T08:00:00Z" }),
    );

    let plan_a = create_plan(&mut stdin, &mut reader, "3", 1);
    let plan_b = create_plan(&mut stdin, &mut reader, "4", 2);
    let plan_c = create_plan(&mut stdin, &mut reader, "5", 3);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "plans.updateStatus",
        json!({ "id": plan_a, "status": "Achieved" }),
    );

    let finalized = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "month.finalize",
        json!({ "month": "March", "year": 2026, "submittedBy": "lead" }),
    );
    assert_eq!(finalized["submitted"].as_u64(), Some(3));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grading.grade",
        json!({ "id": plan_a, "score": 90, "status": "Achieved", "gradedBy": "boss" }),
    );

    // Partial recall: human-graded work stays put, the rest reopens.
    let recalled = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "month.recall",
        json!({ "month": "March", "year": 2026 }),
    );
    assert_eq!(recalled["recalled"].as_u64(), Some(2));
    assert_eq!(recalled["gradedUntouched"].as_u64(), Some(1));
    assert_eq!(recalled["deletedChildren"].as_u64(), Some(0));

    let a = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "plans.get",
        json!({ "id": plan_a }),
    );
    assert_eq!(a["plan"]["submissionStatus"].as_str(), Some("submitted"));
    assert_eq!(a["plan"]["qualityScore"].as_f64(), Some(90.0));

    let b = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "plans.get",
        json!({ "id": plan_b }),
    );
    assert_eq!(b["plan"]["submissionStatus"].as_str(), Some("draft"));
    assert!(b["plan"]["submittedAt"].is_null());

    // A recalled draft can no longer be graded.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "12",
        "grading.grade",
        json!({ "id": plan_b, "score": 50, "status": "Achieved" }),
    );
    assert_eq!(code, "item_recalled");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "13",
        "grading.grade",
        json!({ "id": plan_c, "score": 50, "status": "Achieved" }),
    );
    assert_eq!(code, "item_recalled");

    // Fail plan B and resubmit: auto-zero plus a carry-over child.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "plans.updateStatus",
        json!({ "id": plan_b, "status": "Not Achieved" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "plans.update",
        json!({ "id": plan_b, "fields": { "resolutionType": "carried_over" } }),
    );
    let finalized = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "month.finalize",
        json!({ "month": "March", "year": 2026 }),
    );
    assert_eq!(finalized["submitted"].as_u64(), Some(2));
    assert_eq!(finalized["autoScored"].as_u64(), Some(1));
    assert_eq!(finalized["carryOver"]["created"].as_u64(), Some(1));

    let b = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "plans.get",
        json!({ "id": plan_b }),
    );
    assert_eq!(b["plan"]["qualityScore"].as_f64(), Some(0.0));
    assert_eq!(
        b["plan"]["feedback"].as_str(),
        Some("Auto-scored 0: target not achieved at submission")
    );

    // Recall reverses the system zero (a human grade it would keep) and
    // deletes the pristine child.
    let recalled = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "month.recall",
        json!({ "month": "March", "year": 2026 }),
    );
    assert_eq!(recalled["recalled"].as_u64(), Some(2));
    assert_eq!(recalled["gradedUntouched"].as_u64(), Some(1));
    assert_eq!(recalled["deletedChildren"].as_u64(), Some(1));

    let b = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "plans.get",
        json!({ "id": plan_b }),
    );
    assert_eq!(b["plan"]["submissionStatus"].as_str(), Some("draft"));
    assert!(b["plan"]["qualityScore"].is_null());
    assert!(b["plan"]["feedback"].is_null());

    let apr = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "plans.list",
        json!({ "month": "April", "year": 2026 }),
    );
    assert_eq!(apr["plans"].as_array().expect("plans array").len(), 0);

    // Resubmit; this time someone starts working on the child before the
    // recall, so it must survive.
    let finalized = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "month.finalize",
        json!({ "month": "March", "year": 2026 }),
    );
    assert_eq!(finalized["carryOver"]["created"].as_u64(), Some(1));
    let apr = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "plans.list",
        json!({ "month": "April", "year": 2026 }),
    );
    let child_id = apr["plans"].as_array().expect("plans array")[0]["id"]
        .as_str()
        .expect("child id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "plans.updateStatus",
        json!({ "id": child_id, "status": "On Progress" }),
    );

    let recalled = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "month.recall",
        json!({ "month": "March", "year": 2026 }),
    );
    assert_eq!(recalled["deletedChildren"].as_u64(), Some(0));
    let skipped = recalled["skippedChildren"].as_array().expect("skipped");
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].as_str(), Some(child_id.as_str()));

    let child = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "plans.get",
        json!({ "id": child_id }),
    );
    assert_eq!(child["plan"]["status"].as_str(), Some("On Progress"));
}

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
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .env_remove("RESULTSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
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
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn student(id: &str, exam_type: &str, subjects: &[(&str, &str, f64)]) -> serde_json::Value {
    json!({
        "studentId": id,
        "academicPeriod": { "year": "2023-24", "semester": "Semester 1" },
        "examType": exam_type,
        "subjects": subjects
            .iter()
            .map(|(code, grade, credits)| json!({ "code": code, "grade": grade, "credits": credits }))
            .collect::<Vec<_>>(),
    })
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultsd-router-smoke");
    let restore_ws = temp_dir("resultsd-router-smoke-restore");
    let bundle_out = workspace.join("smoke-backup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "0", "results.get", json!({}));
    assert_eq!(error_code(&before), "no_workspace");

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["workspacePath"].is_null());
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let merged = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.merge",
        json!({ "records": [
            student("20B91A0501", "regular", &[("CS101", "B", 3.0)]),
        ]}),
    );
    let batch_id = merged["batchId"].as_str().expect("batchId").to_string();

    let calls = vec![
        ("results.preview", json!({ "records": [] })),
        (
            "results.get",
            json!({ "studentId": "20B91A0501", "year": "2023-24", "semester": "Semester 1" }),
        ),
        ("results.search", json!({ "studentId": "20B91A0501" })),
        ("batches.list", json!({ "limit": 5 })),
        ("batches.get", json!({ "batchId": batch_id })),
        ("setup.get", json!({})),
        ("setup.update", json!({ "section": "merge", "patch": { "workers": 2 } })),
        ("backup.exportWorkspaceBundle", json!({ "outPath": bundle_out.to_string_lossy() })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        request_ok(&mut stdin, &mut reader, &format!("c{}", i), method, params);
    }

    let health = request_ok(&mut stdin, &mut reader, "4", "health", json!({}));
    assert_eq!(health["recordCount"], 1);

    let unknown = request(&mut stdin, &mut reader, "5", "classes.list", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    // Bad lines get an answer too.
    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(error_code(&v), "bad_json");

    // Restore the bundle into a fresh workspace.
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.select",
        json!({ "path": restore_ws.to_string_lossy() }),
    );
    let empty = request_ok(&mut stdin, &mut reader, "7", "health", json!({}));
    assert_eq!(empty["recordCount"], 0);
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );
    assert_eq!(imported["bundleFormatDetected"], "resultsd-workspace-v1");
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.get",
        json!({ "studentId": "20B91A0501", "year": "2023-24", "semester": "Semester 1" }),
    );
    assert_eq!(got["record"]["subjects"]["CS101"]["grade"], "B");
    let settings = request_ok(&mut stdin, &mut reader, "10", "setup.get", json!({}));
    assert_eq!(settings["merge"]["workers"], 2);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(restore_ws);
}

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

fn roll(n: usize) -> String {
    format!("21B91A05{:02}", n)
}

#[test]
fn partitioned_workers_merge_every_student_once() {
    let workspace = temp_dir("resultsd-partitioned");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "merge", "patch": { "workers": 4 } }),
    );

    let total = 30;
    let regular: Vec<serde_json::Value> = (1..=total)
        .map(|n| student(&roll(n), "regular", &[("CS101", "F", 3.0), ("MA101", "B", 4.0)]))
        .collect();
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.merge",
        json!({ "records": regular }),
    );
    assert_eq!(first["report"]["total_processed"], total);
    assert_eq!(first["report"]["new_records_created"], total);
    assert_eq!(first["report"]["students_failed"], 0);

    // Every even student clears the backlog; the last student appears twice
    // and the second entry must see the first one's result.
    let mut supply: Vec<serde_json::Value> = (1..=total)
        .map(|n| {
            let grade = if n % 2 == 0 { "D" } else { "F" };
            student(&roll(n), "supply", &[("CS101", grade, 3.0)])
        })
        .collect();
    supply.push(student(&roll(total), "supply", &[("CS101", "A", 3.0)]));
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.merge",
        json!({ "records": supply }),
    );
    let report = &second["report"];
    assert_eq!(report["total_processed"], total + 1);
    assert_eq!(report["students_found_existing"], total + 1);
    assert_eq!(report["students_failed"], 0);
    assert_eq!(report["f_to_pass_conversions"], total / 2);
    assert_eq!(report["subjects_overwritten"], total / 2 + 1);
    assert_eq!(report["subjects_kept"], total / 2);
    let improvements = report["grade_improvements"].as_array().expect("improvements");
    let last = improvements.last().expect("last improvement");
    assert_eq!(last["student_id"], roll(total));
    assert_eq!(last["from_grade"], "D");
    assert_eq!(last["to_grade"], "A");

    let health = request_ok(&mut stdin, &mut reader, "5", "health", json!({}));
    assert_eq!(health["recordCount"], total);

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.get",
        json!({ "studentId": roll(total), "year": "2023-24", "semester": "Semester 1" }),
    );
    let cs = &cleared["record"]["subjects"]["CS101"];
    assert_eq!(cs["grade"], "A");
    assert_eq!(cs["attempts"], 3);

    let stuck = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.get",
        json!({ "studentId": roll(1), "year": "2023-24", "semester": "Semester 1" }),
    );
    assert_eq!(stuck["record"]["subjects"]["CS101"]["grade"], "F");
    assert_eq!(stuck["record"]["subjects"]["CS101"]["attempts"], 2);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

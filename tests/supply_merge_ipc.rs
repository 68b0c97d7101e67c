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
fn supply_upload_overwrites_only_improvements() {
    let workspace = temp_dir("resultsd-supply-merge");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let regular = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.merge",
        json!({ "records": [
            student("20B91A0501", "regular", &[("CS101", "F", 3.0), ("MA101", "C", 4.0)]),
        ]}),
    );
    assert_eq!(regular["report"]["students_not_found"], 1);
    assert_eq!(regular["report"]["subjects_added"], 2);

    let supply = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.merge",
        json!({ "records": [
            student(
                "20b91a0501",
                "supply",
                &[("cs101 ", "B", 3.0), ("MA101", "D", 4.0), ("PH101", "A", 3.0)],
            ),
        ]}),
    );
    let report = &supply["report"];
    assert_eq!(report["total_processed"], 1);
    assert_eq!(report["students_found_existing"], 1);
    assert_eq!(report["students_updated"], 1);
    assert_eq!(report["subjects_overwritten"], 1);
    assert_eq!(report["subjects_added"], 1);
    assert_eq!(report["subjects_kept"], 1);
    assert_eq!(report["total_attempts_tracked"], 2);
    assert_eq!(report["f_to_pass_conversions"], 1);
    let imp = &report["grade_improvements"][0];
    assert_eq!(imp["student_id"], "20B91A0501");
    assert_eq!(imp["subject_code"], "CS101");
    assert_eq!(imp["from_grade"], "F");
    assert_eq!(imp["to_grade"], "B");
    assert_eq!(imp["attempt_number"], 2);
    assert!(supply["batchId"].as_str().is_some());

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.get",
        json!({ "studentId": "20B91A0501", "year": "2023-24", "semester": "Semester 1" }),
    );
    assert_eq!(got["docId"], "20B91A0501_2023-24_Semester_1");
    let record = &got["record"];
    assert_eq!(record["examType"], "mixed");
    let cs = &record["subjects"]["CS101"];
    assert_eq!(cs["grade"], "B");
    assert_eq!(cs["result"], "Pass");
    assert_eq!(cs["attempts"], 2);
    assert_eq!(cs["originalGrade"], "F");
    assert_eq!(cs["attemptHistory"].as_array().map(|a| a.len()), Some(2));
    let ma = &record["subjects"]["MA101"];
    assert_eq!(ma["grade"], "C");
    assert_eq!(ma["attempts"], 2);
    assert_eq!(record["subjects"]["PH101"]["attempts"], 1);
    // (6*3 + 5*4 + 8*3) / 10
    let sgpa = record["sgpa"].as_f64().expect("sgpa");
    assert!((sgpa - 6.2).abs() < 1e-9, "sgpa {}", sgpa);
    assert_eq!(record["mergeHistory"].as_array().map(|a| a.len()), Some(2));

    // Reapplying the same supply sheet never regresses anything.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.merge",
        json!({ "records": [
            student("20B91A0501", "supply", &[("CS101", "B", 3.0), ("MA101", "D", 4.0), ("PH101", "A", 3.0)]),
        ]}),
    );
    assert_eq!(again["report"]["subjects_overwritten"], 0);
    assert_eq!(again["report"]["subjects_added"], 0);
    assert_eq!(again["report"]["subjects_kept"], 3);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bad_students_are_reported_without_failing_the_batch() {
    let workspace = temp_dir("resultsd-supply-failures");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut blank_period = student("20B91A0502", "regular", &[("CS101", "A", 3.0)]);
    blank_period["academicPeriod"]["semester"] = json!("  ");
    let resp = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.merge",
        json!({ "records": [
            student("??", "regular", &[("CS101", "A", 3.0)]),
            blank_period,
            student("20B91A0503", "regular", &[("CS101", "A", 3.0), ("", "B", 3.0)]),
        ]}),
    );
    let report = &resp["report"];
    assert_eq!(report["total_processed"], 3);
    assert_eq!(report["students_updated"], 1);
    assert_eq!(report["students_failed"], 2);
    assert_eq!(report["subjects_skipped"], 1);
    assert_eq!(report["errors"][0]["kind"], "invalid_record");
    assert_eq!(report["errors"][1]["student_id"], "20B91A0502");

    // Nothing merged at all is still a successful response.
    let none = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.merge",
        json!({ "records": [ student("bad", "supply", &[]) ] }),
    );
    assert_eq!(none["report"]["students_updated"], 0);
    assert_eq!(none["report"]["students_failed"], 1);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn preview_reports_without_persisting() {
    let workspace = temp_dir("resultsd-supply-preview");
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
        "results.merge",
        json!({ "records": [ student("20B91A0501", "regular", &[("CS101", "F", 3.0)]) ] }),
    );

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.preview",
        json!({ "records": [
            student("20B91A0501", "supply", &[("CS101", "A", 3.0)]),
            student("20B91A0509", "supply", &[("CS101", "A", 3.0)]),
        ]}),
    );
    assert_eq!(preview["report"]["subjects_overwritten"], 1);
    assert_eq!(preview["report"]["new_records_created"], 1);
    assert_eq!(preview["records"].as_array().map(|a| a.len()), Some(2));
    assert!(preview.get("batchId").is_none());

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.get",
        json!({ "studentId": "20B91A0501", "year": "2023-24", "semester": "Semester 1" }),
    );
    assert_eq!(got["record"]["subjects"]["CS101"]["grade"], "F");
    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "results.get",
        json!({ "studentId": "20B91A0509", "year": "2023-24", "semester": "Semester 1" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let batches = request_ok(&mut stdin, &mut reader, "6", "batches.list", json!({}));
    assert_eq!(batches["batches"].as_array().map(|a| a.len()), Some(1));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unreadable_records_do_not_sink_the_rest_of_the_upload() {
    let workspace = temp_dir("resultsd-supply-unreadable");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut text_credits = student("20B91A0502", "regular", &[("CS101", "C", 3.0)]);
    text_credits["subjects"][0]["credits"] = json!("3");
    let mut null_grade = student("20B91A0503", "regular", &[("CS101", "B", 3.0)]);
    null_grade["subjects"][0]["grade"] = serde_json::Value::Null;
    let mut no_period = student("20B91A0504", "regular", &[("CS101", "A", 3.0)]);
    no_period
        .as_object_mut()
        .expect("student object")
        .remove("academicPeriod");

    let resp = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.merge",
        json!({ "records": [
            student("20B91A0501", "regular", &[("CS101", "A", 3.0)]),
            text_credits,
            null_grade,
            no_period,
        ]}),
    );
    assert_eq!(resp["batchRecorded"], true);
    let report = &resp["report"];
    assert_eq!(report["total_processed"], 4);
    assert_eq!(report["students_updated"], 3);
    assert_eq!(report["students_failed"], 1);
    assert_eq!(report["errors"][0]["student_id"], "20B91A0504");
    assert_eq!(report["errors"][0]["kind"], "invalid_record");
    assert!(report["errors"][0]["message"]
        .as_str()
        .unwrap_or("")
        .starts_with("records[3]:"));

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.get",
        json!({ "studentId": "20B91A0502", "year": "2023-24", "semester": "Semester 1" }),
    );
    assert_eq!(stored["record"]["subjects"]["CS101"]["credits"].as_f64(), Some(3.0));

    // A subject with no grade is kept as an unrecognized grade, never a pass.
    let blank = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.get",
        json!({ "studentId": "20B91A0503", "year": "2023-24", "semester": "Semester 1" }),
    );
    assert_eq!(blank["record"]["subjects"]["CS101"]["result"], "Fail");

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.preview",
        json!({ "records": [ { "studentId": "20B91A0505" } ] }),
    );
    assert_eq!(preview["report"]["students_failed"], 1);
    assert_eq!(preview["records"].as_array().map(|a| a.len()), Some(0));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

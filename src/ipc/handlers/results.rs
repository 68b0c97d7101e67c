use crate::batch::{
    merge_batch, merge_batch_partitioned, BatchProgress, BatchReport, FailureKind, StudentFailure,
};
use crate::calc;
use crate::db;
use crate::error::{BatchError, StoreError};
use crate::intake::{self, IntakeOverrides};
use crate::ipc::error::{err, no_workspace, ok};
use crate::ipc::handlers::setup::{load_merge_settings, MergeSettings};
use crate::ipc::types::{AppState, Request};
use crate::model::{normalize_student_id, AcademicPeriod, ExamType, IncomingStudent, RecordKey};
use crate::store::DryRunStore;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Records that could be read, plus a failure row for each one that could
/// not. Only a missing `records` array fails the whole request.
fn parse_records(req: &Request) -> Result<(Vec<IncomingStudent>, Vec<StudentFailure>), String> {
    let raw = req
        .params
        .get("records")
        .and_then(|v| v.as_array())
        .ok_or("records must be an array")?;
    let mut students = Vec::with_capacity(raw.len());
    let mut unreadable = Vec::new();
    for (i, v) in raw.iter().enumerate() {
        match serde_json::from_value::<IncomingStudent>(v.clone()) {
            Ok(s) => students.push(s),
            Err(e) => unreadable.push(unreadable_record(i, v, &e.to_string())),
        }
    }
    Ok((students, unreadable))
}

fn unreadable_record(index: usize, raw: &serde_json::Value, reason: &str) -> StudentFailure {
    let text = |v: Option<&serde_json::Value>| {
        v.and_then(|x| x.as_str())
            .map(|x| x.trim().to_string())
            .unwrap_or_default()
    };
    let period = raw.get("academicPeriod").or_else(|| raw.get("academic_period"));
    StudentFailure {
        student_id: text(raw.get("studentId").or_else(|| raw.get("student_id"))),
        year: text(period.and_then(|p| p.get("year"))),
        semester: text(period.and_then(|p| p.get("semester"))),
        kind: FailureKind::InvalidRecord,
        message: format!("records[{}]: {}", index, reason),
    }
}

/// `submissionId` when the caller supplies one, otherwise a digest of the
/// submitted records as sent, unreadable ones included.
fn submission_fingerprint(req: &Request, records: &[IncomingStudent]) -> String {
    if let Some(id) = req
        .params
        .get("submissionId")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return format!("id:{}", id);
    }
    let bytes = match req.params.get("records") {
        Some(raw) => serde_json::to_vec(raw),
        None => serde_json::to_vec(records),
    }
    .unwrap_or_default();
    let digest: String = Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("sha256:{}", digest)
}

fn log_progress(p: &BatchProgress) {
    debug!(
        processed = p.processed,
        total = p.total,
        student = %p.student_id,
        succeeded = p.succeeded,
        "merge progress"
    );
}

fn run_batch(
    workspace: &Path,
    conn: &Connection,
    records: &[IncomingStudent],
    at: DateTime<Utc>,
    settings: &MergeSettings,
) -> Result<BatchReport, BatchError> {
    let policy = settings.policy();
    if settings.workers > 1 {
        let open = || db::open_db(workspace).map_err(|e| StoreError::Unavailable(e.to_string()));
        merge_batch_partitioned(open, records, at, &policy, settings.workers, &mut log_progress)
    } else {
        merge_batch(conn, records, at, &policy, &mut log_progress)
    }
}

/// Merge, record the batch and claim its fingerprint. Shared by
/// `results.merge` and `results.importFile`.
///
/// Once students are persisted the reply is always `ok` with the report; a
/// batch that could not be recorded says so with `batchRecorded: false`.
fn commit_batch(
    req: &Request,
    workspace: &Path,
    conn: &Connection,
    records: &[IncomingStudent],
    unreadable: Vec<StudentFailure>,
    source: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    let settings = load_merge_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let fingerprint = submission_fingerprint(req, records);
    if settings.reject_duplicate_submissions {
        let earlier = db::submission_batch(conn, &fingerprint)
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        if let Some(batch_id) = earlier {
            info!(fingerprint = %fingerprint, batch = %batch_id, "duplicate submission rejected");
            return Err(err(
                &req.id,
                "duplicate_submission",
                "this submission was already merged",
                Some(json!({ "batchId": batch_id, "fingerprint": fingerprint })),
            ));
        }
    }

    let at = Utc::now();
    let mut report = run_batch(workspace, conn, records, at, &settings).map_err(|e| {
        error!(error = %e, "batch aborted");
        err(&req.id, "store_unavailable", e.to_string(), None)
    })?;
    report.add_unreadable(unreadable);

    let batch_id = Uuid::new_v4().to_string();
    let recorded = db::insert_batch(
        conn,
        &db::NewBatch {
            id: &batch_id,
            fingerprint: &fingerprint,
            source,
            created_at: &at.to_rfc3339(),
            report: &report,
        },
    );
    if let Err(e) = recorded {
        error!(error = %e, fingerprint = %fingerprint, "batch merged but not recorded");
        return Ok(json!({
            "batchId": null,
            "batchRecorded": false,
            "warning": format!("students were merged but the batch was not recorded: {}", e),
            "fingerprint": fingerprint,
            "report": report,
        }));
    }

    Ok(json!({
        "batchId": batch_id,
        "batchRecorded": true,
        "fingerprint": fingerprint,
        "report": report,
    }))
}

fn handle_results_merge(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some((workspace, conn)) = state.open_workspace() else {
        return no_workspace(&req.id);
    };
    let (records, unreadable) = match parse_records(req) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    match commit_batch(req, workspace, conn, &records, unreadable, "merge") {
        Ok(result) => ok(&req.id, result),
        Err(resp) => resp,
    }
}

fn handle_results_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let (records, unreadable) = match parse_records(req) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let settings = match load_merge_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let dry = DryRunStore::new(conn);
    let mut report = match merge_batch(&dry, &records, Utc::now(), &settings.policy(), &mut log_progress) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "store_unavailable", e.to_string(), None),
    };
    report.add_unreadable(unreadable);
    ok(
        &req.id,
        json!({
            "report": report,
            "records": dry.into_staged(),
        }),
    )
}

fn handle_results_import_file(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some((workspace, conn)) = state.open_workspace() else {
        return no_workspace(&req.id);
    };
    let Some(path) = req.params.get("path").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing path", None);
    };
    let exam_type = match req.params.get("examType").and_then(|v| v.as_str()) {
        None => None,
        Some(s) => match ExamType::parse(s) {
            Some(e) => Some(e),
            None => return err(&req.id, "bad_params", "examType must be regular or supply", None),
        },
    };
    let text_param = |key: &str| {
        req.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let overrides = IntakeOverrides {
        exam_type,
        year: text_param("year"),
        semester: text_param("semester"),
    };

    let path = PathBuf::from(path);
    if !path.is_file() {
        return err(
            &req.id,
            "not_found",
            "result file not found",
            Some(json!({ "path": path.to_string_lossy() })),
        );
    }
    let parsed = match intake::read_result_file(&path, &overrides) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("{e:#}"),
                Some(json!({ "path": path.to_string_lossy() })),
            )
        }
    };

    match commit_batch(req, workspace, conn, &parsed.students, Vec::new(), "import") {
        Ok(mut result) => {
            result["format"] = json!(parsed.format);
            result["rejected"] = json!(parsed.rejected);
            ok(&req.id, result)
        }
        Err(resp) => resp,
    }
}

fn parse_key(req: &Request) -> Result<RecordKey, String> {
    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or("missing studentId")?;
    let year = req
        .params
        .get("year")
        .and_then(|v| v.as_str())
        .ok_or("missing year")?;
    let semester = req
        .params
        .get("semester")
        .and_then(|v| v.as_str())
        .ok_or("missing semester")?;
    Ok(RecordKey {
        student_id: normalize_student_id(student_id).map_err(|e| e.to_string())?,
        period: AcademicPeriod::new(year, semester)
            .normalized()
            .map_err(|e| e.to_string())?,
    })
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let key = match parse_key(req) {
        Ok(k) => k,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    match db::get_record(conn, &key) {
        Ok(Some(record)) => ok(&req.id, json!({ "docId": key.doc_id(), "record": record })),
        Ok(None) => err(
            &req.id,
            "not_found",
            "no record for this student and period",
            Some(json!({ "docId": key.doc_id() })),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let Some(raw_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let student_id = match normalize_student_id(raw_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    let settings = match load_merge_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let records = match db::records_for_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let ordering = settings.policy().ordering;
    let periods: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            json!({
                "year": r.academic_period.year,
                "semester": r.academic_period.semester,
                "examType": r.exam_type,
                "summary": calc::credit_summary(r.subjects.values(), &ordering),
            })
        })
        .collect();
    let overall = calc::credit_summary(records.iter().flat_map(|r| r.subjects.values()), &ordering);

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "records": records,
            "summary": {
                "periods": periods,
                "overall": overall,
            },
        }),
    )
}

fn handle_results_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let Some(raw_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let student_id = match normalize_student_id(raw_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    let year = req.params.get("year").and_then(|v| v.as_str());
    let semester = req.params.get("semester").and_then(|v| v.as_str());
    let period = match (year, semester) {
        (None, None) => None,
        (Some(y), Some(s)) => match AcademicPeriod::new(y, s).normalized() {
            Ok(p) => Some(p),
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        },
        _ => {
            return err(
                &req.id,
                "bad_params",
                "year and semester must be given together",
                None,
            )
        }
    };

    match db::delete_records(conn, &student_id, period.as_ref()) {
        Ok(deleted) => {
            info!(student = %student_id, deleted, "records deleted");
            ok(&req.id, json!({ "deleted": deleted }))
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.merge" => Some(handle_results_merge(state, req)),
        "results.preview" => Some(handle_results_preview(state, req)),
        "results.importFile" => Some(handle_results_import_file(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        "results.search" => Some(handle_results_search(state, req)),
        "results.delete" => Some(handle_results_delete(state, req)),
        _ => None,
    }
}

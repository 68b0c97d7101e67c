use crate::batch::BatchReport;
use crate::error::StoreError;
use crate::model::{AcademicPeriod, RecordKey, StudentRecord};
use crate::store::RecordStore;
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE: &str = "results.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(db_path(workspace))?;
    // Partitioned batches write from several connections at once.
    conn.busy_timeout(Duration::from_secs(10))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_records(
            student_id TEXT NOT NULL,
            year TEXT NOT NULL,
            semester TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            record_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_updated_at TEXT NOT NULL,
            PRIMARY KEY(student_id, year, semester)
        )",
        [],
    )?;
    ensure_student_records_sgpa(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_records_doc ON student_records(doc_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_batches(
            id TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL,
            total_processed INTEGER NOT NULL,
            students_updated INTEGER NOT NULL,
            students_failed INTEGER NOT NULL,
            report_json TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_merge_batches_created ON merge_batches(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            fingerprint TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            received_at TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES merge_batches(id)
        )",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before the search summary existed have no sgpa column.
fn ensure_student_records_sgpa(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_records", "sgpa")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE student_records ADD COLUMN sgpa REAL NOT NULL DEFAULT 0",
        [],
    )?;
    let mut stmt = conn.prepare("SELECT doc_id, record_json FROM student_records")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (doc_id, record_json) in rows {
        let sgpa = serde_json::from_str::<Value>(&record_json)
            .ok()
            .and_then(|v| v.get("sgpa").and_then(|s| s.as_f64()))
            .unwrap_or(0.0);
        conn.execute(
            "UPDATE student_records SET sgpa = ? WHERE doc_id = ?",
            params![sgpa, doc_id],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is not valid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

fn decode_record(record_json: &str) -> Result<StudentRecord, StoreError> {
    serde_json::from_str(record_json).map_err(|e| StoreError::Corrupt(e.to_string()))
}

pub fn get_record(conn: &Connection, key: &RecordKey) -> Result<Option<StudentRecord>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT record_json FROM student_records
             WHERE student_id = ? AND year = ? AND semester = ?",
            params![key.student_id, key.period.year, key.period.semester],
            |r| r.get(0),
        )
        .optional()?;
    raw.as_deref().map(decode_record).transpose()
}

pub fn upsert_record(conn: &Connection, record: &StudentRecord) -> Result<(), StoreError> {
    let key = record.key();
    let record_json =
        serde_json::to_string(record).map_err(|e| StoreError::Backend(e.to_string()))?;
    conn.execute(
        "INSERT INTO student_records(
            student_id, year, semester, doc_id, exam_type, sgpa,
            record_json, created_at, last_updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, year, semester) DO UPDATE SET
            exam_type = excluded.exam_type,
            sgpa = excluded.sgpa,
            record_json = excluded.record_json,
            last_updated_at = excluded.last_updated_at",
        params![
            key.student_id,
            key.period.year,
            key.period.semester,
            key.doc_id(),
            record.exam_type.as_str(),
            record.sgpa,
            record_json,
            record.created_at.to_rfc3339(),
            record.last_updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Every stored period for one student, oldest first.
pub fn records_for_student(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<StudentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT doc_id, record_json FROM student_records
         WHERE student_id = ?
         ORDER BY year, semester",
    )?;
    let rows = stmt
        .query_map([student_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(rows.len());
    for (doc_id, record_json) in rows {
        out.push(decode_record(&record_json).with_context(|| format!("record {}", doc_id))?);
    }
    Ok(out)
}

pub fn delete_records(
    conn: &Connection,
    student_id: &str,
    period: Option<&AcademicPeriod>,
) -> anyhow::Result<usize> {
    let n = match period {
        Some(p) => conn.execute(
            "DELETE FROM student_records WHERE student_id = ? AND year = ? AND semester = ?",
            params![student_id, p.year, p.semester],
        )?,
        None => conn.execute(
            "DELETE FROM student_records WHERE student_id = ?",
            [student_id],
        )?,
    };
    Ok(n)
}

pub fn count_records(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM student_records", [], |r| r.get(0))?)
}

/// Batch id that already consumed this submission fingerprint, if any.
pub fn submission_batch(conn: &Connection, fingerprint: &str) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT batch_id FROM submissions WHERE fingerprint = ?",
            [fingerprint],
            |r| r.get(0),
        )
        .optional()?)
}

pub struct NewBatch<'a> {
    pub id: &'a str,
    pub fingerprint: &'a str,
    pub source: &'a str,
    pub created_at: &'a str,
    pub report: &'a BatchReport,
}

/// Store the batch report and claim its fingerprint. A fingerprint that was
/// already claimed keeps pointing at the first batch.
pub fn insert_batch(conn: &Connection, batch: &NewBatch<'_>) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO merge_batches(
            id, fingerprint, source, created_at,
            total_processed, students_updated, students_failed, report_json
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            batch.id,
            batch.fingerprint,
            batch.source,
            batch.created_at,
            batch.report.total_processed,
            batch.report.students_updated,
            batch.report.students_failed,
            serde_json::to_string(batch.report)?,
        ],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO submissions(fingerprint, batch_id, received_at) VALUES(?, ?, ?)",
        params![batch.fingerprint, batch.id, batch.created_at],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn list_batches(conn: &Connection, limit: i64) -> anyhow::Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, fingerprint, source, created_at,
                total_processed, students_updated, students_failed
         FROM merge_batches
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok(json!({
                "batchId": r.get::<_, String>(0)?,
                "fingerprint": r.get::<_, String>(1)?,
                "source": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
                "totalProcessed": r.get::<_, i64>(4)?,
                "studentsUpdated": r.get::<_, i64>(5)?,
                "studentsFailed": r.get::<_, i64>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_batch(conn: &Connection, batch_id: &str) -> anyhow::Result<Option<Value>> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT fingerprint, source, created_at, report_json FROM merge_batches WHERE id = ?",
            [batch_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((fingerprint, source, created_at, report_json)) = row else {
        return Ok(None);
    };
    let report: Value = serde_json::from_str(&report_json)
        .with_context(|| format!("batch {} report is not valid JSON", batch_id))?;
    Ok(Some(json!({
        "batchId": batch_id,
        "fingerprint": fingerprint,
        "source": source,
        "createdAt": created_at,
        "report": report,
    })))
}

impl RecordStore for Connection {
    fn check_available(&self) -> Result<(), StoreError> {
        self.query_row("SELECT COUNT(*) FROM student_records", [], |r| r.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn fetch(&self, key: &RecordKey) -> Result<StudentRecord, StoreError> {
        get_record(self, key)?.ok_or(StoreError::NotFound)
    }

    fn persist(&self, record: &StudentRecord) -> Result<(), StoreError> {
        upsert_record(self, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge_student;
    use crate::model::{ExamType, IncomingStudent, IncomingSubject};
    use crate::reconcile::MergePolicy;
    use chrono::Utc;
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

    fn record(id: &str, semester: &str) -> StudentRecord {
        let incoming = IncomingStudent {
            student_id: id.to_string(),
            academic_period: AcademicPeriod::new("2023-24", semester),
            exam_type: ExamType::Regular,
            subjects: vec![IncomingSubject {
                code: Some("CS101".into()),
                grade: "B".into(),
                credits: 3.0,
                ..Default::default()
            }],
        };
        merge_student(None, &incoming, Utc::now(), &MergePolicy::default())
            .expect("merge")
            .record
    }

    #[test]
    fn connection_store_roundtrips_and_reports_not_found() {
        let ws = temp_dir("resultsd-db-store");
        let conn = open_db(&ws).expect("open db");
        conn.check_available().expect("available");

        let r = record("20B91A0501", "Semester 1");
        assert_eq!(conn.fetch(&r.key()), Err(StoreError::NotFound));
        conn.persist(&r).expect("persist");
        assert_eq!(conn.fetch(&r.key()).expect("fetch"), r);

        let mut again = r.clone();
        again.sgpa = 9.5;
        conn.persist(&again).expect("upsert");
        assert_eq!(count_records(&conn).expect("count"), 1);
        assert_eq!(conn.fetch(&r.key()).expect("fetch").sgpa, 9.5);

        conn.persist(&record("20B91A0501", "Semester 2")).expect("persist s2");
        let all = records_for_student(&conn, "20B91A0501").expect("search");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].academic_period.semester, "Semester 1");

        let p = AcademicPeriod::new("2023-24", "Semester 2");
        assert_eq!(delete_records(&conn, "20B91A0501", Some(&p)).expect("delete"), 1);
        assert_eq!(delete_records(&conn, "20B91A0501", None).expect("delete"), 1);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn corrupt_row_is_not_mistaken_for_missing() {
        let ws = temp_dir("resultsd-db-corrupt");
        let conn = open_db(&ws).expect("open db");
        let r = record("20B91A0502", "Semester 1");
        conn.persist(&r).expect("persist");
        conn.execute("UPDATE student_records SET record_json = '{not json'", [])
            .expect("corrupt");
        assert!(matches!(conn.fetch(&r.key()), Err(StoreError::Corrupt(_))));
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn first_batch_keeps_its_fingerprint() {
        let ws = temp_dir("resultsd-db-batches");
        let conn = open_db(&ws).expect("open db");
        let report = BatchReport::default();
        for id in ["b1", "b2"] {
            insert_batch(
                &conn,
                &NewBatch {
                    id,
                    fingerprint: "fp-1",
                    source: "merge",
                    created_at: "2024-08-01T00:00:00+00:00",
                    report: &report,
                },
            )
            .expect("insert batch");
        }
        assert_eq!(submission_batch(&conn, "fp-1").expect("lookup").as_deref(), Some("b1"));
        assert_eq!(list_batches(&conn, 10).expect("list").len(), 2);
        let b = get_batch(&conn, "b2").expect("get").expect("exists");
        assert_eq!(b["report"]["total_processed"], 0);
        assert!(get_batch(&conn, "nope").expect("get").is_none());
        let _ = std::fs::remove_dir_all(ws);
    }
}

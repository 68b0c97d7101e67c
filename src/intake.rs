use crate::model::{AcademicPeriod, ExamType, IncomingStudent, IncomingSubject};
use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

/// Result sheet layouts the PDF parser knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    Jntuk,
    Autonomous,
}

impl ResultFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jntuk" => Some(Self::Jntuk),
            "autonomous" => Some(Self::Autonomous),
            _ => None,
        }
    }
}

/// Values supplied by the operator; they win over anything in the file.
#[derive(Debug, Clone, Default)]
pub struct IntakeOverrides {
    pub exam_type: Option<ExamType>,
    pub year: Option<String>,
    pub semester: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRow {
    pub index: usize,
    pub student_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedResultFile {
    pub format: Option<ResultFormat>,
    pub students: Vec<IncomingStudent>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Default)]
struct FileMetadata {
    format: Option<ResultFormat>,
    exam_type: Option<ExamType>,
    year: Option<String>,
    semester: Option<String>,
}

pub fn read_result_file(path: &Path, overrides: &IntakeOverrides) -> anyhow::Result<ParsedResultFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
    parse_result_json(&text, overrides)
        .with_context(|| format!("failed to parse {}", path.to_string_lossy()))
}

/// Accepts either a bare array of students or the parser's
/// `{metadata, students}` envelope.
pub fn parse_result_json(text: &str, overrides: &IntakeOverrides) -> anyhow::Result<ParsedResultFile> {
    let root: Value = serde_json::from_str(text).context("result file is not valid JSON")?;
    let (meta, students) = match &root {
        Value::Array(items) => (FileMetadata::default(), items.as_slice()),
        Value::Object(obj) => {
            let meta = obj
                .get("metadata")
                .and_then(|v| v.as_object())
                .map(read_metadata)
                .unwrap_or_default();
            let students = obj
                .get("students")
                .and_then(|v| v.as_array())
                .ok_or_else(|| anyhow!("result file has no students array"))?;
            (meta, students.as_slice())
        }
        _ => return Err(anyhow!("result file must be an array or an object")),
    };

    let mut out = ParsedResultFile {
        format: meta.format,
        ..Default::default()
    };
    for (index, raw) in students.iter().enumerate() {
        match read_student(raw, &meta, overrides) {
            Ok(s) => out.students.push(s),
            Err(reason) => {
                let student_id = raw.as_object().and_then(student_id_of);
                warn!(index, student = ?student_id, %reason, "rejected result row");
                out.rejected.push(RejectedRow {
                    index,
                    student_id,
                    reason,
                });
            }
        }
    }
    debug!(
        accepted = out.students.len(),
        rejected = out.rejected.len(),
        format = ?out.format,
        "read result file"
    );
    Ok(out)
}

fn read_metadata(obj: &Map<String, Value>) -> FileMetadata {
    let format = obj.get("format").and_then(|v| v.as_str()).and_then(|s| {
        let f = ResultFormat::parse(s);
        if f.is_none() {
            warn!(format = s, "unrecognized result format tag");
        }
        f
    });
    // "mixed" files must name the exam type per student.
    let exam_type = obj
        .get("exam_type")
        .or_else(|| obj.get("examType"))
        .and_then(|v| v.as_str())
        .and_then(ExamType::parse);
    let semester = obj
        .get("semesters")
        .and_then(|v| v.as_array())
        .and_then(|a| a.iter().find_map(known_text))
        .or_else(|| obj.get("semester").and_then(known_text));
    FileMetadata {
        format,
        exam_type,
        year: obj.get("year").and_then(known_text),
        semester,
    }
}

/// Text value, or `None` for blanks and the parser's "Unknown" placeholder.
fn known_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() || s.eq_ignore_ascii_case("unknown") {
        return None;
    }
    Some(s)
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| obj.get(*n))
}

fn student_id_of(obj: &Map<String, Value>) -> Option<String> {
    field(obj, &["student_id", "studentId", "htno"]).and_then(known_text)
}

fn read_student(
    raw: &Value,
    meta: &FileMetadata,
    overrides: &IntakeOverrides,
) -> Result<IncomingStudent, String> {
    let obj = raw.as_object().ok_or("student row is not an object")?;
    let student_id = student_id_of(obj).ok_or("missing student_id")?;

    let year = overrides
        .year
        .clone()
        .or_else(|| field(obj, &["year"]).and_then(known_text))
        .or_else(|| meta.year.clone())
        .ok_or("academic year could not be resolved")?;
    let semester = overrides
        .semester
        .clone()
        .or_else(|| field(obj, &["semester"]).and_then(known_text))
        .or_else(|| meta.semester.clone())
        .ok_or("semester could not be resolved")?;
    let exam_type = overrides
        .exam_type
        .or_else(|| {
            field(obj, &["examType", "exam_type"])
                .and_then(|v| v.as_str())
                .and_then(ExamType::parse)
        })
        .or(meta.exam_type)
        .ok_or("exam type could not be resolved")?;

    let subjects = field(obj, &["subjectGrades", "subjects"])
        .and_then(|v| v.as_array())
        .ok_or("missing subjectGrades")?;

    Ok(IncomingStudent {
        student_id,
        academic_period: AcademicPeriod::new(&year, &semester),
        exam_type,
        subjects: subjects.iter().map(read_subject).collect(),
    })
}

/// Missing fields stay empty; the merge engine decides what is usable.
fn read_subject(raw: &Value) -> IncomingSubject {
    let Some(obj) = raw.as_object() else {
        return IncomingSubject::default();
    };
    let text = |names: &[&str]| -> Option<String> {
        field(obj, names).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    let credits = match field(obj, &["credits"]) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    IncomingSubject {
        code: text(&["code", "subject_code", "subjectCode"]),
        name: text(&["subject", "name", "subject_name"]),
        grade: text(&["grade"]).unwrap_or_default(),
        credits,
        result: text(&["result"]),
    }
}

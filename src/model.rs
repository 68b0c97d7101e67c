use crate::error::MergeError;
use crate::grade::{Grade, GradeOrdering};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamType {
    Regular,
    #[serde(alias = "supplementary", alias = "supple")]
    Supply,
}

impl ExamType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Some(Self::Regular),
            "supply" | "supplementary" | "supple" => Some(Self::Supply),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Supply => "supply",
        }
    }
}

/// Summary tag for a whole record. Becomes `Mixed` once a merge from a
/// different exam type changed something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordExamType {
    Regular,
    Supply,
    Mixed,
}

impl From<ExamType> for RecordExamType {
    fn from(e: ExamType) -> Self {
        match e {
            ExamType::Regular => Self::Regular,
            ExamType::Supply => Self::Supply,
        }
    }
}

impl RecordExamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Supply => "supply",
            Self::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassStatus {
    Pass,
    Fail,
}

impl PassStatus {
    pub fn from_grade(grade: &Grade, ordering: &GradeOrdering) -> Self {
        if ordering.is_passing(grade) {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "p" | "passed" => Some(Self::Pass),
            "fail" | "f" | "failed" => Some(Self::Fail),
            _ => None,
        }
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Subject codes compare after trimming and uppercasing.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Hall-ticket style ids: 8-15 ASCII letters/digits, at least one digit.
pub fn normalize_student_id(raw: &str) -> Result<String, MergeError> {
    let id = raw.trim().to_ascii_uppercase();
    let well_formed = (8..=15).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_alphanumeric())
        && id.chars().any(|c| c.is_ascii_digit());
    if !well_formed {
        return Err(MergeError::InvalidStudentId { id: raw.to_string() });
    }
    Ok(id)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AcademicPeriod {
    pub year: String,
    pub semester: String,
}

impl AcademicPeriod {
    pub fn new(year: &str, semester: &str) -> Self {
        Self {
            year: collapse_ws(year),
            semester: collapse_ws(semester),
        }
    }

    pub fn normalized(&self) -> Result<Self, MergeError> {
        let p = Self::new(&self.year, &self.semester);
        if p.year.is_empty() {
            return Err(MergeError::InvalidPeriod {
                reason: "year is empty".into(),
            });
        }
        if p.semester.is_empty() {
            return Err(MergeError::InvalidPeriod {
                reason: "semester is empty".into(),
            });
        }
        Ok(p)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub student_id: String,
    pub period: AcademicPeriod,
}

impl RecordKey {
    /// Document id, e.g. `20B91A0501_2023-24_Semester_1`.
    pub fn doc_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.student_id,
            self.period.year.replace(' ', "_"),
            self.period.semester.replace(' ', "_")
        )
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.student_id, self.period.year, self.period.semester
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub exam_type: ExamType,
    pub grade: Grade,
    pub result: PassStatus,
    pub timestamp: DateTime<Utc>,
    pub improved_over_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectEntry {
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub grade: Grade,
    pub result: PassStatus,
    #[serde(default)]
    pub credits: f64,
    pub exam_type: ExamType,
    pub attempts: u32,
    #[serde(default)]
    pub attempt_history: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_grade: Option<Grade>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeHistoryEntry {
    pub merged_at: DateTime<Utc>,
    pub exam_type: ExamType,
    pub subjects_overwritten: u32,
    pub subjects_added: u32,
    pub subjects_kept: u32,
    pub initial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub student_id: String,
    pub academic_period: AcademicPeriod,
    pub exam_type: RecordExamType,
    pub subjects: BTreeMap<String, SubjectEntry>,
    #[serde(default)]
    pub sgpa: f64,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_report: Option<MergeReport>,
    #[serde(default)]
    pub merge_history: Vec<MergeHistoryEntry>,
}

impl StudentRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            student_id: self.student_id.clone(),
            period: self.academic_period.clone(),
        }
    }

    /// Re-key subjects by normalized code, collapsing duplicates to the best
    /// grade, and re-derive every `result` from its grade. Returns how many
    /// duplicate entries were dropped.
    pub fn normalize(&mut self, ordering: &GradeOrdering) -> usize {
        let mut collapsed = 0;
        let mut out: BTreeMap<String, SubjectEntry> = BTreeMap::new();
        for (_, mut entry) in std::mem::take(&mut self.subjects) {
            entry.code = normalize_code(&entry.code);
            entry.result = PassStatus::from_grade(&entry.grade, ordering);
            match out.get(&entry.code) {
                Some(kept) if !ordering.is_improvement(&kept.grade, &entry.grade) => {
                    collapsed += 1;
                }
                Some(_) => {
                    collapsed += 1;
                    out.insert(entry.code.clone(), entry);
                }
                None => {
                    out.insert(entry.code.clone(), entry);
                }
            }
        }
        self.subjects = out;
        collapsed
    }
}

/// One subject as delivered by the PDF parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingSubject {
    #[serde(default, alias = "subject_code", alias = "subjectCode")]
    pub code: Option<String>,
    #[serde(default, alias = "subject", alias = "subject_name")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub grade: String,
    #[serde(default, deserialize_with = "lenient_credits")]
    pub credits: f64,
    #[serde(default)]
    pub result: Option<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

/// Parser output prints credits as numbers or numeric strings; anything
/// else counts as zero.
fn lenient_credits<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Credits {
        Number(f64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }
    Ok(match Credits::deserialize(d)? {
        Credits::Number(n) => n,
        Credits::Text(s) => s.trim().parse().unwrap_or(0.0),
        Credits::Other(_) => 0.0,
    })
}

/// One student's subjects from one uploaded result sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingStudent {
    #[serde(alias = "student_id")]
    pub student_id: String,
    #[serde(alias = "academic_period")]
    pub academic_period: AcademicPeriod,
    #[serde(alias = "exam_type")]
    pub exam_type: ExamType,
    #[serde(alias = "subjectGrades")]
    pub subjects: Vec<IncomingSubject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Overwrite,
    Preserve,
    KeepAsIs,
    Add,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonTag {
    #[serde(rename = "F_TO_PASS")]
    FToPass,
    #[serde(rename = "GRADE_IMPROVED")]
    GradeImproved,
    #[serde(rename = "NOT_IMPROVED")]
    NotImproved,
    #[serde(rename = "IDENTICAL_RESUBMISSION")]
    IdenticalResubmission,
    #[serde(rename = "NEW_SUBJECT")]
    NewSubject,
    #[serde(rename = "MALFORMED")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAction {
    pub code: String,
    #[serde(rename = "type")]
    pub action: ActionType,
    pub from_grade: Option<Grade>,
    pub to_grade: Option<Grade>,
    pub reason: ReasonTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Improvement {
    pub subject_code: String,
    pub from_grade: Grade,
    pub to_grade: Grade,
    pub attempt_number: u32,
    pub reason: ReasonTag,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub subjects_overwritten: u32,
    pub subjects_added: u32,
    pub subjects_kept: u32,
    pub attempts_tracked: u32,
    #[serde(default)]
    pub subjects_skipped: u32,
    #[serde(default)]
    pub duplicates_collapsed: u32,
    pub improvements: Vec<Improvement>,
    #[serde(default)]
    pub actions: Vec<SubjectAction>,
}

impl MergeReport {
    pub fn changed_anything(&self) -> bool {
        self.subjects_overwritten > 0 || self.subjects_added > 0
    }
}

use crate::error::MergeError;
use crate::grade::{AbsenceRanking, Grade, GradeOrdering};
use crate::model::{
    normalize_code, ActionType, AttemptRecord, ExamType, IncomingSubject, PassStatus, ReasonTag,
    SubjectAction, SubjectEntry,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Whether a found subject whose grade did not change still counts as an
/// attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptCounting {
    #[default]
    EverySubmission,
    SkipIdentical,
}

impl AttemptCounting {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "every_submission" => Some(Self::EverySubmission),
            "skip_identical" => Some(Self::SkipIdentical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EverySubmission => "every_submission",
            Self::SkipIdentical => "skip_identical",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergePolicy {
    pub ordering: GradeOrdering,
    pub attempt_counting: AttemptCounting,
}

impl MergePolicy {
    pub fn new(absence: AbsenceRanking, attempt_counting: AttemptCounting) -> Self {
        Self {
            ordering: GradeOrdering::new(absence),
            attempt_counting,
        }
    }
}

/// An incoming subject after validation: code normalized, grade parsed and
/// pass/fail derived from the grade.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedSubject {
    pub code: String,
    /// `None` when the sheet printed no subject name.
    pub name: Option<String>,
    pub grade: Grade,
    pub result: PassStatus,
    pub credits: f64,
    pub exam_type: ExamType,
}

impl ObservedSubject {
    pub fn from_incoming(
        incoming: &IncomingSubject,
        exam_type: ExamType,
        ordering: &GradeOrdering,
    ) -> Result<Self, MergeError> {
        let code = incoming
            .code
            .as_deref()
            .map(normalize_code)
            .unwrap_or_default();
        if code.is_empty() {
            return Err(MergeError::malformed("missing subject code"));
        }
        if !incoming.credits.is_finite() || incoming.credits < 0.0 {
            return Err(MergeError::malformed(format!(
                "{}: credits must be a non-negative number",
                code
            )));
        }

        let grade = Grade::parse(&incoming.grade);
        if !grade.is_recognized() {
            warn!(
                subject = %code,
                grade = %incoming.grade,
                "unrecognized grade symbol, ranking it below every real grade"
            );
        }
        let result = PassStatus::from_grade(&grade, ordering);
        if let Some(stated) = incoming.result.as_deref().and_then(PassStatus::parse) {
            if stated != result {
                warn!(
                    subject = %code,
                    grade = %grade,
                    stated = ?stated,
                    "stated result disagrees with grade, using grade"
                );
            }
        }

        Ok(Self {
            name: incoming
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            code,
            grade,
            result,
            credits: incoming.credits,
            exam_type,
        })
    }

    /// First sighting of this subject for the student.
    pub fn into_new_entry(self, at: DateTime<Utc>) -> SubjectEntry {
        let first = AttemptRecord {
            attempt_number: 1,
            exam_type: self.exam_type,
            grade: self.grade.clone(),
            result: self.result,
            timestamp: at,
            improved_over_previous: false,
        };
        SubjectEntry {
            name: self.name.unwrap_or_else(|| self.code.clone()),
            code: self.code,
            grade: self.grade,
            result: self.result,
            credits: self.credits,
            exam_type: self.exam_type,
            attempts: 1,
            attempt_history: vec![first],
            original_grade: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub entry: SubjectEntry,
    pub action: SubjectAction,
}

impl Reconciled {
    pub fn attempt_recorded(&self) -> bool {
        matches!(
            self.action.action,
            ActionType::Overwrite | ActionType::Preserve
        )
    }

    /// Overwrites are the only outcome that lands in the improvements list.
    pub fn reason_if_overwritten(&self) -> Option<ReasonTag> {
        match self.action.action {
            ActionType::Overwrite => Some(self.action.reason),
            _ => None,
        }
    }
}

/// Decide the outcome for one stored subject and one newly observed result
/// for the same subject.
pub fn reconcile_subject(
    existing: &SubjectEntry,
    incoming: &IncomingSubject,
    exam_type: ExamType,
    at: DateTime<Utc>,
    policy: &MergePolicy,
) -> Result<Reconciled, MergeError> {
    let observed = ObservedSubject::from_incoming(incoming, exam_type, &policy.ordering)?;
    reconcile_observed(existing, observed, at, policy)
}

pub(crate) fn reconcile_observed(
    existing: &SubjectEntry,
    observed: ObservedSubject,
    at: DateTime<Utc>,
    policy: &MergePolicy,
) -> Result<Reconciled, MergeError> {
    let existing_code = normalize_code(&existing.code);
    if existing_code.is_empty() {
        return Err(MergeError::malformed("stored subject has no code"));
    }
    if existing_code != observed.code {
        return Err(MergeError::malformed(format!(
            "subject code mismatch: stored {}, incoming {}",
            existing_code, observed.code
        )));
    }

    let ord = &policy.ordering;
    let existing_failed = !ord.is_passing(&existing.grade);
    let overwrite_reason = if existing_failed && ord.is_passing(&observed.grade) {
        Some(ReasonTag::FToPass)
    } else if ord.is_improvement(&existing.grade, &observed.grade) {
        Some(ReasonTag::GradeImproved)
    } else {
        None
    };

    if overwrite_reason.is_none()
        && policy.attempt_counting == AttemptCounting::SkipIdentical
        && observed.grade == existing.grade
    {
        debug!(subject = %observed.code, grade = %existing.grade, "identical resubmission kept as is");
        return Ok(Reconciled {
            action: SubjectAction {
                code: existing_code,
                action: ActionType::KeepAsIs,
                from_grade: Some(existing.grade.clone()),
                to_grade: Some(observed.grade),
                reason: ReasonTag::IdenticalResubmission,
                attempt_number: None,
                detail: None,
            },
            entry: existing.clone(),
        });
    }

    let attempt_number = existing.attempts.max(1).saturating_add(1);
    let attempt = AttemptRecord {
        attempt_number,
        exam_type: observed.exam_type,
        grade: observed.grade.clone(),
        result: observed.result,
        timestamp: at,
        improved_over_previous: overwrite_reason.is_some(),
    };

    let Some(reason) = overwrite_reason else {
        debug!(
            subject = %observed.code,
            kept = %existing.grade,
            incoming = %observed.grade,
            attempt = attempt_number,
            "grade not improved, preserving"
        );
        let mut entry = existing.clone();
        entry.code = existing_code.clone();
        entry.attempts = attempt_number;
        entry.attempt_history.push(attempt);
        return Ok(Reconciled {
            action: SubjectAction {
                code: existing_code,
                action: ActionType::Preserve,
                from_grade: Some(existing.grade.clone()),
                to_grade: Some(observed.grade),
                reason: ReasonTag::NotImproved,
                attempt_number: Some(attempt_number),
                detail: None,
            },
            entry,
        });
    };

    debug!(
        subject = %observed.code,
        from = %existing.grade,
        to = %observed.grade,
        attempt = attempt_number,
        reason = ?reason,
        "overwriting grade"
    );
    let mut attempt_history = existing.attempt_history.clone();
    attempt_history.push(attempt);
    let entry = SubjectEntry {
        code: observed.code.clone(),
        name: observed.name.unwrap_or_else(|| existing.name.clone()),
        grade: observed.grade.clone(),
        result: observed.result,
        credits: observed.credits,
        exam_type: observed.exam_type,
        attempts: attempt_number,
        attempt_history,
        original_grade: existing
            .original_grade
            .clone()
            .or_else(|| Some(existing.grade.clone())),
    };
    Ok(Reconciled {
        action: SubjectAction {
            code: observed.code,
            action: ActionType::Overwrite,
            from_grade: Some(existing.grade.clone()),
            to_grade: Some(observed.grade),
            reason,
            attempt_number: Some(attempt_number),
            detail: None,
        },
        entry,
    })
}

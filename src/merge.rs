use crate::calc;
use crate::error::MergeError;
use crate::model::{
    normalize_student_id, ActionType, Improvement, IncomingStudent, MergeHistoryEntry,
    MergeReport, ReasonTag, RecordExamType, RecordKey, StudentRecord, SubjectAction,
};
use crate::reconcile::{reconcile_observed, MergePolicy, ObservedSubject};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: StudentRecord,
    pub report: MergeReport,
    pub created: bool,
}

/// Validates the incoming batch identity and returns the key it targets.
pub fn incoming_key(incoming: &IncomingStudent) -> Result<RecordKey, MergeError> {
    Ok(RecordKey {
        student_id: normalize_student_id(&incoming.student_id)?,
        period: incoming.academic_period.normalized()?,
    })
}

/// Merge one student's freshly parsed subjects into their stored record for
/// the same academic period, or start a new record when there is none.
///
/// Subjects missing from `incoming` are never touched. A subject that cannot
/// be read is skipped and logged in the report; it does not stop the rest.
pub fn merge_student(
    existing: Option<StudentRecord>,
    incoming: &IncomingStudent,
    at: DateTime<Utc>,
    policy: &MergePolicy,
) -> Result<MergeOutcome, MergeError> {
    let key = incoming_key(incoming)?;
    let mut report = MergeReport::default();
    let observed = collapse_incoming(incoming, policy, &mut report);

    let Some(mut record) = existing else {
        let mut record = StudentRecord {
            student_id: key.student_id.clone(),
            academic_period: key.period.clone(),
            exam_type: RecordExamType::from(incoming.exam_type),
            subjects: BTreeMap::new(),
            sgpa: 0.0,
            created_at: at,
            last_updated_at: at,
            merge_report: None,
            merge_history: Vec::new(),
        };
        for subject in observed {
            add_subject(&mut record, subject, at, &mut report);
        }
        finish(&mut record, incoming, at, policy, &report, true);
        debug!(student = %key, added = report.subjects_added, "created record");
        return Ok(MergeOutcome {
            record,
            report,
            created: true,
        });
    };

    let stored_key = RecordKey {
        student_id: normalize_student_id(&record.student_id)
            .unwrap_or_else(|_| record.student_id.clone()),
        period: record.academic_period.normalized()?,
    };
    if stored_key != key {
        return Err(MergeError::RecordMismatch {
            expected: key.to_string(),
            found: stored_key.to_string(),
        });
    }
    let stored_dupes = record.normalize(&policy.ordering);
    if stored_dupes > 0 {
        warn!(student = %key, collapsed = stored_dupes, "stored record had duplicate subject codes");
    }

    let prior_exam_type = record.exam_type;
    for subject in observed {
        if !record.subjects.contains_key(&subject.code) {
            add_subject(&mut record, subject, at, &mut report);
            continue;
        }
        let code = subject.code.clone();
        let reconciled = match reconcile_observed(&record.subjects[&code], subject, at, policy) {
            Ok(r) => r,
            Err(e) => {
                skip_subject(&mut report, code, e);
                continue;
            }
        };

        if reconciled.attempt_recorded() {
            report.attempts_tracked += 1;
        }
        match reconciled.reason_if_overwritten() {
            Some(reason) => {
                report.subjects_overwritten += 1;
                report.improvements.push(Improvement {
                    subject_code: reconciled.entry.code.clone(),
                    from_grade: reconciled
                        .action
                        .from_grade
                        .clone()
                        .unwrap_or_else(|| reconciled.entry.grade.clone()),
                    to_grade: reconciled.entry.grade.clone(),
                    attempt_number: reconciled.entry.attempts,
                    reason,
                });
            }
            None => report.subjects_kept += 1,
        }
        report.actions.push(reconciled.action);
        record.subjects.insert(code, reconciled.entry);
    }

    if RecordExamType::from(incoming.exam_type) != prior_exam_type && report.changed_anything() {
        record.exam_type = RecordExamType::Mixed;
    }
    finish(&mut record, incoming, at, policy, &report, false);
    debug!(
        student = %key,
        overwritten = report.subjects_overwritten,
        added = report.subjects_added,
        kept = report.subjects_kept,
        "merged record"
    );

    Ok(MergeOutcome {
        record,
        report,
        created: false,
    })
}

/// Validate incoming subjects and collapse case/whitespace variants of the
/// same code to the best grade, keeping first-seen order.
fn collapse_incoming(
    incoming: &IncomingStudent,
    policy: &MergePolicy,
    report: &mut MergeReport,
) -> Vec<ObservedSubject> {
    let mut out: Vec<ObservedSubject> = Vec::with_capacity(incoming.subjects.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for raw in &incoming.subjects {
        let observed =
            match ObservedSubject::from_incoming(raw, incoming.exam_type, &policy.ordering) {
                Ok(o) => o,
                Err(e) => {
                    let code = raw.code.clone().unwrap_or_default();
                    skip_subject(report, code, e);
                    continue;
                }
            };
        match index.get(&observed.code) {
            Some(&i) => {
                report.duplicates_collapsed += 1;
                debug!(
                    subject = %observed.code,
                    kept = %policy.ordering.best(&out[i].grade, &observed.grade),
                    "collapsed duplicate subject code"
                );
                if policy.ordering.is_improvement(&out[i].grade, &observed.grade) {
                    out[i] = observed;
                }
            }
            None => {
                index.insert(observed.code.clone(), out.len());
                out.push(observed);
            }
        }
    }
    out
}

fn add_subject(
    record: &mut StudentRecord,
    subject: ObservedSubject,
    at: DateTime<Utc>,
    report: &mut MergeReport,
) {
    report.subjects_added += 1;
    report.actions.push(SubjectAction {
        code: subject.code.clone(),
        action: ActionType::Add,
        from_grade: None,
        to_grade: Some(subject.grade.clone()),
        reason: ReasonTag::NewSubject,
        attempt_number: Some(1),
        detail: None,
    });
    let entry = subject.into_new_entry(at);
    record.subjects.insert(entry.code.clone(), entry);
}

fn skip_subject(report: &mut MergeReport, code: String, e: MergeError) {
    warn!(subject = %code, error = %e, "skipping subject");
    report.subjects_skipped += 1;
    report.actions.push(SubjectAction {
        code,
        action: ActionType::Skip,
        from_grade: None,
        to_grade: None,
        reason: ReasonTag::Malformed,
        attempt_number: None,
        detail: Some(e.to_string()),
    });
}

fn finish(
    record: &mut StudentRecord,
    incoming: &IncomingStudent,
    at: DateTime<Utc>,
    policy: &MergePolicy,
    report: &MergeReport,
    initial: bool,
) {
    record.sgpa = calc::credit_summary(record.subjects.values(), &policy.ordering).sgpa;
    record.last_updated_at = at;
    record.merge_history.push(MergeHistoryEntry {
        merged_at: at,
        exam_type: incoming.exam_type,
        subjects_overwritten: report.subjects_overwritten,
        subjects_added: report.subjects_added,
        subjects_kept: report.subjects_kept,
        initial,
    });
    record.merge_report = Some(report.clone());
}

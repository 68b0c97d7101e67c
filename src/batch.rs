use crate::error::{BatchError, MergeError, StoreError};
use crate::grade::Grade;
use crate::merge::{incoming_key, merge_student, MergeOutcome};
use crate::model::{IncomingStudent, ReasonTag};
use crate::reconcile::MergePolicy;
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::mpsc;
use tracing::{info, warn};

pub const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidRecord,
    LookupFailed,
    MergeFailed,
    PersistFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentFailure {
    pub student_id: String,
    pub year: String,
    pub semester: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeImprovement {
    pub student_id: String,
    pub subject_code: String,
    pub from_grade: Grade,
    pub to_grade: Grade,
    pub attempt_number: u32,
    pub reason: ReasonTag,
}

/// Totals for one batch, summed over every student that was persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub total_processed: u32,
    pub students_found_existing: u32,
    pub students_not_found: u32,
    pub students_updated: u32,
    pub students_failed: u32,
    pub new_records_created: u32,
    pub subjects_overwritten: u32,
    pub subjects_added: u32,
    pub subjects_kept: u32,
    pub subjects_skipped: u32,
    pub total_attempts_tracked: u32,
    pub f_to_pass_conversions: u32,
    pub grade_improvements: Vec<GradeImprovement>,
    pub errors: Vec<StudentFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    pub student_id: String,
    pub succeeded: bool,
}

#[derive(Debug)]
enum StudentOutcome {
    Merged {
        found_existing: bool,
        outcome: MergeOutcome,
    },
    Failed {
        found_existing: Option<bool>,
        failure: StudentFailure,
    },
}

impl StudentOutcome {
    fn succeeded(&self) -> bool {
        matches!(self, StudentOutcome::Merged { .. })
    }
}

fn failure(incoming: &IncomingStudent, kind: FailureKind, message: String) -> StudentFailure {
    StudentFailure {
        student_id: incoming.student_id.trim().to_string(),
        year: incoming.academic_period.year.clone(),
        semester: incoming.academic_period.semester.clone(),
        kind,
        message,
    }
}

/// lookup -> merge -> persist for one student. Never panics or returns early
/// for the batch; every failure is folded into the outcome.
fn process_student<S: RecordStore + ?Sized>(
    store: &S,
    incoming: &IncomingStudent,
    at: DateTime<Utc>,
    policy: &MergePolicy,
) -> StudentOutcome {
    let key = match incoming_key(incoming) {
        Ok(k) => k,
        Err(e) => {
            return StudentOutcome::Failed {
                found_existing: None,
                failure: failure(incoming, FailureKind::InvalidRecord, e.to_string()),
            }
        }
    };

    let existing = match store.fetch(&key) {
        Ok(r) => Some(r),
        Err(StoreError::NotFound) => None,
        Err(e) => {
            return StudentOutcome::Failed {
                found_existing: None,
                failure: failure(incoming, FailureKind::LookupFailed, e.to_string()),
            }
        }
    };
    let found_existing = existing.is_some();

    let outcome = match merge_student(existing, incoming, at, policy) {
        Ok(o) => o,
        Err(e) => {
            let kind = match e {
                MergeError::RecordMismatch { .. } => FailureKind::MergeFailed,
                _ => FailureKind::InvalidRecord,
            };
            return StudentOutcome::Failed {
                found_existing: Some(found_existing),
                failure: failure(incoming, kind, e.to_string()),
            };
        }
    };

    if let Err(e) = store.persist(&outcome.record) {
        return StudentOutcome::Failed {
            found_existing: Some(found_existing),
            failure: failure(incoming, FailureKind::PersistFailed, e.to_string()),
        };
    }

    StudentOutcome::Merged {
        found_existing,
        outcome,
    }
}

impl BatchReport {
    fn absorb(&mut self, outcome: StudentOutcome) {
        self.total_processed += 1;
        match outcome {
            StudentOutcome::Merged {
                found_existing,
                outcome,
            } => {
                self.count_lookup(Some(found_existing));
                self.students_updated += 1;
                if outcome.created {
                    self.new_records_created += 1;
                }
                let r = outcome.report;
                self.subjects_overwritten += r.subjects_overwritten;
                self.subjects_added += r.subjects_added;
                self.subjects_kept += r.subjects_kept;
                self.subjects_skipped += r.subjects_skipped;
                self.total_attempts_tracked += r.attempts_tracked;
                for imp in r.improvements {
                    if imp.reason == ReasonTag::FToPass {
                        self.f_to_pass_conversions += 1;
                    }
                    self.grade_improvements.push(GradeImprovement {
                        student_id: outcome.record.student_id.clone(),
                        subject_code: imp.subject_code,
                        from_grade: imp.from_grade,
                        to_grade: imp.to_grade,
                        attempt_number: imp.attempt_number,
                        reason: imp.reason,
                    });
                }
            }
            StudentOutcome::Failed {
                found_existing,
                failure,
            } => {
                warn!(
                    student = %failure.student_id,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "student not merged"
                );
                self.count_lookup(found_existing);
                self.students_failed += 1;
                self.errors.push(failure);
            }
        }
    }

    /// Students whose input could not be read at all. They never reached the
    /// store, so they only count as processed and failed.
    pub fn add_unreadable(&mut self, failures: Vec<StudentFailure>) {
        for failure in failures {
            warn!(
                student = %failure.student_id,
                error = %failure.message,
                "unreadable student record"
            );
            self.total_processed += 1;
            self.students_failed += 1;
            self.errors.push(failure);
        }
    }

    fn count_lookup(&mut self, found_existing: Option<bool>) {
        match found_existing {
            Some(true) => self.students_found_existing += 1,
            Some(false) => self.students_not_found += 1,
            None => {}
        }
    }
}

/// Merge every student in input order against one store.
///
/// Only an unavailable store stops the batch, and only before the first
/// student. Everything after that ends up in the report.
pub fn merge_batch<S: RecordStore + ?Sized>(
    store: &S,
    records: &[IncomingStudent],
    at: DateTime<Utc>,
    policy: &MergePolicy,
    progress: &mut dyn FnMut(&BatchProgress),
) -> Result<BatchReport, BatchError> {
    store.check_available().map_err(BatchError::StoreUnavailable)?;

    let mut report = BatchReport::default();
    for (i, incoming) in records.iter().enumerate() {
        let outcome = process_student(store, incoming, at, policy);
        progress(&BatchProgress {
            processed: i + 1,
            total: records.len(),
            student_id: incoming.student_id.clone(),
            succeeded: outcome.succeeded(),
        });
        report.absorb(outcome);
    }
    log_summary(&report);
    Ok(report)
}

/// Lane for a student. Every record with the same student and period lands
/// in the same lane, so a key never has two concurrent writers.
fn lane_for(incoming: &IncomingStudent, lanes: usize) -> usize {
    let mut h = DefaultHasher::new();
    match incoming_key(incoming) {
        Ok(key) => key.hash(&mut h),
        Err(_) => incoming.student_id.hash(&mut h),
    }
    (h.finish() % lanes as u64) as usize
}

/// Same contract as [`merge_batch`], spread over `workers` threads. Each
/// worker gets its own store from `open_store`; the report is reduced in
/// input order once every worker is done.
pub fn merge_batch_partitioned<S, F>(
    open_store: F,
    records: &[IncomingStudent],
    at: DateTime<Utc>,
    policy: &MergePolicy,
    workers: usize,
    progress: &mut dyn FnMut(&BatchProgress),
) -> Result<BatchReport, BatchError>
where
    S: RecordStore + Send,
    F: Fn() -> Result<S, StoreError>,
{
    let workers = workers.clamp(1, MAX_WORKERS).min(records.len().max(1));
    if workers == 1 {
        let store = open_store().map_err(BatchError::StoreUnavailable)?;
        return merge_batch(&store, records, at, policy, progress);
    }

    let mut stores = Vec::with_capacity(workers);
    for _ in 0..workers {
        let store = open_store().map_err(BatchError::StoreUnavailable)?;
        store.check_available().map_err(BatchError::StoreUnavailable)?;
        stores.push(store);
    }

    let mut lanes: Vec<Vec<usize>> = vec![Vec::new(); workers];
    for (i, incoming) in records.iter().enumerate() {
        lanes[lane_for(incoming, workers)].push(i);
    }

    let policy = *policy;
    let mut outcomes: Vec<Option<StudentOutcome>> = Vec::new();
    outcomes.resize_with(records.len(), || None);

    std::thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, StudentOutcome)>();
        for (store, lane) in stores.into_iter().zip(lanes) {
            let tx = tx.clone();
            scope.spawn(move || {
                for i in lane {
                    let outcome = process_student(&store, &records[i], at, &policy);
                    if tx.send((i, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut processed = 0;
        for (i, outcome) in rx {
            processed += 1;
            progress(&BatchProgress {
                processed,
                total: records.len(),
                student_id: records[i].student_id.clone(),
                succeeded: outcome.succeeded(),
            });
            outcomes[i] = Some(outcome);
        }
    });

    let mut report = BatchReport::default();
    for outcome in outcomes.into_iter().flatten() {
        report.absorb(outcome);
    }
    log_summary(&report);
    Ok(report)
}

fn log_summary(report: &BatchReport) {
    info!(
        processed = report.total_processed,
        updated = report.students_updated,
        failed = report.students_failed,
        overwritten = report.subjects_overwritten,
        added = report.subjects_added,
        f_to_pass = report.f_to_pass_conversions,
        "batch merged"
    );
}

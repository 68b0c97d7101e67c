use crate::grade::GradeOrdering;
use crate::model::SubjectEntry;
use serde::Serialize;

/// Half-up rounding to 2 decimals, as printed on result sheets.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditSummary {
    pub sgpa: f64,
    pub total_credits: f64,
    pub credits_earned: f64,
    pub backlogs: usize,
}

pub fn credit_summary<'a, I>(subjects: I, ordering: &GradeOrdering) -> CreditSummary
where
    I: IntoIterator<Item = &'a SubjectEntry>,
{
    let mut total_points = 0.0;
    let mut total_credits = 0.0;
    let mut credits_earned = 0.0;
    let mut backlogs = 0;

    for s in subjects {
        let credits = s.credits.max(0.0);
        total_points += s.grade.points() * credits;
        total_credits += credits;
        if ordering.is_passing(&s.grade) {
            credits_earned += credits;
        } else {
            backlogs += 1;
        }
    }

    let sgpa = if total_credits > 0.0 {
        round_off_2_decimals(total_points / total_credits)
    } else {
        0.0
    };

    CreditSummary {
        sgpa,
        total_credits,
        credits_earned,
        backlogs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grade::Grade;
    use crate::model::{ExamType, PassStatus};

    fn subject(code: &str, grade: Grade, credits: f64) -> SubjectEntry {
        let ord = GradeOrdering::default();
        SubjectEntry {
            code: code.to_string(),
            name: String::new(),
            result: PassStatus::from_grade(&grade, &ord),
            grade,
            credits,
            exam_type: ExamType::Regular,
            attempts: 1,
            attempt_history: Vec::new(),
            original_grade: None,
        }
    }

    #[test]
    fn round_off_is_half_up() {
        assert_eq!(round_off_2_decimals(7.125), 7.13);
        assert_eq!(round_off_2_decimals(7.124), 7.12);
        assert_eq!(round_off_2_decimals(0.0), 0.0);
    }

    #[test]
    fn sgpa_weights_by_credits_and_counts_backlogs() {
        let subjects = vec![
            subject("MA101", Grade::A, 4.0),
            subject("CS101", Grade::F, 3.0),
            subject("PH101", Grade::C, 3.0),
        ];
        let s = credit_summary(&subjects, &GradeOrdering::default());
        // (8*4 + 0*3 + 5*3) / 10
        assert_eq!(s.sgpa, 4.7);
        assert_eq!(s.total_credits, 10.0);
        assert_eq!(s.credits_earned, 7.0);
        assert_eq!(s.backlogs, 1);
    }

    #[test]
    fn no_credits_means_zero_sgpa() {
        let subjects = vec![subject("LAB1", Grade::O, 0.0)];
        let s = credit_summary(&subjects, &GradeOrdering::default());
        assert_eq!(s.sgpa, 0.0);
        assert_eq!(s.backlogs, 0);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// A grade symbol as printed on a result sheet.
///
/// Anything outside the closed alphabet is kept verbatim in `Unknown` so it
/// can be shown back to the user, but it always ranks below every real grade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Grade {
    O,
    APlus,
    A,
    BPlus,
    B,
    C,
    D,
    E,
    F,
    Absent,
    Malpractice,
    Unknown(String),
}

/// Best-to-worst, excluding `Unknown`.
pub const ALPHABET: [Grade; 11] = [
    Grade::O,
    Grade::APlus,
    Grade::A,
    Grade::BPlus,
    Grade::B,
    Grade::C,
    Grade::D,
    Grade::E,
    Grade::F,
    Grade::Absent,
    Grade::Malpractice,
];

impl Grade {
    pub fn parse(raw: &str) -> Self {
        let t = raw.trim();
        match t.to_ascii_uppercase().as_str() {
            "O" => Grade::O,
            "A+" => Grade::APlus,
            "A" => Grade::A,
            "B+" => Grade::BPlus,
            "B" => Grade::B,
            "C" => Grade::C,
            "D" => Grade::D,
            "E" => Grade::E,
            "F" => Grade::F,
            "AB" | "ABSENT" => Grade::Absent,
            "MP" | "MALPRACTICE" => Grade::Malpractice,
            _ => Grade::Unknown(t.to_string()),
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Grade::O => "O",
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::E => "E",
            Grade::F => "F",
            Grade::Absent => "Ab",
            Grade::Malpractice => "MP",
            Grade::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Grade::Unknown(_))
    }

    /// 10-point scale used for SGPA. Non-passing symbols carry no points.
    pub fn points(&self) -> f64 {
        match self {
            Grade::O => 10.0,
            Grade::APlus => 9.0,
            Grade::A => 8.0,
            Grade::BPlus => 7.0,
            Grade::B => 6.0,
            Grade::C => 5.0,
            Grade::D => 4.0,
            Grade::E => 3.0,
            Grade::F | Grade::Absent | Grade::Malpractice | Grade::Unknown(_) => 0.0,
        }
    }
}

impl From<String> for Grade {
    fn from(s: String) -> Self {
        Grade::parse(&s)
    }
}

impl From<Grade> for String {
    fn from(g: Grade) -> Self {
        g.symbol().to_string()
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Where absence and malpractice sit relative to F.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceRanking {
    #[default]
    WorseThanFail,
    SameAsFail,
}

impl AbsenceRanking {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "worse_than_fail" => Some(Self::WorseThanFail),
            "same_as_fail" => Some(Self::SameAsFail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorseThanFail => "worse_than_fail",
            Self::SameAsFail => "same_as_fail",
        }
    }
}

/// Total order over grade symbols; lower rank is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GradeOrdering {
    pub absence: AbsenceRanking,
}

const UNKNOWN_RANK: u8 = 11;

impl GradeOrdering {
    pub fn new(absence: AbsenceRanking) -> Self {
        Self { absence }
    }

    pub fn rank(&self, grade: &Grade) -> u8 {
        match grade {
            Grade::O => 0,
            Grade::APlus => 1,
            Grade::A => 2,
            Grade::BPlus => 3,
            Grade::B => 4,
            Grade::C => 5,
            Grade::D => 6,
            Grade::E => 7,
            Grade::F => 8,
            Grade::Absent => match self.absence {
                AbsenceRanking::WorseThanFail => 9,
                AbsenceRanking::SameAsFail => 8,
            },
            Grade::Malpractice => match self.absence {
                AbsenceRanking::WorseThanFail => 10,
                AbsenceRanking::SameAsFail => 8,
            },
            Grade::Unknown(_) => UNKNOWN_RANK,
        }
    }

    pub fn is_improvement(&self, old: &Grade, new: &Grade) -> bool {
        self.rank(new) < self.rank(old)
    }

    pub fn is_passing(&self, grade: &Grade) -> bool {
        self.rank(grade) < self.rank(&Grade::F)
    }

    /// The better of two grades; ties keep `a`.
    pub fn best<'g>(&self, a: &'g Grade, b: &'g Grade) -> &'g Grade {
        if self.is_improvement(a, b) {
            b
        } else {
            a
        }
    }
}

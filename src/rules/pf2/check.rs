//! d20 checks with four-tier degree of success

use serde::{Deserialize, Serialize};

use crate::rules::dice::{roll_d20, Roller};

/// The four outcome tiers of a d20 check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degree {
    CriticalFailure,
    Failure,
    Success,
    CriticalSuccess,
}

impl Degree {
    /// One tier better, clamped at critical success.
    pub fn upgrade(self) -> Self {
        match self {
            Degree::CriticalFailure => Degree::Failure,
            Degree::Failure => Degree::Success,
            _ => Degree::CriticalSuccess,
        }
    }

    /// One tier worse, clamped at critical failure.
    pub fn downgrade(self) -> Self {
        match self {
            Degree::CriticalSuccess => Degree::Success,
            Degree::Success => Degree::Failure,
            _ => Degree::CriticalFailure,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Degree::Success | Degree::CriticalSuccess)
    }
}

/// A resolved check: the die, the total, and the final degree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckResult {
    pub die: i32,
    pub total: i32,
    pub degree: Degree,
}

/// Degree from totals alone: beat the DC by 10 for a critical success,
/// miss it by 10 for a critical failure.
fn base_degree(total: i32, dc: i32) -> Degree {
    if total >= dc + 10 {
        Degree::CriticalSuccess
    } else if total >= dc {
        Degree::Success
    } else if total <= dc - 10 {
        Degree::CriticalFailure
    } else {
        Degree::Failure
    }
}

/// Roll d20 + modifier against a DC. A natural 20 upgrades the degree one
/// tier and never lands below a plain success; a natural 1 downgrades one
/// tier and never lands above a plain failure.
pub fn check(modifier: i32, dc: i32, roller: &mut dyn Roller) -> CheckResult {
    let die = roll_d20(roller);
    let total = die + modifier;
    let mut degree = base_degree(total, dc);
    if die == 20 {
        degree = degree.upgrade().max(Degree::Success);
    } else if die == 1 {
        degree = degree.downgrade().min(Degree::Failure);
    }
    CheckResult { die, total, degree }
}

//! Gate decision between pipeline stages.

use serde::{Deserialize, Serialize};
use stagegate_core::{OverallStatus, StageStatus, ValidationResult};

/// What a validation result means for progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateDecision {
    /// Proceed
    Pass,
    /// Proceed; medium/high findings were reported
    PassWithWarnings,
    /// Stop until a human decides
    Escalate,
    /// Stop; the stage failed
    Fail,
}

impl GateDecision {
    /// Decide from an aggregated result. A failing status wins over the
    /// review flag.
    pub fn from_result(result: &ValidationResult) -> Self {
        if result.summary.overall_status == OverallStatus::Fail {
            GateDecision::Fail
        } else if result.summary.human_review {
            GateDecision::Escalate
        } else if result.summary.overall_status == OverallStatus::Warning {
            GateDecision::PassWithWarnings
        } else {
            GateDecision::Pass
        }
    }

    /// Status a running stage moves to.
    pub fn target_status(&self) -> StageStatus {
        match self {
            GateDecision::Pass | GateDecision::PassWithWarnings => StageStatus::Completed,
            GateDecision::Escalate => StageStatus::AwaitingReview,
            GateDecision::Fail => StageStatus::Failed,
        }
    }

    /// Whether the next stage may start.
    pub fn allows_progress(&self) -> bool {
        matches!(self, GateDecision::Pass | GateDecision::PassWithWarnings)
    }

    /// Stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::Pass => "pass",
            GateDecision::PassWithWarnings => "pass-with-warnings",
            GateDecision::Escalate => "escalate",
            GateDecision::Fail => "fail",
        }
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

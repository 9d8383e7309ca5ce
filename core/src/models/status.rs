//! Canonical status enums shared over the wire between node and controller
//! (spec.md §6 "Status enums").

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status of a pipeline run or a task run-instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum PipelineStatus {
    Error,
    Fail,
    Running,
    Success,
    Queued,
    NotRun,
}

impl PipelineStatus {
    fn severity(self) -> u8 {
        match self {
            PipelineStatus::Success => 0,
            PipelineStatus::Queued | PipelineStatus::NotRun | PipelineStatus::Running => 0,
            PipelineStatus::Fail => 1,
            PipelineStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Success | PipelineStatus::Fail | PipelineStatus::Error
        )
    }
}

/// Combines two statuses, keeping whichever is worse. Used by the run engine to
/// roll up per-task terminal statuses into the run's overall status (spec.md
/// scenario S4: "pipeline ends Fail (worst non-Success wins)").
pub fn worse(a: PipelineStatus, b: PipelineStatus) -> PipelineStatus {
    if b.severity() > a.severity() {
        b
    } else {
        a
    }
}

/// Status of a node (controller's view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum NodeStatus {
    Offline,
    Idle,
    Active,
    Archiving,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worse_picks_error_over_fail() {
        assert_eq!(worse(PipelineStatus::Fail, PipelineStatus::Error), PipelineStatus::Error);
        assert_eq!(worse(PipelineStatus::Error, PipelineStatus::Fail), PipelineStatus::Error);
    }

    #[test]
    fn worse_keeps_existing_when_new_is_success() {
        assert_eq!(worse(PipelineStatus::Fail, PipelineStatus::Success), PipelineStatus::Fail);
    }
}

//! Run lifecycle state machine
//!
//! A run moves through a fixed set of states with an explicit legal-transition
//! table. Every component that wants to move a run (scheduler, user command,
//! watchdog) goes through [`check_transition`]; the store performs the final
//! optimistic compare-and-set so stale actors are rejected.

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Run-level lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet planning
    Draft,
    /// Planner is being invoked and the DAG is being seeded
    Planning,
    /// Scheduler is dispatching work
    Executing,
    /// User paused the run; in-flight work drains, nothing new dispatches
    Paused,
    /// Blocked on a human approval decision
    WaitingApproval,
    /// All nodes terminal, none fatally failed
    Completed,
    /// A node failed with no retry budget left
    Failed,
    /// User cancelled the run
    Cancelled,
}

impl RunStatus {
    /// String tag used on the wire and in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Draft => "draft",
            RunStatus::Planning => "planning",
            RunStatus::Executing => "executing",
            RunStatus::Paused => "paused",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the database tag back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(RunStatus::Draft),
            "planning" => Some(RunStatus::Planning),
            "executing" => Some(RunStatus::Executing),
            "paused" => Some(RunStatus::Paused),
            "waiting_approval" => Some(RunStatus::WaitingApproval),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states have no outgoing transitions and freeze the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// The planning state may terminate directly (planner failure or a cancel
    /// issued before the DAG is seeded); everything else follows the
    /// executing/paused/waiting_approval diamond.
    pub fn can_transition(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (*self, to),
            (Draft, Planning)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Planning, Cancelled)
                | (Executing, Paused)
                | (Executing, WaitingApproval)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
                | (Paused, Executing)
                | (Paused, Cancelled)
                | (WaitingApproval, Executing)
                | (WaitingApproval, Cancelled)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a transition, returning `IllegalTransition` when the edge is not
/// in the legal set.
pub fn check_transition(from: RunStatus, to: RunStatus) -> Result<(), FlowError> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(FlowError::IllegalTransition { from, to })
    }
}

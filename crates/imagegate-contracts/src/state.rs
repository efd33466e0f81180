use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    AwaitingPrompt,
    Generating,
    AwaitingApproval,
    Persisting,
    Completed,
    Cancelled,
    Failed,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingPrompt => "awaiting_prompt",
            Self::Generating => "generating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether `next` is an edge of the workflow graph. Every non-terminal
    /// state may fail; terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (AwaitingPrompt, Generating)
                | (Generating, AwaitingApproval)
                | (AwaitingApproval, Persisting)
                | (AwaitingApproval, Generating)
                | (AwaitingApproval, Cancelled)
                | (Persisting, Completed)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

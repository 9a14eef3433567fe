//! Workflow status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Payload created, before classification.
    Received,
    /// Intent set.
    Classified,
    /// Candidate action set.
    ActionDrafted,
    /// QA decision set.
    Decided,
    /// Auto-sent and every side effect executed.
    Sent,
    /// Auto-send was decided but executing a side effect failed.
    DeliveryFailed,
    /// Draft stored for a human to send.
    AwaitingReview,
    /// Handed to a human.
    Escalated,
    /// Explicitly closed after a terminal branch.
    Closed,
}

impl WorkflowStatus {
    /// Position in the lifecycle order. Terminal branches share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Classified => 1,
            Self::ActionDrafted => 2,
            Self::Decided => 3,
            Self::Sent | Self::DeliveryFailed | Self::AwaitingReview | Self::Escalated => 4,
            Self::Closed => 5,
        }
    }

    /// Check if this status allows transitioning to `target`.
    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        matches!(
            (self, target),
            (Received, Classified)
                | (Classified, ActionDrafted)
                | (ActionDrafted, Decided)
                | (Decided, Sent)
                | (Decided, DeliveryFailed)
                | (Decided, AwaitingReview)
                | (Decided, Escalated)
                | (Sent, Closed)
                | (DeliveryFailed, Closed)
                | (AwaitingReview, Closed)
                | (Escalated, Closed)
        )
    }

    /// A terminal branch of the pipeline (before `Closed`).
    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// No further pipeline stage will write this workflow.
    pub fn is_settled(&self) -> bool {
        self.rank() >= 4
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classified => "classified",
            Self::ActionDrafted => "action_drafted",
            Self::Decided => "decided",
            Self::Sent => "sent",
            Self::DeliveryFailed => "delivery_failed",
            Self::AwaitingReview => "awaiting_review",
            Self::Escalated => "escalated",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "classified" => Ok(Self::Classified),
            "action_drafted" => Ok(Self::ActionDrafted),
            "decided" => Ok(Self::Decided),
            "sent" => Ok(Self::Sent),
            "delivery_failed" => Ok(Self::DeliveryFailed),
            "awaiting_review" => Ok(Self::AwaitingReview),
            "escalated" => Ok(Self::Escalated),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Unknown workflow status: {}", s)),
        }
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Cap on retained transition history.
pub const MAX_TRANSITIONS: usize = 64;

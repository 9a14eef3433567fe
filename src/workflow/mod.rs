//! Workflow data model: payload, lifecycle status, and shared types.

pub mod payload;
pub mod status;
pub mod types;

pub use payload::WorkflowPayload;
pub use status::{StatusTransition, WorkflowStatus};
pub use types::*;

//! Inbound message pipeline.
//!
//! Every message flows through:
//! 1. `ingest` — request validation and thread history
//! 2. `classifier` — rules first, then the text model, with a deterministic fallback
//! 3. `workers` — intent routed to one strategy that proposes a candidate action
//! 4. `guardrail` — risk scoring and the auto_send / draft_only / escalate decision
//! 5. `controller` — stage ordering, persistence and side-effect execution
//!
//! **Side effects run only after `auto_send`.** Every other decision leaves
//! the draft for a human.

pub mod classifier;
pub mod controller;
pub mod guardrail;
pub mod ingest;
pub mod rules;
pub mod workers;

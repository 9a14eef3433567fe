//! Ops Desk — email triage and response pipeline.

pub mod api;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod workflow;

//! Persistence layer: workflow snapshots with optimistic concurrency.

mod libsql_backend;
mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{MAX_LIST_LIMIT, WorkflowFilter, WorkflowStore, WorkflowSummary};

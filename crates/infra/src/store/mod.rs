//! Storage boundary for jobs, groups and results.
//!
//! The traits are split by concern so that each service only names the
//! capability it needs. Both implementations share one transaction type per
//! store, which is what lets the worker resolve a group, write a result and
//! complete the job as one atomic unit.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{FailPoint, InMemoryStore, MemoryTx};
pub use postgres::PgStore;
pub use r#trait::{
    GroupPurge, GroupResolver, GroupSummary, JobQueue, ListEnd, QueueAdmin, ResultQuery,
    ResultRecord, ResultStore, Store,
};

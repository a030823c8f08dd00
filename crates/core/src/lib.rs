//! `dprompts-core`: job data model and pure helpers.
//!
//! This crate contains **no infrastructure concerns**: no database, no HTTP, no
//! filesystem. Everything here is deterministic and unit-testable.

pub mod error;
pub mod id;
pub mod job;
pub mod normalize;
pub mod response;
pub mod schema;

pub use error::{ValidationError, ValidationResult};
pub use id::{GroupId, JobId};
pub use job::{JobArgs, JobSpec, JobTask, SubTask, SubTaskSpec, JOB_KIND};
pub use normalize::{normalize, parse_stored};
pub use response::{ResponsePayload, SINGLE_RESPONSE_KEY};
pub use schema::SchemaRegistry;

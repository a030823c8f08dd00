//! Infrastructure layer: Postgres pool, queue adapter, result persistence,
//! enqueue, workers, export and configuration.

pub mod config;
pub mod db;
pub mod enqueue;
pub mod error;
pub mod export;
pub mod jobs;
pub mod store;
pub mod view;

pub use config::{AppConfig, ConfigError, DatabaseConfig, WorkerSettings};
pub use enqueue::{BulkOptions, BulkSummary, EnqueueError, Enqueuer};
pub use error::{StoreError, StoreResult};
pub use export::{ExportError, ExportFormat, ExportOptions, ExportSummary, ExportWindow, Exporter};
pub use jobs::{JobRunner, JobState, QueuedJob, WorkerError, WorkerPool, WorkerPoolConfig};
pub use store::{InMemoryStore, PgStore};
pub use view::{ResultView, ResultViewer};

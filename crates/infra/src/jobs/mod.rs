//! Background job system: persistent priority queue, worker pool, scheduler.
//!
//! ## Design
//!
//! - Jobs are typed by [`JobKind`]; enqueue rejects kinds with no handler
//! - Delivery is at least once; claims are atomic and settlements conditional
//! - Retryable failures back off exponentially until `max_attempts`
//! - Stuck `processing` jobs are recovered by the executor's supervisor
//!
//! ## Components
//!
//! - `Job`: record with payload, status, attempts and metadata
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobQueue`: enqueue, claim, settle, cancel, inspect
//! - `JobExecutor`: async worker pool running handlers behind breakers
//! - `Scheduler`: recurring maintenance jobs

pub mod executor;
pub mod maintenance;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use maintenance::{register_maintenance_handlers, MaintenanceIntervals};
pub use postgres::PostgresJobStore;
pub use queue::{JobQueue, QueueConfig, QueueError};
pub use registry::{CacheWrite, FnHandler, HandlerRegistry, JobHandler, JobOutput};
pub use scheduler::{RecurringJob, Scheduler, SchedulerHandle};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    EnqueueOptions, Job, JobFilter, JobKind, JobMetadata, JobStats, JobStatus, JobVersion, UnknownVariant,
    DEFAULT_PRIORITY, HIGHEST_PRIORITY, LOWEST_PRIORITY,
};

//! Leased, at-least-once background jobs.
//!
//! Producers enqueue [`JobEnvelope`]s into a [`Broker`]; a [`WorkerRuntime`]
//! claims them under a time-bounded lease, runs the handler registered for the
//! job type and writes the terminal [`JobResult`] to a [`ResultStore`].

pub mod broker;
pub mod config;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use broker::{Broker, BrokerError, MemoryBroker, RedisBroker};
pub use config::{ConfigError, QueueConfig};
pub use error::{QueueError, RuntimeError};
pub use job::{
    ClaimedJob, EnqueueOptions, JobEnvelope, JobId, JobOutcome, JobResult, JobState, JobStatus,
    JobTransition, Lease, QueueDepth, RecurringJob,
};
pub use lifecycle::RuntimeState;
pub use producer::Producer;
pub use registry::{HandlerError, HandlerRegistry, JobError};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use store::{ResultStore, SqliteResultStore, StoreError};
pub use worker::{RegistryFactory, WorkerRuntime};

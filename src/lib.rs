//! # Registry Replicator
//!
//! A replication engine for copying image artifacts (manifests and their
//! content-addressed blobs) between OCI/Docker-v2-compatible registries,
//! driven by declarative rules, on demand or on a cron schedule.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────── Scheduler & Execution Tracker ─────────────┐
//! │ cron timetable · per-rule in-flight map · event bus    │
//! └──────────┬─────────────────────────────────────────────┘
//!            │ execute_rule(rule) → Execution
//!            ▼
//! ┌──────── ReplicationEngine ──────────┐
//! │ walks manifests, dedupes blobs,     │
//! │ submits BlobCopyTasks, pushes       │
//! │ manifests last                      │
//! └──────────┬──────────────────────────┘
//!            │ uses
//!   ┌────────┼───────────────┐
//!   ▼        ▼               ▼
//! WorkerPool  Retry+Backoff  RegistryClient
//! (bounded    (classifies    (auth, rate limit,
//!  queue)      transients)    manifest/blob I/O)
//! ```
//!
//! Blobs are streamed end-to-end and never buffered; manifest bytes are
//! preserved verbatim from fetch to push so content digests survive the
//! trip. For every tag, all referenced blobs are confirmed on the target
//! before its manifest is pushed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use registry_replicator::config::{GlobalSettings, RegistryEndpoint, ReplicationRule};
//! use registry_replicator::events::EventBus;
//! use registry_replicator::scheduler::Scheduler;
//! use registry_replicator::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> registry_replicator::error::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     store.put_endpoint(RegistryEndpoint::for_testing("hub", "https://registry-1.docker.io")).await;
//!     store.put_endpoint(RegistryEndpoint::for_testing("mirror", "https://harbor.internal")).await;
//!     store.put_rule(ReplicationRule::for_testing("nginx-mirror", "hub", "mirror")).await;
//!
//!     let scheduler = Arc::new(Scheduler::new(store, EventBus::new(), GlobalSettings::default()));
//!     scheduler.start();
//!
//!     let execution_id = scheduler.execute_rule("nginx-mirror").await?;
//!     println!("started {}", execution_id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod filter;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod store;

// Re-exports for convenience
pub use config::{GlobalSettings, RegistryEndpoint, ReplicationRule};
pub use engine::ReplicationEngine;
pub use error::{ReplicationError, Result};
pub use events::{EngineEvent, EventBus, ProgressPhase};
pub use execution::{Execution, ExecutionStatus};
pub use filter::{TagFilter, TagInfo};
pub use pool::{Task, WorkerPool};
pub use registry::RegistryClient;
pub use scheduler::Scheduler;
pub use store::{ExecutionStore, MemoryStore};

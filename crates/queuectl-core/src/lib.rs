//! # queuectl-core
//!
//! The durable job-queue state machine at the heart of `queuectl`: the
//! [`Job`] entity and its lifecycle, the [`JobManager`] that is the sole
//! mutator of that lifecycle, the [`DurableStore`] trait every storage
//! backend implements, and the [`Config`] tunables that parameterize both.
//!
//! This crate has no process, socket, or filesystem I/O of its own — it
//! only depends on value types (`chrono`) and the storage trait it is
//! handed. Backends live in `queuectl-store-sqlite`; the process that
//! polls, executes, and reports lives in `queuectl-worker`.
//!
//! ## Architecture
//!
//! ```text
//! Control Plane (CLI)          Worker Runtime
//!        │                           │
//!        ▼                           ▼
//!                  JobManager
//!                      │
//!                      ▼
//!               dyn DurableStore
//!                      │
//!                      ▼
//!              (sqlite / in-memory)
//! ```
//!
//! `JobManager` holds no in-memory replica of a job across calls — every
//! operation round-trips through the store, which is the only place state
//! is allowed to live.

mod config;
mod error;
mod manager;
mod model;
mod store;

pub use config::Config;
pub use error::{Categorizable, QueueError, SafeErrorCategory};
pub use manager::{is_due, EnqueueRequest, JobManager};
pub use model::{Job, JobFilter, JobPatch, JobState, ListOrder, QueueStatus};
pub use store::{DurableStore, StoreError, StoreResult};

pub use async_trait::async_trait;

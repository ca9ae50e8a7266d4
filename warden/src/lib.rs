//! Warden - job scheduler for cloud discovery, compliance evaluation and
//! ad-hoc queries.
//!
//! Warden owns the lifecycle of jobs executed by external workers. It
//! persists each job, publishes it to a durable work queue while honouring
//! global and per-resource-type ceilings, consumes results, and drives the
//! multi-job workflows built on top: compliance runs, dependency sequencers
//! and quick scans.
//!
//! # Core Concepts
//!
//! - **Job**: a [`JobRecord`] of one [`JobCategory`], moving through the
//!   category's [`JobStatus`] state machine. Every status change is a guarded
//!   [`Transition`] so concurrent writers resolve to one winner.
//!
//! - **Dispatch**: a [`DispatchLoop`] per category moves `created` jobs onto
//!   the [`WorkQueue`], throttled by the [`Governor`].
//!
//! - **Results**: a [`ResultConsumer`] per category applies worker results
//!   idempotently and acknowledges the delivery.
//!
//! - **Workflows**: [`ComplianceCoordinator`] fans a compliance job out to
//!   runners and a summarizer, [`JobSequencerService`] launches a job once its
//!   dependencies settle, and [`QuickScanWorkflow`] chains discovery into a
//!   quick compliance run.
//!
//! - **Runtime**: [`WardenRuntime`] hosts every loop until shutdown, and
//!   [`api::router`] exposes the [`JobScheduler`] over HTTP.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store and work queue via sqlx
//! - `metrics` - Prometheus metrics support

/// Component catalogs: integrations, resource types, benchmarks and
/// queries.
pub mod catalog;

/// Startup configuration read from the environment.
pub mod config;

/// Category-agnostic dispatch loop and the [`Dispatchable`] seam.
pub mod dispatch;

/// Result consumption and idempotent application.
pub mod consumer;

pub mod compliance;
pub mod describe_service;
pub mod error;

/// Job lifecycle events and the in-process event bus.
pub mod events;

pub mod failure;

/// Global and per-resource-type publishing ceilings.
pub mod governor;

pub mod handlers;

/// Search-index documents and the [`ResourceIndex`] seam.
pub mod index;

/// Jobs, categories, statuses and per-category specs.
///
/// - [`JobRecord`] - a persisted job
/// - [`JobSpec`] - the category-specific payload
/// - [`JobStatus`] and [`JobCategory::allows`] - the state machines
/// - [`NewJob`] - a job about to be created
pub mod job;

/// Message leases and redelivery backoff.
pub mod lease;

#[cfg(feature = "metrics")]
pub mod metrics;

pub mod quickscan;

/// Work queue abstraction, topics and streams.
pub mod queue;

pub mod sequencer;
pub mod settings;

/// Job and workflow persistence traits.
pub mod store;

pub mod telemetry;
pub mod timeouts;
pub mod triggers;

/// HTTP surface over the [`JobScheduler`].
pub mod api;

/// Production backends.
pub mod persistence;

/// Runtime hosting every loop.
///
/// - [`WardenRuntime`] - the running scheduler
/// - [`WardenRuntimeBuilder`] - wires stores, queue and catalogs
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

pub use catalog::*;
pub use compliance::{Advance, ComplianceCoordinator};
pub use config::*;
pub use consumer::ResultConsumer;
pub use dispatch::{DispatchLoop, Dispatchable, JobContext};
pub use error::{Result, WardenError};
pub use events::*;
pub use governor::Governor;
pub use index::{DeleteTask, IndexedResource, ResourceIndex};
pub use job::*;
pub use lease::*;
pub use queue::*;
pub use quickscan::QuickScanWorkflow;
pub use runtime::{ShutdownToken, WardenRuntime, WardenRuntimeBuilder};
pub use sequencer::{JobSequencerService, SequencedJob, SequencerOutcome};
pub use store::*;
pub use triggers::{JobScheduler, ScheduledTriggers};

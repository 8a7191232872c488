/*
 *  Copyright 2025 Trellis Contributors
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! # Trellis
//!
//! Trellis is a distributed job-tree scheduler for long-running provisioning
//! and deployment work. Work is modeled as trees of jobs: a job runs only
//! once all of its children have succeeded, so a tree executes leaves-first
//! and the root's completion means the whole operation finished.
//!
//! ## Architecture
//!
//! - **Models** ([`Job`], [`JobState`], [`StatusMessage`]): the job record
//!   and its lifecycle (`NEW -> WAITING -> RUNNING -> SUCCESS | FAILED`,
//!   with `ABORTED` for cancellation and failure fallout).
//! - **Job store** ([`JobStore`], [`MemoryJobStore`]): persistent, indexed
//!   storage shared by every node. Index mutations for one logical operation
//!   are applied atomically.
//! - **Builder** ([`JobTreeBuilder`]): declarative assembly of a job tree
//!   before it is committed.
//! - **Scheduler** ([`Scheduler`]): per-node orchestration. Event-driven
//!   evaluation, plugin dispatch, completion recording, failure and abort
//!   propagation.
//! - **Plugins** ([`WorkPlugin`], [`PluginRegistry`]): the capability
//!   interface actual work hides behind, resolved by work type at start
//!   time.
//! - **Status bus** ([`StatusBus`], [`BroadcastBus`]): best-effort state
//!   change fan-out between nodes. The store is the source of truth; the
//!   bus is only a wake-up signal.
//! - **Archival** ([`ArchivalSweep`], [`ColdArchive`]): completed trees age
//!   out of the hot store into per-tree archive files, staying readable
//!   through the store.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis::{
//!     BroadcastBus, JobTreeBuilder, MemoryJobStore, PluginRegistry, Scheduler,
//! };
//!
//! # async fn example(registry: Arc<PluginRegistry>) -> Result<(), trellis::SchedulerError> {
//! let store = Arc::new(MemoryJobStore::new());
//! let bus = Arc::new(BroadcastBus::new());
//! let scheduler = Scheduler::new("node-1", store, registry, bus);
//! scheduler.start();
//!
//! let mut tree = JobTreeBuilder::new(
//!     "deploy_service",
//!     serde_json::json!({"service": "api"}),
//!     "Deploy api",
//! )
//! .add_child(JobTreeBuilder::new(
//!     "build_image",
//!     serde_json::json!({"service": "api"}),
//!     "Build api image",
//! ));
//!
//! let root = scheduler.add_tree(&mut tree, None).await?;
//! scheduler.allow_execution(root, true).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod bus;
pub mod error;
pub mod logging;
pub mod models;
pub mod plugin;
pub mod scheduler;
pub mod store;
pub mod sweep;

pub use builder::JobTreeBuilder;
pub use bus::{BroadcastBus, StatusBus};
pub use error::{BusError, PluginError, SchedulerError, StoreError};
pub use logging::init_logging;
pub use models::{Job, JobId, JobState, JobUpdate, NewJob, StatusMessage};
pub use plugin::{CompletionHandle, PluginRegistry, WorkPlugin};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{ArchivedTree, ColdArchive, JobStore, MemoryJobStore, TreeContext};
pub use sweep::{ArchivalSweep, SweepConfig};

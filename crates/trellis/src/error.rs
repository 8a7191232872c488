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

//! Error types for the job store, scheduler, and status bus.
//!
//! The taxonomy separates recoverable conditions from caller bugs:
//! - `StoreError::NotFound` is a normal, permanent outcome ("nothing to do")
//! - `StoreError::DuplicateJob` indicates a caller bug and is never retried
//! - `StoreError::Unavailable` is connectivity loss; the scheduler retries the
//!   operation and calls `evaluate` once the store is reachable again
//! - Plugin failures never surface here at all; they are absorbed into the
//!   failing job's terminal state

use crate::models::JobId;
use thiserror::Error;

/// Errors produced by [`JobStore`](crate::store::JobStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced job (or its tree) does not exist in the live store or
    /// the cold archive. Always recoverable; callers treat it as "nothing to do".
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A job with this id already exists. Fatal to the call, never retried.
    #[error("duplicate job id: {0}")]
    DuplicateJob(JobId),

    /// The backing store cannot be reached. Recoverable; state transitions are
    /// retried through the reconnect path rather than abandoned.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The tree still contains non-terminal jobs and cannot be deleted.
    #[error("tree {0} still has non-terminal jobs")]
    TreeActive(JobId),

    /// A job record or archive snapshot could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cold-storage I/O failed.
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error is transient connectivity loss worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors produced by the status bus transport.
#[derive(Debug, Error)]
#[error("status bus error: {0}")]
pub struct BusError(pub String);

/// Errors produced by [`Scheduler`](crate::scheduler::Scheduler) operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The referenced `work_type` has no registered plugin. Surfaced at
    /// `add_job`/`add_tree` time; at `start_job` time the job is failed instead.
    #[error("no work plugin registered for type: {0}")]
    PluginNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// An error reported by a work plugin's `start` or `abort` entry point.
///
/// Never propagated into the scheduler's own control flow; always converted
/// into a `completed(id, Failed, ...)` call for the owning job.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        PluginError(message)
    }
}

impl From<&str> for PluginError {
    fn from(message: &str) -> Self {
        PluginError(message.to_string())
    }
}

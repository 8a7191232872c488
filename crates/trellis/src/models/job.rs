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

//! Job Record Model
//!
//! This module defines the unit of work tracked by the job store: the `Job`
//! record, its lifecycle states, and the partial-update structure used by
//! `set_attributes`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque unique identifier for a job, assigned at creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobId(Uuid::parse_str(s)?))
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        JobId(id)
    }
}

/// Lifecycle state of a job.
///
/// `New` and `Waiting` are initial states (set at creation); `Success`,
/// `Failed`, and `Aborted` are terminal. Transitions are driven exclusively
/// by the scheduler:
///
/// ```text
/// New -> Waiting -> Running -> { Success | Failed }
///            \----------\---> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobState {
    /// Whether the state is terminal. Terminal jobs are never re-transitioned.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }

    /// Whether the state indicates a failure outcome.
    pub fn is_error(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Aborted)
    }

    /// The wire name of the state, as carried in status messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(JobState::New),
            "WAITING" => Ok(JobState::Waiting),
            "RUNNING" => Ok(JobState::Running),
            "SUCCESS" => Ok(JobState::Success),
            "FAILED" => Ok(JobState::Failed),
            "ABORTED" => Ok(JobState::Aborted),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// A persisted job record.
///
/// Every non-root job references a parent that exists (or was archived and
/// deleted together with it); `root_id` is resolved once at creation and is
/// immutable afterwards. Tags live only on root jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at creation.
    pub id: JobId,
    /// Immediate parent job; `None` marks a root job.
    pub parent_id: Option<JobId>,
    /// Root of this job's tree (equals `id` for roots).
    pub root_id: JobId,
    /// The worker node responsible for executing this job. Only that node may
    /// start, run, or mutate it.
    pub node_id: String,
    /// Symbolic name of the work plugin that performs this job's action.
    pub work_type: String,
    /// Opaque payload passed to the work plugin.
    pub parameters: serde_json::Value,
    /// Human-readable description.
    pub title: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Retrieval tags; present only on root jobs (e.g. "workspace:7").
    pub tags: BTreeSet<String>,
    /// Whether this job runs cleanup logic when its tree is aborted, even if
    /// its own ordinary action never executed.
    pub abort_handler: bool,
    /// Creation timestamp; used for ordering and age-based archival.
    pub created_at: DateTime<Utc>,
    /// Human-readable result message, set on completion.
    pub summary: Option<String>,
}

impl Job {
    /// Whether this job is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Fields required to create a new job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub parent_id: Option<JobId>,
    pub node_id: String,
    pub work_type: String,
    pub parameters: serde_json::Value,
    pub title: String,
    /// Applied only when the job is a root; ignored otherwise.
    pub tags: BTreeSet<String>,
    /// Initial state; must be `New` or `Waiting`.
    pub state: JobState,
    pub abort_handler: bool,
}

/// Partial update merged into a job record by `set_attributes`.
///
/// A `state` change atomically moves the job between state-partitioned sets
/// at every scope (node, parent's children, tree).
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub summary: Option<String>,
    pub title: Option<String>,
}

impl JobUpdate {
    /// An update that only changes the state.
    pub fn state(state: JobState) -> Self {
        JobUpdate {
            state: Some(state),
            ..Default::default()
        }
    }

    /// An update that changes the state and records a result summary.
    pub fn completion(state: JobState, summary: Option<String>) -> Self {
        JobUpdate {
            state: Some(state),
            summary,
            ..Default::default()
        }
    }
}

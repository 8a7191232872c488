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

//! Status message wire shape.
//!
//! A single logical channel carries these for every job lifecycle transition
//! so that all nodes participating in a tree can react, even though each node
//! can only start jobs assigned to itself. Per-job filtering, if a UI layer
//! needs it, is done by subscribers.

use crate::models::{JobId, JobState};
use serde::{Deserialize, Serialize};

/// A job lifecycle transition, broadcast on the status bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// The job whose state changed.
    pub job_id: JobId,
    /// The job's immediate parent, if any.
    pub parent_id: Option<JobId>,
    /// The state the job transitioned to.
    pub state: JobState,
    /// The node that produced this message. Receivers drop messages stamped
    /// with their own node id; those were acted on synchronously when produced.
    pub source_node: String,
    /// Result summary, when the transition is a completion.
    pub summary: Option<String>,
}

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

//! Job Store Contract
//!
//! Persistence and indexing abstraction over job records, their tree
//! relationships, state-partitioned sets, tags, and per-tree shared context.
//!
//! Key properties every implementation must uphold:
//! - A job belongs to exactly one state-partitioned set at each scope
//!   (node, parent's children, tree) at every moment. The readiness check in
//!   `get_ready_to_run` depends on this.
//! - State transitions apply their full set of index mutations atomically.
//!   Any backend can provide this: a relational transaction, a compare-and-swap
//!   loop, or a single-writer lock.
//! - Connectivity loss is surfaced as `StoreError::Unavailable`, distinctly
//!   from `NotFound`; the scheduler retries the former and treats the latter
//!   as a normal, permanent outcome.

pub mod archive;
pub mod memory;

pub use archive::{ArchivedTree, ColdArchive};
pub use memory::MemoryJobStore;

use crate::error::StoreError;
use crate::models::{Job, JobId, JobState, JobUpdate, NewJob};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Shared key-value map visible to every job in one tree.
pub type TreeContext = HashMap<String, serde_json::Value>;

/// Persistence contract for job records and tree relationships.
///
/// All operations address a job by id unless noted. Operations that resolve
/// a tree accept any member id and walk to the root themselves.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a job record and registers it in every index in one atomic step.
    ///
    /// Resolves `root_id` by following `parent_id` (falling back to the job's
    /// own id for roots). Tags are indexed only when the job is a root.
    ///
    /// # Errors
    ///
    /// `DuplicateJob` if the id already exists; `NotFound` if the named parent
    /// does not.
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError>;

    /// Fetches a single job record. Archived-and-deleted jobs are `NotFound`.
    async fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Batch fetch. Missing ids are simply absent from the result, never an
    /// error. Falls back to cold storage for archived jobs.
    async fn get_jobs(&self, ids: &[JobId]) -> Result<HashMap<JobId, Job>, StoreError>;

    /// All children of a job, or only those currently in one of `states`.
    async fn get_children(
        &self,
        id: JobId,
        states: Option<&[JobState]>,
    ) -> Result<HashSet<JobId>, StoreError>;

    /// Every job in the tree containing `id`, optionally filtered by state
    /// and/or restricted to one node's jobs.
    ///
    /// When both filters are absent and the tree has been archived, this reads
    /// from cold storage instead.
    async fn get_tree(
        &self,
        id: JobId,
        states: Option<&[JobState]>,
        node: Option<&str>,
    ) -> Result<HashSet<JobId>, StoreError>;

    /// Merges `update` into the job record and returns the updated record.
    ///
    /// A `state` change atomically moves the job between the old and new
    /// state-partitioned sets at every scope. When the new state is terminal
    /// and the job is a root, the root is additionally marked completed
    /// (candidate for archival).
    async fn set_attributes(&self, id: JobId, update: JobUpdate) -> Result<Job, StoreError>;

    /// Every job assigned to `node` that is in `waiting_state` and whose
    /// children-in-`success_state` count equals its total children count
    /// (zero children trivially qualifies).
    async fn get_ready_to_run(
        &self,
        node: &str,
        waiting_state: JobState,
        success_state: JobState,
    ) -> Result<HashSet<JobId>, StoreError>;

    /// Bulk-transitions every job in the tree currently in `from` (optionally
    /// intersected with `node`'s jobs) to `to`. Returns the affected ids.
    async fn set_state_for_tree(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        node: Option<&str>,
    ) -> Result<HashSet<JobId>, StoreError>;

    /// Merges `entries` into the tree context of the tree containing `id`.
    /// Writes are last-write-wins per key.
    async fn store_context(&self, id: JobId, entries: TreeContext) -> Result<(), StoreError>;

    /// Reads the accumulated tree context of the tree containing `id`.
    async fn get_context(&self, id: JobId) -> Result<TreeContext, StoreError>;

    /// Attaches tags to the root of the tree containing `id`, updating both
    /// the forward (job -> tags) and reverse (tag -> roots, time-ordered)
    /// indexes.
    async fn tag_job(&self, id: JobId, tags: &[String]) -> Result<(), StoreError>;

    /// Root ids carrying `tag`, most recent first. An unknown tag yields an
    /// empty list.
    async fn find_by_tag(&self, tag: &str, limit: Option<usize>)
        -> Result<Vec<JobId>, StoreError>;

    /// Completed root ids older than `age` that have not been archived yet,
    /// oldest first. These are the archival sweep's candidates.
    async fn find_roots_older_than(
        &self,
        age: chrono::Duration,
        limit: Option<usize>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Removes all job records, relationship sets, and context for the tree
    /// containing `id`. When `keep_indexes` is false, tag and root-list
    /// entries and any cold-storage archive are removed as well.
    ///
    /// # Errors
    ///
    /// `TreeActive` if any live job in the tree is non-terminal. Deleting a
    /// half-finished tree would orphan `NEW` children, so it is refused
    /// outright.
    async fn delete_tree(&self, id: JobId, keep_indexes: bool) -> Result<(), StoreError>;

    /// Snapshots the tree's id list and full job records to cold storage,
    /// then removes the live tree data while preserving tag/root indexes.
    async fn archive_tree(&self, id: JobId) -> Result<(), StoreError>;
}

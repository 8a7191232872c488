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

//! In-Memory Job Store
//!
//! Reference implementation of the [`JobStore`] contract. Every mutating
//! operation applies its full set of index mutations while holding a single
//! lock over the index structures, which realizes the "apply this set of index
//! mutations atomically" requirement without a transactional backend.
//!
//! Index structures maintained:
//! - record map (id -> job)
//! - per-node and per-node-per-state job sets
//! - per-parent children and children-per-state sets
//! - per-tree and tree-per-state sets
//! - time-ordered root index and completed-root set
//! - tag forward (root -> tags) and reverse (tag -> roots, time-ordered) indexes
//! - per-tree shared context
//!
//! An optional [`ColdArchive`] provides transparent fallback for trees that
//! were moved out of the live indexes by `archive_tree`.

use super::{ArchivedTree, ColdArchive, JobStore, TreeContext};
use crate::error::StoreError;
use crate::models::{Job, JobId, JobState, JobUpdate, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use tracing::{debug, info};

const ALL_STATES: [JobState; 6] = [
    JobState::New,
    JobState::Waiting,
    JobState::Running,
    JobState::Success,
    JobState::Failed,
    JobState::Aborted,
];

fn add_to<K: Eq + Hash>(map: &mut HashMap<K, HashSet<JobId>>, key: K, id: JobId) {
    map.entry(key).or_default().insert(id);
}

fn remove_from<K: Eq + Hash>(map: &mut HashMap<K, HashSet<JobId>>, key: &K, id: JobId) {
    let emptied = match map.get_mut(key) {
        Some(set) => {
            set.remove(&id);
            set.is_empty()
        }
        None => false,
    };
    if emptied {
        map.remove(key);
    }
}

#[derive(Default)]
struct Indexes {
    jobs: HashMap<JobId, Job>,
    node_jobs: HashMap<String, HashSet<JobId>>,
    node_state: HashMap<(String, JobState), HashSet<JobId>>,
    children: HashMap<JobId, HashSet<JobId>>,
    children_state: HashMap<(JobId, JobState), HashSet<JobId>>,
    trees: HashMap<JobId, HashSet<JobId>>,
    tree_state: HashMap<(JobId, JobState), HashSet<JobId>>,
    root_index: BTreeSet<(DateTime<Utc>, JobId)>,
    root_created: HashMap<JobId, DateTime<Utc>>,
    tags_forward: HashMap<JobId, BTreeSet<String>>,
    tags_reverse: HashMap<String, BTreeSet<(DateTime<Utc>, JobId)>>,
    contexts: HashMap<JobId, TreeContext>,
    completed_roots: HashSet<JobId>,
    archived_roots: HashSet<JobId>,
    /// Member id -> archived root, preserved until explicit deletion so that
    /// reads keep resolving after a tree moved to cold storage.
    archived_members: HashMap<JobId, JobId>,
}

impl Indexes {
    /// Resolves the root of the tree containing `id`, live or archived.
    fn resolve_root(&self, id: JobId) -> Result<JobId, StoreError> {
        if let Some(job) = self.jobs.get(&id) {
            return Ok(job.root_id);
        }
        if let Some(root) = self.archived_members.get(&id) {
            return Ok(*root);
        }
        Err(StoreError::NotFound(id))
    }

    /// Moves a job between state partitions at every scope. The caller has
    /// already verified the job exists and `from != to`.
    fn move_state(&mut self, job: &Job, from: JobState, to: JobState) {
        let id = job.id;
        remove_from(&mut self.node_state, &(job.node_id.clone(), from), id);
        add_to(&mut self.node_state, (job.node_id.clone(), to), id);
        if let Some(parent) = job.parent_id {
            remove_from(&mut self.children_state, &(parent, from), id);
            add_to(&mut self.children_state, (parent, to), id);
        }
        remove_from(&mut self.tree_state, &(job.root_id, from), id);
        add_to(&mut self.tree_state, (job.root_id, to), id);

        if to.is_terminal() && job.parent_id.is_none() {
            self.completed_roots.insert(id);
        }
    }

    /// Tree members matching the optional state and node filters.
    fn filtered_tree(
        &self,
        root: JobId,
        states: Option<&[JobState]>,
        node: Option<&str>,
    ) -> HashSet<JobId> {
        let mut result: HashSet<JobId> = match states {
            Some(states) => states
                .iter()
                .filter_map(|state| self.tree_state.get(&(root, *state)))
                .flatten()
                .copied()
                .collect(),
            None => self.trees.get(&root).cloned().unwrap_or_default(),
        };
        if let Some(node) = node {
            match self.node_jobs.get(node) {
                Some(node_set) => result.retain(|id| node_set.contains(id)),
                None => result.clear(),
            }
        }
        result
    }
}

/// In-memory [`JobStore`] with optional on-disk cold archive.
pub struct MemoryJobStore {
    state: Mutex<Indexes>,
    archive: Option<ColdArchive>,
}

impl MemoryJobStore {
    /// A store without cold storage; `archive_tree` is unavailable.
    pub fn new() -> Self {
        MemoryJobStore {
            state: Mutex::new(Indexes::default()),
            archive: None,
        }
    }

    /// A store that archives completed trees into `archive`.
    pub fn with_archive(archive: ColdArchive) -> Self {
        MemoryJobStore {
            state: Mutex::new(Indexes::default()),
            archive: Some(archive),
        }
    }

    async fn read_archived(&self, root: JobId) -> Result<ArchivedTree, StoreError> {
        match &self.archive {
            Some(archive) => archive.read(root).await,
            None => Err(StoreError::NotFound(root)),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let mut idx = self.state.lock();

        if idx.jobs.contains_key(&new_job.id) || idx.archived_members.contains_key(&new_job.id) {
            return Err(StoreError::DuplicateJob(new_job.id));
        }
        let root_id = match new_job.parent_id {
            Some(parent) => {
                idx.jobs
                    .get(&parent)
                    .ok_or(StoreError::NotFound(parent))?
                    .root_id
            }
            None => new_job.id,
        };

        let is_root = new_job.parent_id.is_none();
        let created_at = Utc::now();
        let job = Job {
            id: new_job.id,
            parent_id: new_job.parent_id,
            root_id,
            node_id: new_job.node_id,
            work_type: new_job.work_type,
            parameters: new_job.parameters,
            title: new_job.title,
            state: new_job.state,
            tags: if is_root {
                new_job.tags
            } else {
                BTreeSet::new()
            },
            abort_handler: new_job.abort_handler,
            created_at,
            summary: None,
        };

        let id = job.id;
        idx.jobs.insert(id, job.clone());
        add_to(&mut idx.node_jobs, job.node_id.clone(), id);
        add_to(&mut idx.node_state, (job.node_id.clone(), job.state), id);
        if let Some(parent) = job.parent_id {
            add_to(&mut idx.children, parent, id);
            add_to(&mut idx.children_state, (parent, job.state), id);
        }
        add_to(&mut idx.trees, root_id, id);
        add_to(&mut idx.tree_state, (root_id, job.state), id);
        if is_root {
            idx.root_index.insert((created_at, id));
            idx.root_created.insert(id, created_at);
            if !job.tags.is_empty() {
                idx.tags_forward.insert(id, job.tags.clone());
                for tag in &job.tags {
                    idx.tags_reverse
                        .entry(tag.clone())
                        .or_default()
                        .insert((created_at, id));
                }
            }
        }

        debug!(job_id = %id, root_id = %root_id, node = %job.node_id, work_type = %job.work_type, "Job created");
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let archived_root = {
            let idx = self.state.lock();
            if let Some(job) = idx.jobs.get(&id) {
                return Ok(job.clone());
            }
            *idx.archived_members
                .get(&id)
                .ok_or(StoreError::NotFound(id))?
        };
        let tree = self.read_archived(archived_root).await?;
        tree.jobs
            .into_iter()
            .find(|job| job.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    async fn get_jobs(&self, ids: &[JobId]) -> Result<HashMap<JobId, Job>, StoreError> {
        let mut result = HashMap::new();
        // Roots whose archives must be consulted, with the member ids wanted.
        let mut archived: HashMap<JobId, Vec<JobId>> = HashMap::new();
        {
            let idx = self.state.lock();
            for id in ids {
                if let Some(job) = idx.jobs.get(id) {
                    result.insert(*id, job.clone());
                } else if let Some(root) = idx.archived_members.get(id) {
                    archived.entry(*root).or_default().push(*id);
                }
            }
        }
        for (root, wanted) in archived {
            let tree = match self.read_archived(root).await {
                Ok(tree) => tree,
                // A vanished archive behaves like any other missing id.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for job in tree.jobs {
                if wanted.contains(&job.id) {
                    result.insert(job.id, job);
                }
            }
        }
        Ok(result)
    }

    async fn get_children(
        &self,
        id: JobId,
        states: Option<&[JobState]>,
    ) -> Result<HashSet<JobId>, StoreError> {
        let idx = self.state.lock();
        if !idx.jobs.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(match states {
            Some(states) => states
                .iter()
                .filter_map(|state| idx.children_state.get(&(id, *state)))
                .flatten()
                .copied()
                .collect(),
            None => idx.children.get(&id).cloned().unwrap_or_default(),
        })
    }

    async fn get_tree(
        &self,
        id: JobId,
        states: Option<&[JobState]>,
        node: Option<&str>,
    ) -> Result<HashSet<JobId>, StoreError> {
        let root = {
            let idx = self.state.lock();
            let root = idx.resolve_root(id)?;
            if idx.trees.contains_key(&root) {
                return Ok(idx.filtered_tree(root, states, node));
            }
            root
        };
        // Only the unfiltered dump reads cold storage; filters describe live
        // scheduling state, which an archived tree no longer has.
        if states.is_none() && node.is_none() {
            let tree = self.read_archived(root).await?;
            Ok(tree.job_ids().into_iter().collect())
        } else {
            Ok(HashSet::new())
        }
    }

    async fn set_attributes(&self, id: JobId, update: JobUpdate) -> Result<Job, StoreError> {
        let mut idx = self.state.lock();
        let mut job = idx.jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))?;

        if let Some(new_state) = update.state {
            if new_state != job.state {
                let old_state = job.state;
                idx.move_state(&job, old_state, new_state);
                job.state = new_state;
                info!(
                    job_id = %id, tree = %job.root_id,
                    "Job state change: {} -> {}", old_state, new_state
                );
            }
        }
        if let Some(summary) = update.summary {
            job.summary = Some(summary);
        }
        if let Some(title) = update.title {
            job.title = title;
        }

        idx.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get_ready_to_run(
        &self,
        node: &str,
        waiting_state: JobState,
        success_state: JobState,
    ) -> Result<HashSet<JobId>, StoreError> {
        let idx = self.state.lock();
        let waiting = match idx.node_state.get(&(node.to_string(), waiting_state)) {
            Some(set) => set,
            None => return Ok(HashSet::new()),
        };
        Ok(waiting
            .iter()
            .filter(|id| {
                let total = idx.children.get(id).map_or(0, HashSet::len);
                let done = idx
                    .children_state
                    .get(&(**id, success_state))
                    .map_or(0, HashSet::len);
                total == done
            })
            .copied()
            .collect())
    }

    async fn set_state_for_tree(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        node: Option<&str>,
    ) -> Result<HashSet<JobId>, StoreError> {
        let mut idx = self.state.lock();
        let root = idx.resolve_root(id)?;
        let affected = idx.filtered_tree(root, Some(&[from]), node);
        for id in &affected {
            if let Some(mut job) = idx.jobs.get(id).cloned() {
                idx.move_state(&job, from, to);
                job.state = to;
                idx.jobs.insert(*id, job);
            }
        }
        if !affected.is_empty() {
            info!(
                tree = %root, affected = affected.len(),
                "Tree state change: {} -> {}", from, to
            );
        }
        Ok(affected)
    }

    async fn store_context(&self, id: JobId, entries: TreeContext) -> Result<(), StoreError> {
        let mut idx = self.state.lock();
        let root = idx.resolve_root(id)?;
        idx.contexts.entry(root).or_default().extend(entries);
        Ok(())
    }

    async fn get_context(&self, id: JobId) -> Result<TreeContext, StoreError> {
        let idx = self.state.lock();
        let root = idx.resolve_root(id)?;
        Ok(idx.contexts.get(&root).cloned().unwrap_or_default())
    }

    async fn tag_job(&self, id: JobId, tags: &[String]) -> Result<(), StoreError> {
        let mut idx = self.state.lock();
        let root = idx.resolve_root(id)?;
        let created = *idx
            .root_created
            .get(&root)
            .ok_or(StoreError::NotFound(root))?;

        idx.tags_forward
            .entry(root)
            .or_default()
            .extend(tags.iter().cloned());
        for tag in tags {
            idx.tags_reverse
                .entry(tag.clone())
                .or_default()
                .insert((created, root));
        }
        if let Some(job) = idx.jobs.get_mut(&root) {
            job.tags.extend(tags.iter().cloned());
        }
        Ok(())
    }

    async fn find_by_tag(
        &self,
        tag: &str,
        limit: Option<usize>,
    ) -> Result<Vec<JobId>, StoreError> {
        let idx = self.state.lock();
        let roots = match idx.tags_reverse.get(tag) {
            Some(roots) => roots,
            None => return Ok(Vec::new()),
        };
        let limit = limit.unwrap_or(usize::MAX);
        Ok(roots
            .iter()
            .rev()
            .take(limit)
            .map(|(_, root)| *root)
            .collect())
    }

    async fn find_roots_older_than(
        &self,
        age: chrono::Duration,
        limit: Option<usize>,
    ) -> Result<Vec<JobId>, StoreError> {
        let cutoff = Utc::now() - age;
        let limit = limit.unwrap_or(usize::MAX);
        let idx = self.state.lock();
        Ok(idx
            .root_index
            .iter()
            .take_while(|(created, _)| *created <= cutoff)
            .map(|(_, root)| *root)
            .filter(|root| {
                idx.completed_roots.contains(root) && !idx.archived_roots.contains(root)
            })
            .take(limit)
            .collect())
    }

    async fn delete_tree(&self, id: JobId, keep_indexes: bool) -> Result<(), StoreError> {
        let (root, remove_archive_file) = {
            let mut idx = self.state.lock();
            let root = idx.resolve_root(id)?;

            let members: Vec<JobId> = idx
                .trees
                .get(&root)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            if members.iter().any(|member| {
                idx.jobs
                    .get(member)
                    .is_some_and(|job| !job.state.is_terminal())
            }) {
                return Err(StoreError::TreeActive(root));
            }

            for member in &members {
                if let Some(job) = idx.jobs.remove(member) {
                    remove_from(&mut idx.node_jobs, &job.node_id, job.id);
                    remove_from(&mut idx.node_state, &(job.node_id.clone(), job.state), job.id);
                }
                idx.children.remove(member);
                for state in ALL_STATES {
                    idx.children_state.remove(&(*member, state));
                    idx.tree_state.remove(&(*member, state));
                }
            }
            idx.trees.remove(&root);
            for state in ALL_STATES {
                idx.tree_state.remove(&(root, state));
            }
            idx.contexts.remove(&root);

            if keep_indexes {
                (root, false)
            } else {
                if let Some(tags) = idx.tags_forward.remove(&root) {
                    let created = idx.root_created.get(&root).copied();
                    for tag in tags {
                        let emptied = match idx.tags_reverse.get_mut(&tag) {
                            Some(entries) => {
                                if let Some(created) = created {
                                    entries.remove(&(created, root));
                                }
                                entries.is_empty()
                            }
                            None => false,
                        };
                        if emptied {
                            idx.tags_reverse.remove(&tag);
                        }
                    }
                }
                if let Some(created) = idx.root_created.remove(&root) {
                    idx.root_index.remove(&(created, root));
                }
                idx.completed_roots.remove(&root);
                idx.archived_roots.remove(&root);
                idx.archived_members.retain(|_, r| *r != root);
                info!(tree = %root, "Tree deleted, indexes removed");
                (root, true)
            }
        };

        if remove_archive_file {
            if let Some(archive) = &self.archive {
                archive.remove(root).await?;
            }
        }
        Ok(())
    }

    async fn archive_tree(&self, id: JobId) -> Result<(), StoreError> {
        let archive = self.archive.as_ref().ok_or_else(|| {
            StoreError::Unavailable("cold archive not configured".to_string())
        })?;

        let (root, snapshot) = {
            let idx = self.state.lock();
            let root = idx.resolve_root(id)?;
            if idx.archived_roots.contains(&root) {
                return Ok(());
            }
            let members = idx
                .trees
                .get(&root)
                .ok_or(StoreError::NotFound(root))?;
            // A terminal root can sit above a still-running child (mid-run
            // abort). The tree stays live and remains a candidate for the
            // next attempt.
            if members.iter().any(|member| {
                idx.jobs
                    .get(member)
                    .is_some_and(|job| !job.state.is_terminal())
            }) {
                return Err(StoreError::TreeActive(root));
            }
            let snapshot: Vec<Job> = members
                .iter()
                .filter_map(|member| idx.jobs.get(member).cloned())
                .collect();
            (root, snapshot)
        };

        let tree = ArchivedTree {
            root_id: root,
            archived_at: Utc::now(),
            jobs: snapshot,
        };
        archive.write(&tree).await?;

        {
            let mut idx = self.state.lock();
            idx.archived_roots.insert(root);
            for job_id in tree.job_ids() {
                idx.archived_members.insert(job_id, root);
            }
        }

        if let Err(e) = self.delete_tree(root, true).await {
            // Undo the marks and the snapshot so the tree stays live and a
            // later attempt starts clean.
            {
                let mut idx = self.state.lock();
                idx.archived_roots.remove(&root);
                for job_id in tree.job_ids() {
                    idx.archived_members.remove(&job_id);
                }
            }
            archive.remove(root).await?;
            return Err(e);
        }
        info!(tree = %root, jobs = tree.jobs.len(), "Tree archived to cold storage");
        Ok(())
    }
}

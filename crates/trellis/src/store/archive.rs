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

//! Cold Storage for Archived Trees
//!
//! Fully-completed trees are moved out of the live store to bound its memory
//! use. Each archived tree is one JSON file named by its root id; the file
//! holds the full job records so `get_tree`/`get_jobs` can answer for archived
//! roots without the caller knowing the tree was moved.

use crate::error::StoreError;
use crate::models::{Job, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Snapshot of one tree as written to cold storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedTree {
    /// Root of the archived tree.
    pub root_id: JobId,
    /// When the snapshot was taken.
    pub archived_at: DateTime<Utc>,
    /// Every job record in the tree, the root included.
    pub jobs: Vec<Job>,
}

impl ArchivedTree {
    /// The id list of the archived tree.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|job| job.id).collect()
    }
}

/// Directory-backed cold storage, one file per archived tree.
#[derive(Debug, Clone)]
pub struct ColdArchive {
    dir: PathBuf,
}

impl ColdArchive {
    /// Opens (and creates if needed) the archive directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(ColdArchive { dir })
    }

    fn tree_path(&self, root_id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", root_id))
    }

    /// The directory backing this archive.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a tree snapshot, replacing any previous snapshot for the root.
    pub async fn write(&self, tree: &ArchivedTree) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(tree)?;
        let path = self.tree_path(tree.root_id);
        tokio::fs::write(&path, payload).await?;
        debug!(root_id = %tree.root_id, jobs = tree.jobs.len(), "Archived tree snapshot written");
        Ok(())
    }

    /// Reads the snapshot for `root_id`; `NotFound` if none exists.
    pub async fn read(&self, root_id: JobId) -> Result<ArchivedTree, StoreError> {
        let path = self.tree_path(root_id);
        let payload = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(root_id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Removes the snapshot for `root_id`. Missing snapshots are not an error.
    pub async fn remove(&self, root_id: JobId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.tree_path(root_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

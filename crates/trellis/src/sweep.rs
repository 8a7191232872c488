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

//! Archival sweep
//!
//! Background loop that moves finished job trees out of the hot store. A
//! tree is an archival candidate once its root has been terminal for at
//! least `min_age`; the sweep asks the store for candidates in batches and
//! archives each one. Tag and recency indexes survive archival so archived
//! trees stay findable and readable.
//!
//! Run one sweep per deployment, not one per node.

use crate::error::StoreError;
use crate::store::JobStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Configuration for the archival sweep loop.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweep passes.
    pub interval: Duration,
    /// Minimum age of a completed root before its tree is archived.
    pub min_age: chrono::Duration,
    /// Maximum trees archived per pass.
    pub batch_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            interval: Duration::from_secs(60),
            min_age: chrono::Duration::minutes(5),
            batch_limit: 100,
        }
    }
}

/// Periodically archives completed job trees.
pub struct ArchivalSweep {
    store: Arc<dyn JobStore>,
    config: SweepConfig,
    shutdown: AtomicBool,
    notify: Notify,
}

impl ArchivalSweep {
    pub fn new(store: Arc<dyn JobStore>, config: SweepConfig) -> Self {
        ArchivalSweep {
            store,
            config,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Runs the sweep loop until [`shutdown`](ArchivalSweep::shutdown) is
    /// called. A failed pass is logged and retried on the next interval.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            min_age_secs = self.config.min_age.num_seconds(),
            "Archival sweep started"
        );
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Archival sweep stopped");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Archival sweep pass failed");
                    }
                }
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Signals the loop to stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// One sweep pass. Archives every eligible tree up to the batch limit;
    /// a tree that fails to archive is skipped and picked up again next pass.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let candidates = self
            .store
            .find_roots_older_than(self.config.min_age, Some(self.config.batch_limit))
            .await?;
        if candidates.is_empty() {
            debug!("No trees eligible for archival");
            return Ok(0);
        }

        let mut archived = 0;
        for root in candidates {
            match self.store.archive_tree(root).await {
                Ok(()) => {
                    info!(tree = %root, "Archived job tree");
                    archived += 1;
                }
                Err(e) => {
                    error!(tree = %root, error = %e, "Failed to archive job tree");
                }
            }
        }
        Ok(archived)
    }
}

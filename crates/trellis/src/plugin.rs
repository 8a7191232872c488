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

//! Work Plugin Contract and Registry
//!
//! Work plugins perform the actual job actions (SCM checkout, packing,
//! placement, provisioning, ...). The scheduler resolves them through an
//! explicit [`PluginRegistry`] by symbolic `work_type` name, instantiating one
//! plugin per job with that job's parameters.
//!
//! A plugin reports its outcome through the [`CompletionHandle`] bound to its
//! job: exactly one of `success`/`failure` (or `aborted`, after an abort
//! request). Errors returned from `start`/`abort` and panics inside them are
//! absorbed by the scheduler and converted into a `FAILED` completion; a
//! misbehaving plugin can never hang its tree or crash the scheduler.

use crate::error::{PluginError, SchedulerError};
use crate::models::{JobId, JobState};
use crate::store::TreeContext;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A completion report sent from a plugin back to its scheduler.
#[derive(Debug)]
pub(crate) struct Completion {
    pub job_id: JobId,
    pub state: JobState,
    pub context: Option<TreeContext>,
    pub summary: Option<String>,
}

/// Handle through which a plugin reports the outcome of its job.
///
/// Cloneable; reports after the first one for the same job are ignored by the
/// scheduler (terminal states are never re-flipped).
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    job_id: JobId,
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionHandle {
    pub(crate) fn new(job_id: JobId, tx: mpsc::UnboundedSender<Completion>) -> Self {
        CompletionHandle { job_id, tx }
    }

    /// The job this handle reports for.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    fn send(&self, state: JobState, context: Option<TreeContext>, summary: Option<String>) {
        // A closed channel means the scheduler shut down; nothing left to do.
        let _ = self.tx.send(Completion {
            job_id: self.job_id,
            state,
            context,
            summary,
        });
    }

    /// Reports success, merging `context` into the tree context.
    pub fn success(&self, context: TreeContext, summary: impl Into<String>) {
        self.send(JobState::Success, Some(context), Some(summary.into()));
    }

    /// Reports failure. The scheduler will abort the rest of the tree.
    pub fn failure(&self, summary: impl Into<String>) {
        self.send(JobState::Failed, None, Some(summary.into()));
    }

    /// Reports that the job stopped in response to an abort request.
    pub fn aborted(&self, summary: impl Into<String>) {
        self.send(JobState::Aborted, None, Some(summary.into()));
    }
}

/// Capability interface for work plugins.
///
/// One instance is created per job, with the job's id and parameters bound at
/// instantiation time through the registry's factory.
#[async_trait]
pub trait WorkPlugin: Send + Sync {
    /// Begins the job's action. Runs on its own task; may suspend freely.
    ///
    /// The plugin must eventually call exactly one of
    /// [`CompletionHandle::success`] or [`CompletionHandle::failure`].
    /// Returning an error is equivalent to a failure report.
    async fn start(
        &self,
        handle: CompletionHandle,
        context: TreeContext,
    ) -> Result<(), PluginError>;

    /// Requested only while the job is `RUNNING`. Must eventually produce a
    /// completion (conventionally via [`CompletionHandle::aborted`]) to
    /// unblock the tree.
    async fn abort(&self, handle: CompletionHandle) -> Result<(), PluginError> {
        handle.aborted("Abort requested");
        Ok(())
    }

    /// Cleanup entry point, invoked only on jobs created with the
    /// abort-handler flag, during failure handling, once per failure episode.
    /// Runs even if the job's own ordinary action never started.
    async fn cleanup(&self, _context: TreeContext) {}
}

/// Factory producing a plugin instance for one job.
type PluginFactory =
    Box<dyn Fn(JobId, &serde_json::Value) -> Arc<dyn WorkPlugin> + Send + Sync>;

/// Registry of work plugin factories, keyed by symbolic `work_type` name.
///
/// Constructed once per process and passed by reference into the scheduler;
/// there is no process-global registry.
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `work_type`, replacing any previous one.
    pub fn register<F>(&self, work_type: impl Into<String>, factory: F)
    where
        F: Fn(JobId, &serde_json::Value) -> Arc<dyn WorkPlugin> + Send + Sync + 'static,
    {
        let work_type = work_type.into();
        debug!(work_type = %work_type, "Registered work plugin");
        self.factories.write().insert(work_type, Box::new(factory));
    }

    /// Whether a plugin is registered for `work_type`.
    pub fn contains(&self, work_type: &str) -> bool {
        self.factories.read().contains_key(work_type)
    }

    /// Instantiates the plugin for one job.
    pub fn instantiate(
        &self,
        work_type: &str,
        job_id: JobId,
        parameters: &serde_json::Value,
    ) -> Result<Arc<dyn WorkPlugin>, SchedulerError> {
        let factories = self.factories.read();
        let factory = factories
            .get(work_type)
            .ok_or_else(|| SchedulerError::PluginNotFound(work_type.to_string()))?;
        Ok(factory(job_id, parameters))
    }

    /// All registered work type names.
    pub fn registered_types(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

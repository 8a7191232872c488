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

//! Scheduler
//!
//! Orchestration logic for job trees. The scheduler commits trees, advances
//! jobs between lifecycle states, determines which jobs are eligible to run
//! on the local node, dispatches to work plugins, records completion, and
//! propagates failure.
//!
//! Each node runs one scheduler over a shared job store. Scheduling is
//! event-driven, not timer-driven: `evaluate` runs whenever a `WAITING` or
//! `SUCCESS` status is observed, locally produced or received from the bus.
//! A job becomes eligible exactly when all its children have reached success;
//! leaves are trivially eligible.
//!
//! Failure propagation: a `FAILED`/`ABORTED` status makes every node abort its
//! own still-`WAITING` jobs in the affected tree, request asynchronous aborts
//! from its live plugins, and run any abort-handler cleanup jobs once per
//! failure episode. A single misbehaving job degrades to a terminal state; it
//! never crashes the scheduler.

use crate::builder::JobTreeBuilder;
use crate::bus::StatusBus;
use crate::error::{SchedulerError, StoreError};
use crate::models::{Job, JobId, JobState, JobUpdate, NewJob, StatusMessage};
use crate::plugin::{Completion, CompletionHandle, PluginRegistry, WorkPlugin};
use crate::store::{JobStore, TreeContext};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

/// Configuration parameters for scheduler behavior.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between retries when the job store reports connectivity loss
    /// during a state transition.
    pub store_retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            store_retry_interval: Duration::from_millis(500),
        }
    }
}

struct Inner {
    node_id: String,
    store: Arc<dyn JobStore>,
    registry: Arc<PluginRegistry>,
    bus: Arc<dyn StatusBus>,
    config: SchedulerConfig,
    /// In-flight guard: jobs this node is currently starting. Makes
    /// `start_job` idempotent against duplicate triggers.
    starting: Mutex<HashSet<JobId>>,
    /// Live plugin instances for jobs currently `RUNNING` on this node.
    running: Mutex<HashMap<JobId, Arc<dyn WorkPlugin>>>,
    /// Trees whose abort-handler cleanup has already run on this node.
    handled_failures: Mutex<HashSet<JobId>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    /// Wakes the event loop for a catch-up evaluation after a store outage.
    catch_up: Notify,
    shutdown: Notify,
    shutdown_flag: AtomicBool,
}

/// Per-node scheduler over a shared job store and status bus.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: Arc<PluginRegistry>,
        bus: Arc<dyn StatusBus>,
    ) -> Self {
        Self::with_config(node_id, store, registry, bus, SchedulerConfig::default())
    }

    pub fn with_config(
        node_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: Arc<PluginRegistry>,
        bus: Arc<dyn StatusBus>,
        config: SchedulerConfig,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Scheduler {
            inner: Arc::new(Inner {
                node_id: node_id.into(),
                store,
                registry,
                bus,
                config,
                starting: Mutex::new(HashSet::new()),
                running: Mutex::new(HashMap::new()),
                handled_failures: Mutex::new(HashSet::new()),
                completions_tx,
                completions_rx: Mutex::new(Some(completions_rx)),
                catch_up: Notify::new(),
                shutdown: Notify::new(),
                shutdown_flag: AtomicBool::new(false),
            }),
        }
    }

    /// The node this scheduler runs on.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Spawns the scheduler's event loop: one subscription to the status bus
    /// plus the plugin completion channel. Subsequent calls are no-ops; the
    /// completion channel has a single consumer.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let mut completions = match self.inner.completions_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!(node = %self.inner.node_id, "Scheduler event loop already started");
                return tokio::spawn(async {});
            }
        };
        let mut bus_rx = self.inner.bus.subscribe();
        let sched = self.clone();
        info!(node = %self.inner.node_id, "Scheduler started");

        tokio::spawn(async move {
            loop {
                if sched.inner.shutdown_flag.load(Ordering::SeqCst) {
                    debug!(node = %sched.inner.node_id, "Scheduler event loop stopped");
                    break;
                }
                tokio::select! {
                    _ = sched.inner.shutdown.notified() => {}
                    _ = sched.inner.catch_up.notified() => {
                        if let Err(e) = sched.evaluate().await {
                            warn!(error = %e, "Catch-up evaluation failed");
                        }
                    }
                    completion = completions.recv() => {
                        if let Some(c) = completion {
                            if let Err(e) = sched.completed(c.job_id, c.state, c.context, c.summary).await {
                                warn!(job_id = %c.job_id, error = %e, "Failed to record completion");
                            }
                        }
                    }
                    result = bus_rx.recv() => match result {
                        Ok(message) => sched.dispatch(message).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // The bus is at-least-once; a re-evaluation picks up
                            // anything announced in the dropped messages.
                            warn!(missed, "Status bus receiver lagged, re-evaluating");
                            if let Err(e) = sched.evaluate().await {
                                warn!(error = %e, "Catch-up evaluation failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Status bus closed, stopping scheduler event loop");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signals the event loop to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown_flag.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    /// Reacts to a status message received from the bus. Messages stamped
    /// with the local node id were already acted on when produced.
    async fn dispatch(&self, message: StatusMessage) {
        if message.source_node == self.inner.node_id {
            return;
        }
        debug!(
            job_id = %message.job_id, state = %message.state, source = %message.source_node,
            "Received status message"
        );
        let result = match message.state {
            JobState::Waiting | JobState::Success => self.evaluate().await,
            JobState::Failed | JobState::Aborted => self.handle_failure(&message).await,
            JobState::New | JobState::Running => Ok(()),
        };
        if let Err(e) = result {
            warn!(job_id = %message.job_id, error = %e, "Failed to act on status message");
        }
    }

    async fn publish_status(&self, job: &Job) {
        let message = StatusMessage {
            job_id: job.id,
            parent_id: job.parent_id,
            state: job.state,
            source_node: self.inner.node_id.clone(),
            summary: job.summary.clone(),
        };
        if let Err(e) = self.inner.bus.publish(message).await {
            warn!(job_id = %job.id, error = %e, "Failed to publish status");
        }
    }

    /// Applies a record update, riding out store connectivity loss. On
    /// reconnect a catch-up evaluation is scheduled for anything missed while
    /// disconnected.
    async fn update_with_retry(
        &self,
        id: JobId,
        update: JobUpdate,
    ) -> Result<Job, SchedulerError> {
        let mut reconnected = false;
        loop {
            match self.inner.store.set_attributes(id, update.clone()).await {
                Ok(job) => {
                    if reconnected {
                        info!(job_id = %id, "Job store reachable again");
                        // The event loop runs the catch-up evaluation; this
                        // path sits under evaluate itself and must not recurse.
                        self.inner.catch_up.notify_one();
                    }
                    return Ok(job);
                }
                Err(e) if e.is_transient() => {
                    warn!(job_id = %id, error = %e, "Job store unavailable, retrying transition");
                    reconnected = true;
                    tokio::time::sleep(self.inner.config.store_retry_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn clear_runtime(&self, id: JobId) {
        self.inner.starting.lock().remove(&id);
        self.inner.running.lock().remove(&id);
    }

    /// Creates a single job in `NEW` state under `parent` and broadcasts it.
    /// The builder's children, if any, are not committed; use [`add_tree`]
    /// for that.
    ///
    /// [`add_tree`]: Scheduler::add_tree
    pub async fn add_job(
        &self,
        builder: &mut JobTreeBuilder,
        parent: Option<JobId>,
    ) -> Result<JobId, SchedulerError> {
        self.commit_one(builder, parent).await
    }

    /// Commits a whole builder tree depth-first, root job first, optionally
    /// grafted under an existing `parent` job. Every builder node is stamped
    /// with its assigned id; the root id is returned once the entire subtree
    /// has been committed.
    pub async fn add_tree(
        &self,
        builder: &mut JobTreeBuilder,
        parent: Option<JobId>,
    ) -> Result<JobId, SchedulerError> {
        let root = self.commit_recursive(builder, parent).await?;
        info!(root_id = %root, "Job tree committed");
        Ok(root)
    }

    fn commit_recursive<'a>(
        &'a self,
        builder: &'a mut JobTreeBuilder,
        parent: Option<JobId>,
    ) -> BoxFuture<'a, Result<JobId, SchedulerError>> {
        async move {
            let id = self.commit_one(builder, parent).await?;
            for child in builder.children_mut() {
                self.commit_recursive(child, Some(id)).await?;
            }
            Ok(id)
        }
        .boxed()
    }

    async fn commit_one(
        &self,
        builder: &mut JobTreeBuilder,
        parent: Option<JobId>,
    ) -> Result<JobId, SchedulerError> {
        if !self.inner.registry.contains(builder.work_type()) {
            return Err(SchedulerError::PluginNotFound(
                builder.work_type().to_string(),
            ));
        }
        let id = JobId::new();
        let node_id = builder
            .node()
            .unwrap_or(&self.inner.node_id)
            .to_string();
        let job = self
            .inner
            .store
            .create_job(NewJob {
                id,
                parent_id: parent,
                node_id,
                work_type: builder.work_type().to_string(),
                parameters: builder.parameters().clone(),
                title: builder.title().to_string(),
                tags: builder.tags().clone(),
                state: JobState::New,
                abort_handler: builder.is_abort_handler(),
            })
            .await?;
        if !builder.context().is_empty() {
            self.inner
                .store
                .store_context(id, builder.context().clone())
                .await?;
        }
        builder.stamp(id);
        debug!(job_id = %id, work_type = %job.work_type, node = %job.node_id, "Job added");
        self.publish_status(&job).await;
        Ok(id)
    }

    /// Releases the tree containing `id` for execution: every `NEW` job moves
    /// to `WAITING`, other nodes holding part of the tree are notified, and a
    /// local evaluation starts whatever became runnable here.
    pub async fn allow_execution(
        &self,
        id: JobId,
        notify_others: bool,
    ) -> Result<(), SchedulerError> {
        let job = match self.inner.store.get_job(id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let root = job.root_id;
        let released = self
            .inner
            .store
            .set_state_for_tree(root, JobState::New, JobState::Waiting, None)
            .await?;
        info!(tree = %root, jobs = released.len(), "Execution allowed");

        if notify_others {
            let root_job = if job.id == root {
                job
            } else {
                self.inner.store.get_job(root).await?
            };
            let message = StatusMessage {
                job_id: root,
                parent_id: root_job.parent_id,
                state: JobState::Waiting,
                source_node: self.inner.node_id.clone(),
                summary: None,
            };
            if let Err(e) = self.inner.bus.publish(message).await {
                warn!(tree = %root, error = %e, "Failed to publish execution release");
            }
        }
        self.evaluate().await
    }

    /// Applies [`allow_execution`](Scheduler::allow_execution) to several
    /// roots in sequence.
    pub async fn allow_execution_list(
        &self,
        ids: &[JobId],
        notify_others: bool,
    ) -> Result<(), SchedulerError> {
        for id in ids {
            self.allow_execution(*id, notify_others).await?;
        }
        Ok(())
    }

    /// The local scheduling tick: starts every job assigned to this node
    /// whose children have all succeeded. Invoked whenever a `WAITING` or
    /// `SUCCESS` status is observed, never on a timer; the tree only advances
    /// when something changes.
    pub async fn evaluate(&self) -> Result<(), SchedulerError> {
        let ready = self
            .inner
            .store
            .get_ready_to_run(&self.inner.node_id, JobState::Waiting, JobState::Success)
            .await?;
        if !ready.is_empty() {
            debug!(node = %self.inner.node_id, count = ready.len(), "Jobs ready to run");
        }
        for id in ready {
            // One unstartable job must not hold up unrelated siblings; it
            // gets picked up again on the next trigger.
            if let Err(e) = self.start_job(id).await {
                warn!(job_id = %id, error = %e, "Failed to start ready job");
            }
        }
        Ok(())
    }

    /// Starts one job on this node. Idempotent against duplicate triggers:
    /// concurrent calls for the same id start the plugin exactly once.
    pub async fn start_job(&self, id: JobId) -> Result<(), SchedulerError> {
        if !self.inner.starting.lock().insert(id) {
            debug!(job_id = %id, "Job already starting, skipping duplicate trigger");
            return Ok(());
        }
        match self.try_start(id).await {
            Ok(started) => {
                if !started {
                    self.inner.starting.lock().remove(&id);
                }
                Ok(())
            }
            Err(e) => {
                self.inner.starting.lock().remove(&id);
                Err(e)
            }
        }
    }

    /// Returns whether the plugin was actually launched. The `starting` guard
    /// is held by the caller and released on completion (or on `false`).
    async fn try_start(&self, id: JobId) -> Result<bool, SchedulerError> {
        let job = match self.inner.store.get_job(id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if job.node_id != self.inner.node_id {
            debug!(job_id = %id, owner = %job.node_id, "Job belongs to another node");
            return Ok(false);
        }
        if job.state != JobState::Waiting {
            debug!(job_id = %id, state = %job.state, "Job no longer waiting");
            return Ok(false);
        }

        let plugin = match self
            .inner
            .registry
            .instantiate(&job.work_type, id, &job.parameters)
        {
            Ok(plugin) => plugin,
            Err(SchedulerError::PluginNotFound(work_type)) => {
                // Fail the job rather than start it; the rest of the tree
                // then aborts through the normal failure path.
                warn!(job_id = %id, work_type = %work_type, "Work plugin not registered, failing job");
                let handle = CompletionHandle::new(id, self.inner.completions_tx.clone());
                handle.failure(format!(
                    "No work plugin registered for type '{}'",
                    work_type
                ));
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let context = match self.inner.store.get_context(id).await {
            Ok(context) => context,
            Err(StoreError::NotFound(_)) => TreeContext::new(),
            Err(e) => return Err(e.into()),
        };

        // The plugin must be reachable for aborts from the moment the store
        // shows the job as RUNNING, so it enters the map before the
        // transition is committed.
        self.inner.running.lock().insert(id, plugin.clone());
        let job = match self
            .update_with_retry(id, JobUpdate::state(JobState::Running))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                self.inner.running.lock().remove(&id);
                return Err(e);
            }
        };
        info!(job_id = %id, work_type = %job.work_type, title = %job.title, "Starting job");
        self.publish_status(&job).await;

        let handle = CompletionHandle::new(id, self.inner.completions_tx.clone());
        let failure_handle = handle.clone();
        // The plugin runs on its own task; a second task converts a returned
        // error or a panic into a FAILED completion so a misbehaving plugin
        // cannot hang the tree.
        let plugin_task = tokio::spawn(async move { plugin.start(handle, context).await });
        tokio::spawn(async move {
            match plugin_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure_handle.failure(format!("Exception thrown: {}", e)),
                Err(join_error) if join_error.is_panic() => {
                    failure_handle.failure(format!(
                        "Exception thrown: {}",
                        panic_message(join_error.into_panic())
                    ));
                }
                Err(_) => {}
            }
        });
        Ok(true)
    }

    /// Records a job's completion: merges any context delta first (so
    /// concurrent evaluators see it), applies the terminal state and summary,
    /// releases the node-local runtime entries, and broadcasts the status.
    ///
    /// Jobs already in a terminal state are left untouched; a stray duplicate
    /// callback can never re-flip a finished outcome.
    pub async fn completed(
        &self,
        id: JobId,
        state: JobState,
        context: Option<TreeContext>,
        summary: Option<String>,
    ) -> Result<(), SchedulerError> {
        if let Some(context) = context {
            match self.inner.store.store_context(id, context).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let job = match self.inner.store.get_job(id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                self.clear_runtime(id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if job.state.is_terminal() {
            debug!(job_id = %id, state = %job.state, "Ignoring completion for terminal job");
            self.clear_runtime(id);
            return Ok(());
        }

        let updated = self
            .update_with_retry(id, JobUpdate::completion(state, summary))
            .await?;
        self.clear_runtime(id);
        info!(
            job_id = %id, tree = %updated.root_id, state = %state,
            summary = updated.summary.as_deref().unwrap_or(""),
            "Job completed"
        );
        self.publish_status(&updated).await;

        match state {
            JobState::Success => self.evaluate().await,
            JobState::Failed | JobState::Aborted => {
                let message = StatusMessage {
                    job_id: id,
                    parent_id: updated.parent_id,
                    state,
                    source_node: self.inner.node_id.clone(),
                    summary: updated.summary,
                };
                self.handle_failure(&message).await
            }
            _ => Ok(()),
        }
    }

    /// Failure propagation for the tree containing the failed job, on the
    /// local node only:
    ///
    /// 1. every still-`WAITING` job this node owns in the tree is aborted and
    ///    broadcast;
    /// 2. every `RUNNING` job here with a live plugin gets an asynchronous
    ///    abort request (never inline); the plugin reports `ABORTED` itself;
    /// 3. abort-handler jobs here have their cleanup entry point invoked,
    ///    once per failure episode, whether or not they ever ran.
    pub async fn handle_failure(&self, message: &StatusMessage) -> Result<(), SchedulerError> {
        let root = match self.inner.store.get_job(message.job_id).await {
            Ok(job) => job.root_id,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let node = self.inner.node_id.as_str();

        let aborted = self
            .inner
            .store
            .set_state_for_tree(root, JobState::Waiting, JobState::Aborted, Some(node))
            .await?;
        if !aborted.is_empty() {
            info!(tree = %root, jobs = aborted.len(), "Aborted waiting jobs after failure");
            let ids: Vec<JobId> = aborted.iter().copied().collect();
            let jobs = self.inner.store.get_jobs(&ids).await?;
            for job in jobs.values() {
                self.publish_status(job).await;
            }
        }

        let running_here = self
            .inner
            .store
            .get_tree(root, Some(&[JobState::Running]), Some(node))
            .await?;
        for id in running_here {
            let plugin = self.inner.running.lock().get(&id).cloned();
            if let Some(plugin) = plugin {
                debug!(job_id = %id, "Requesting plugin abort");
                let handle = CompletionHandle::new(id, self.inner.completions_tx.clone());
                let failure_handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = plugin.abort(handle).await {
                        failure_handle.failure(format!("Exception thrown: {}", e));
                    }
                });
            }
        }

        if self.inner.handled_failures.lock().insert(root) {
            let members = self
                .inner
                .store
                .get_tree(root, None, Some(node))
                .await?;
            let ids: Vec<JobId> = members.into_iter().collect();
            let jobs = self.inner.store.get_jobs(&ids).await?;
            for job in jobs.values().filter(|job| job.abort_handler) {
                let context = match self.inner.store.get_context(job.id).await {
                    Ok(context) => context,
                    Err(_) => TreeContext::new(),
                };
                match self
                    .inner
                    .registry
                    .instantiate(&job.work_type, job.id, &job.parameters)
                {
                    Ok(plugin) => {
                        info!(job_id = %job.id, work_type = %job.work_type, "Running abort-handler cleanup");
                        tokio::spawn(async move { plugin.cleanup(context).await });
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Cannot instantiate abort-handler plugin");
                    }
                }
            }
        }
        Ok(())
    }

    /// Requests cancellation of `id` and, through it, of its whole tree.
    ///
    /// This only broadcasts an `ABORTED` status; the real cancellation work
    /// happens in each receiving node's failure handling (the local node's
    /// runs synchronously here).
    pub async fn abort(&self, id: JobId) -> Result<(), SchedulerError> {
        let job = match self.inner.store.get_job(id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        info!(job_id = %id, tree = %job.root_id, "Abort requested");
        let message = StatusMessage {
            job_id: id,
            parent_id: job.parent_id,
            state: JobState::Aborted,
            source_node: self.inner.node_id.clone(),
            summary: Some("Abort requested".to_string()),
        };
        if let Err(e) = self.inner.bus.publish(message.clone()).await {
            warn!(job_id = %id, error = %e, "Failed to publish abort");
        }
        self.handle_failure(&message).await
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "plugin panicked".to_string()
    }
}

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

//! End-to-end scheduler scenarios: tree execution order, failure and abort
//! propagation, cross-node cooperation, and completion idempotence.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trellis::{
    BroadcastBus, CompletionHandle, Job, JobId, JobState, JobStore, JobTreeBuilder, JobUpdate,
    MemoryJobStore, NewJob, PluginError, PluginRegistry, Scheduler, SchedulerConfig,
    SchedulerError, StoreError, TreeContext, WorkPlugin,
};

/// Succeeds immediately, recording the job's `name` parameter so tests can
/// assert execution order.
struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    context: TreeContext,
}

#[async_trait]
impl WorkPlugin for Recorder {
    async fn start(
        &self,
        handle: CompletionHandle,
        _context: TreeContext,
    ) -> Result<(), PluginError> {
        self.log.lock().push(self.name.clone());
        handle.success(self.context.clone(), format!("{} done", self.name));
        Ok(())
    }
}

/// Fails immediately.
struct Failer;

#[async_trait]
impl WorkPlugin for Failer {
    async fn start(
        &self,
        handle: CompletionHandle,
        _context: TreeContext,
    ) -> Result<(), PluginError> {
        handle.failure("boom");
        Ok(())
    }
}

/// Runs until aborted.
struct Hanger;

#[async_trait]
impl WorkPlugin for Hanger {
    async fn start(
        &self,
        _handle: CompletionHandle,
        _context: TreeContext,
    ) -> Result<(), PluginError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Counts cleanup invocations; the ordinary action succeeds instantly.
struct CleanupCounter {
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkPlugin for CleanupCounter {
    async fn start(
        &self,
        handle: CompletionHandle,
        _context: TreeContext,
    ) -> Result<(), PluginError> {
        handle.success(TreeContext::new(), "ok");
        Ok(())
    }

    async fn cleanup(&self, _context: TreeContext) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Succeeds after capturing the context it was started with.
struct ContextProbe {
    seen: Arc<Mutex<Option<TreeContext>>>,
}

#[async_trait]
impl WorkPlugin for ContextProbe {
    async fn start(
        &self,
        handle: CompletionHandle,
        context: TreeContext,
    ) -> Result<(), PluginError> {
        *self.seen.lock() = Some(context);
        handle.success(TreeContext::new(), "probed");
        Ok(())
    }
}

/// Delegates to an in-memory store while injecting a configurable number of
/// failures on selected operations.
struct FlakyStore {
    inner: MemoryJobStore,
    transition_failures: AtomicUsize,
    context_read_failures: AtomicUsize,
}

impl FlakyStore {
    fn new(transition_failures: usize, context_read_failures: usize) -> Self {
        FlakyStore {
            inner: MemoryJobStore::new(),
            transition_failures: AtomicUsize::new(transition_failures),
            context_read_failures: AtomicUsize::new(context_read_failures),
        }
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        self.inner.create_job(new_job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.inner.get_job(id).await
    }

    async fn get_jobs(&self, ids: &[JobId]) -> Result<HashMap<JobId, Job>, StoreError> {
        self.inner.get_jobs(ids).await
    }

    async fn get_children(
        &self,
        id: JobId,
        states: Option<&[JobState]>,
    ) -> Result<HashSet<JobId>, StoreError> {
        self.inner.get_children(id, states).await
    }

    async fn get_tree(
        &self,
        id: JobId,
        states: Option<&[JobState]>,
        node: Option<&str>,
    ) -> Result<HashSet<JobId>, StoreError> {
        self.inner.get_tree(id, states, node).await
    }

    async fn set_attributes(&self, id: JobId, update: JobUpdate) -> Result<Job, StoreError> {
        if Self::take(&self.transition_failures) {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        self.inner.set_attributes(id, update).await
    }

    async fn get_ready_to_run(
        &self,
        node: &str,
        waiting_state: JobState,
        success_state: JobState,
    ) -> Result<HashSet<JobId>, StoreError> {
        self.inner
            .get_ready_to_run(node, waiting_state, success_state)
            .await
    }

    async fn set_state_for_tree(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        node: Option<&str>,
    ) -> Result<HashSet<JobId>, StoreError> {
        self.inner.set_state_for_tree(id, from, to, node).await
    }

    async fn store_context(&self, id: JobId, entries: TreeContext) -> Result<(), StoreError> {
        self.inner.store_context(id, entries).await
    }

    async fn get_context(&self, id: JobId) -> Result<TreeContext, StoreError> {
        if Self::take(&self.context_read_failures) {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        self.inner.get_context(id).await
    }

    async fn tag_job(&self, id: JobId, tags: &[String]) -> Result<(), StoreError> {
        self.inner.tag_job(id, tags).await
    }

    async fn find_by_tag(
        &self,
        tag: &str,
        limit: Option<usize>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.inner.find_by_tag(tag, limit).await
    }

    async fn find_roots_older_than(
        &self,
        age: chrono::Duration,
        limit: Option<usize>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.inner.find_roots_older_than(age, limit).await
    }

    async fn delete_tree(&self, id: JobId, keep_indexes: bool) -> Result<(), StoreError> {
        self.inner.delete_tree(id, keep_indexes).await
    }

    async fn archive_tree(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.archive_tree(id).await
    }
}

struct Harness {
    store: Arc<MemoryJobStore>,
    bus: Arc<BroadcastBus>,
    registry: Arc<PluginRegistry>,
    log: Arc<Mutex<Vec<String>>>,
}

fn base_registry(log: &Arc<Mutex<Vec<String>>>) -> Arc<PluginRegistry> {
    let registry = Arc::new(PluginRegistry::new());
    let recorder_log = log.clone();
    registry.register("record", move |_, parameters| {
        let name = parameters["name"].as_str().unwrap_or("?").to_string();
        let context = parameters["context"]
            .as_object()
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default();
        Arc::new(Recorder {
            name,
            log: recorder_log.clone(),
            context,
        })
    });
    registry.register("fail", |_, _| Arc::new(Failer));
    registry.register("hang", |_, _| Arc::new(Hanger));
    registry
}

impl Harness {
    fn new() -> Self {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let registry = base_registry(&log);
        Harness {
            store: Arc::new(MemoryJobStore::new()),
            bus: Arc::new(BroadcastBus::new()),
            registry,
            log,
        }
    }

    fn scheduler(&self, node: &str) -> Scheduler {
        let scheduler = Scheduler::new(
            node,
            self.store.clone(),
            self.registry.clone(),
            self.bus.clone(),
        );
        scheduler.start();
        scheduler
    }
}

fn record(name: &str) -> JobTreeBuilder {
    JobTreeBuilder::new(
        "record",
        serde_json::json!({"name": name}),
        format!("record {}", name),
    )
}

async fn wait_for_state<S: JobStore + ?Sized>(store: &S, id: JobId, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = store.get_job(id).await.unwrap();
        if job.state == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {:?} on {} (currently {:?})",
            state,
            id,
            job.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn linear_chain_runs_leaves_first() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree =
        record("root").add_child(record("mid").add_child(record("leaf")));
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();

    wait_for_state(harness.store.as_ref(), root,JobState::Success).await;
    assert_eq!(*harness.log.lock(), vec!["leaf", "mid", "root"]);
    scheduler.shutdown();
}

#[tokio::test]
async fn jobs_do_not_run_before_execution_is_allowed() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree = record("solo");
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.store.get_job(root).await.unwrap().state,
        JobState::New
    );
    assert!(harness.log.lock().is_empty());

    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Success).await;
    scheduler.shutdown();
}

#[tokio::test]
async fn failing_child_aborts_the_tree() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree = record("root")
        .add_child(record("fine"))
        .add_child(JobTreeBuilder::new(
            "fail",
            serde_json::json!({}),
            "doomed",
        ));
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    let fine = tree.children()[0].assigned_id().unwrap();
    let doomed = tree.children()[1].assigned_id().unwrap();

    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Aborted).await;

    let failed = harness.store.get_job(doomed).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.summary.as_deref(), Some("boom"));

    // The sibling either finished before the failure landed or was aborted
    // while waiting; it must not be left live.
    let sibling = harness.store.get_job(fine).await.unwrap();
    assert!(sibling.state.is_terminal());
    scheduler.shutdown();
}

#[tokio::test]
async fn abort_cancels_a_running_job() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree = JobTreeBuilder::new("hang", serde_json::json!({}), "long haul");
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Running).await;

    scheduler.abort(root).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Aborted).await;

    let job = harness.store.get_job(root).await.unwrap();
    assert_eq!(job.summary.as_deref(), Some("Abort requested"));
    scheduler.shutdown();
}

#[tokio::test]
async fn plugin_errors_become_failures() {
    struct Thrower;

    #[async_trait]
    impl WorkPlugin for Thrower {
        async fn start(
            &self,
            _handle: CompletionHandle,
            _context: TreeContext,
        ) -> Result<(), PluginError> {
            Err(PluginError::from("image registry unreachable"))
        }
    }

    let harness = Harness::new();
    harness.registry.register("throw", |_, _| Arc::new(Thrower));
    let scheduler = harness.scheduler("here");

    let mut tree = JobTreeBuilder::new("throw", serde_json::json!({}), "throws");
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();

    wait_for_state(harness.store.as_ref(), root,JobState::Failed).await;
    let job = harness.store.get_job(root).await.unwrap();
    assert_eq!(
        job.summary.as_deref(),
        Some("Exception thrown: image registry unreachable")
    );
    scheduler.shutdown();
}

#[tokio::test]
async fn panicking_plugin_becomes_a_failure() {
    struct Panicker;

    #[async_trait]
    impl WorkPlugin for Panicker {
        async fn start(
            &self,
            _handle: CompletionHandle,
            _context: TreeContext,
        ) -> Result<(), PluginError> {
            panic!("wires crossed");
        }
    }

    let harness = Harness::new();
    harness.registry.register("panic", |_, _| Arc::new(Panicker));
    let scheduler = harness.scheduler("here");

    let mut tree = JobTreeBuilder::new("panic", serde_json::json!({}), "panics");
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();

    wait_for_state(harness.store.as_ref(), root,JobState::Failed).await;
    let job = harness.store.get_job(root).await.unwrap();
    assert_eq!(job.summary.as_deref(), Some("Exception thrown: wires crossed"));
    scheduler.shutdown();
}

#[tokio::test]
async fn unknown_work_type_is_rejected_at_commit() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree = JobTreeBuilder::new("no_such_type", serde_json::json!({}), "nope");
    let err = scheduler.add_tree(&mut tree, None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::PluginNotFound(t) if t == "no_such_type"));
    scheduler.shutdown();
}

#[tokio::test]
async fn context_written_by_child_is_visible_to_parent() {
    let harness = Harness::new();
    let seen: Arc<Mutex<Option<TreeContext>>> = Arc::new(Mutex::new(None));
    let probe_seen = seen.clone();
    harness.registry.register("probe", move |_, _| {
        Arc::new(ContextProbe {
            seen: probe_seen.clone(),
        })
    });
    let scheduler = harness.scheduler("here");

    // The leaf publishes an artifact reference; the root reads it.
    let mut tree = JobTreeBuilder::new("probe", serde_json::json!({}), "consumer").add_child(
        JobTreeBuilder::new(
            "record",
            serde_json::json!({"name": "producer", "context": {"artifact": "api:v42"}}),
            "producer",
        ),
    );
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Success).await;

    let context = seen.lock().clone().unwrap();
    assert_eq!(context["artifact"], serde_json::json!("api:v42"));
    scheduler.shutdown();
}

#[tokio::test]
async fn abort_handler_cleanup_runs_once_on_failure() {
    let harness = Harness::new();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let counter = cleanups.clone();
    harness.registry.register("undo", move |_, _| {
        Arc::new(CleanupCounter {
            cleanups: counter.clone(),
        })
    });
    let scheduler = harness.scheduler("here");

    let mut tree = record("root")
        .add_child(
            JobTreeBuilder::new("undo", serde_json::json!({}), "release lease").abort_handler(),
        )
        .add_child(JobTreeBuilder::new("fail", serde_json::json!({}), "doomed"));
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Aborted).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}

#[tokio::test]
async fn two_nodes_cooperate_over_the_bus() {
    let harness = Harness::new();
    let alpha = harness.scheduler("alpha");
    let beta = harness.scheduler("beta");

    let mut tree = record("root").add_child(record("remote").on_node("beta"));
    let root = alpha.add_tree(&mut tree, None).await.unwrap();
    let remote = tree.children()[0].assigned_id().unwrap();

    alpha.allow_execution(root, true).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Success).await;

    assert_eq!(
        harness.store.get_job(remote).await.unwrap().node_id,
        "beta"
    );
    assert_eq!(*harness.log.lock(), vec!["remote", "root"]);
    alpha.shutdown();
    beta.shutdown();
}

#[tokio::test]
async fn failure_on_one_node_aborts_waiting_jobs_on_another() {
    let harness = Harness::new();
    let alpha = harness.scheduler("alpha");
    let beta = harness.scheduler("beta");

    let mut tree = record("root")
        .on_node("beta")
        .add_child(JobTreeBuilder::new("fail", serde_json::json!({}), "doomed"));
    let root = alpha.add_tree(&mut tree, None).await.unwrap();

    alpha.allow_execution(root, true).await.unwrap();

    // The failure happens on alpha; beta owns the waiting root and must
    // abort it when the FAILED status arrives.
    wait_for_state(harness.store.as_ref(), root,JobState::Aborted).await;
    alpha.shutdown();
    beta.shutdown();
}

#[tokio::test]
async fn duplicate_completion_does_not_reopen_a_finished_job() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree = record("solo");
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Success).await;

    scheduler
        .completed(root, JobState::Failed, None, Some("late duplicate".to_string()))
        .await
        .unwrap();
    let job = harness.store.get_job(root).await.unwrap();
    assert_eq!(job.state, JobState::Success);
    scheduler.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_start_triggers_run_the_plugin_once() {
    struct CountingHanger {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkPlugin for CountingHanger {
        async fn start(
            &self,
            _handle: CompletionHandle,
            _context: TreeContext,
        ) -> Result<(), PluginError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    let harness = Harness::new();
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = starts.clone();
    harness.registry.register("count_hang", move |_, _| {
        Arc::new(CountingHanger {
            starts: counter.clone(),
        })
    });
    let scheduler = harness.scheduler("here");

    // Created directly in WAITING so the explicit start calls below are the
    // only triggers.
    let id = JobId::new();
    harness
        .store
        .create_job(NewJob {
            id,
            parent_id: None,
            node_id: "here".to_string(),
            work_type: "count_hang".to_string(),
            parameters: serde_json::json!({}),
            title: "guarded".to_string(),
            tags: BTreeSet::new(),
            state: JobState::Waiting,
            abort_handler: false,
        })
        .await
        .unwrap();

    let mut triggers = Vec::new();
    for _ in 0..8 {
        let scheduler = scheduler.clone();
        triggers.push(tokio::spawn(async move {
            scheduler.start_job(id).await.unwrap()
        }));
    }
    for trigger in triggers {
        trigger.await.unwrap();
    }

    wait_for_state(harness.store.as_ref(), id, JobState::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}

#[tokio::test]
async fn aborting_a_running_child_stops_the_rest_of_the_tree() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree = record("root")
        .add_child(record("quick"))
        .add_child(JobTreeBuilder::new("hang", serde_json::json!({}), "slow"));
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    let quick = tree.children()[0].assigned_id().unwrap();
    let slow = tree.children()[1].assigned_id().unwrap();

    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), quick, JobState::Success).await;
    wait_for_state(harness.store.as_ref(), slow, JobState::Running).await;

    scheduler.abort(slow).await.unwrap();
    wait_for_state(harness.store.as_ref(), slow, JobState::Aborted).await;
    wait_for_state(harness.store.as_ref(), root, JobState::Aborted).await;

    // Finished work keeps its outcome; the root never started.
    assert_eq!(
        harness.store.get_job(quick).await.unwrap().state,
        JobState::Success
    );
    assert_eq!(*harness.log.lock(), vec!["quick"]);
    scheduler.shutdown();
}

#[tokio::test]
async fn store_outage_during_a_transition_is_retried() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = base_registry(&log);
    let store = Arc::new(FlakyStore::new(2, 0));
    let bus = Arc::new(BroadcastBus::new());
    let scheduler = Scheduler::with_config(
        "here",
        store.clone(),
        registry,
        bus,
        SchedulerConfig {
            store_retry_interval: Duration::from_millis(10),
        },
    );
    scheduler.start();

    let mut tree = record("survivor");
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();

    wait_for_state(store.as_ref(), root, JobState::Success).await;
    assert_eq!(*log.lock(), vec!["survivor"]);
    scheduler.shutdown();
}

#[tokio::test]
async fn one_unstartable_job_does_not_block_its_siblings() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = base_registry(&log);
    // The first context read fails outright; whichever leaf hits it is
    // retried on the next evaluation.
    let store = Arc::new(FlakyStore::new(0, 1));
    let bus = Arc::new(BroadcastBus::new());
    let scheduler = Scheduler::new("here", store.clone(), registry, bus);
    scheduler.start();

    let mut tree = record("root")
        .add_child(record("left"))
        .add_child(record("right"));
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();
    scheduler.allow_execution(root, false).await.unwrap();

    wait_for_state(store.as_ref(), root, JobState::Success).await;
    assert_eq!(log.lock().last(), Some(&"root".to_string()));
    scheduler.shutdown();
}

#[tokio::test]
async fn grafting_under_an_existing_parent() {
    let harness = Harness::new();
    let scheduler = harness.scheduler("here");

    let mut tree = record("root");
    let root = scheduler.add_tree(&mut tree, None).await.unwrap();

    let mut graft = record("extra");
    let extra = scheduler.add_tree(&mut graft, Some(root)).await.unwrap();
    assert_eq!(
        harness.store.get_job(extra).await.unwrap().root_id,
        root
    );

    scheduler.allow_execution(root, false).await.unwrap();
    wait_for_state(harness.store.as_ref(), root,JobState::Success).await;
    assert_eq!(*harness.log.lock(), vec!["extra", "root"]);
    scheduler.shutdown();
}

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    dispatcher::{DispatcherContext, is_unexpected},
    pool::{PoolEvent, WorkerPool},
};
use crate::{
    config::{Config, PreserveOutput, Project},
    context::instance_output_dir,
    errors::{RunnerBuildError, WorkerError, serialize_error},
    list::{BuildListError, TestInstance, TestList},
    protocol::{ConfigSlice, ControllerMessage, WorkerMessage},
    reporter::events::{CancelReason, RunStats, TestEvent, TestResult, TestStatus},
    session::Session,
    signal::{SignalEvent, SignalHandlerKind},
    time::pending_or_sleep,
};
use quire_metadata::ReportError;
use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{runtime::Runtime, sync::mpsc};
use tracing::{debug, warn};

/// An error that prevented the run from starting.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Building the test list failed (config or fixture-graph error).
    #[error(transparent)]
    List(#[from] BuildListError),

    /// The runner itself could not be built.
    #[error(transparent)]
    Build(#[from] RunnerBuildError),
}

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    signal_handler: Option<SignalHandlerKind>,
}

impl TestRunnerBuilder {
    /// Creates a builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides signal handling (tests and embedding use
    /// [`SignalHandlerKind::Noop`]).
    pub fn set_signal_handler(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler = Some(kind);
        self
    }

    /// Creates a test runner for a resolved session and config.
    pub fn build(
        self,
        session: Arc<Session>,
        config: Config,
    ) -> Result<TestRunner, RunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("quire-runner-worker")
            .build()
            .map_err(RunnerBuildError::TokioRuntimeCreate)?;
        let exe = std::env::current_exe().map_err(RunnerBuildError::CurrentExe)?;
        Ok(TestRunner {
            session,
            config: Arc::new(config),
            runtime,
            signal_handler: self.signal_handler.unwrap_or(SignalHandlerKind::Standard),
            exe,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
pub struct TestRunner {
    session: Arc<Session>,
    config: Arc<Config>,
    runtime: Runtime,
    signal_handler: SignalHandlerKind,
    exe: PathBuf,
}

impl TestRunner {
    /// The resolved configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Builds the test list, schedules every instance across workers, and
    /// feeds lifecycle events to `callback`. Returns the final statistics.
    pub fn execute<F>(self, callback: F) -> Result<RunStats, RunError>
    where
        F: FnMut(TestEvent),
    {
        let list = Arc::new(TestList::build(&self.session, &self.config)?);
        let config = self.config.clone();
        let exe = self.exe.clone();
        let signal_kind = self.signal_handler;

        let stats = self.runtime.block_on(run_inner(
            config,
            list,
            exe,
            signal_kind,
            callback,
        ));

        // Stray worker processes keep the runtime alive; shut it down
        // aggressively.
        self.runtime.shutdown_background();
        Ok(stats)
    }
}

async fn run_inner<F>(
    config: Arc<Config>,
    list: Arc<TestList>,
    exe: PathBuf,
    signal_kind: SignalHandlerKind,
    callback: F,
) -> RunStats
where
    F: FnMut(TestEvent),
{
    let mut ctx = DispatcherContext::new(
        callback,
        list.run_count(),
        config.max_failures,
        config.global_timeout,
    );
    ctx.run_started(config.clone(), list.clone());

    // File-level load errors are surfaced up front and fail the run, but
    // other files' tests still execute.
    for error in list.load_errors() {
        ctx.worker_error(serialize_error(error));
    }

    if config.list_only {
        return ctx.run_finished();
    }

    // Global setup runs before any worker spawns; its result rides the
    // config slice into every worker.
    let mut global_setup_result = None;
    let mut setup_completed = true;
    if let Some(setup) = &config.global_setup {
        match setup(&config).await {
            Ok(value) => global_setup_result = Some(value),
            Err(error) => {
                ctx.worker_error(ReportError {
                    message: format!("global setup failed: {error}"),
                    ..ReportError::default()
                });
                setup_completed = false;
            }
        }
    }

    let leftovers: Vec<Entry> = if setup_completed {
        let mut scheduler = Scheduler::new(&config, &list, exe, global_setup_result);
        scheduler.run(&mut ctx, signal_kind).await;
        scheduler.leftovers()
    } else {
        // Nothing ran; every instance is skipped.
        (0..list.instances.len())
            .map(|instance_index| Entry {
                instance_index,
                retry: 0,
            })
            .collect()
    };

    // Remaining instances get synthetic begin/end pairs so every instance
    // appears exactly once in the stream.
    if !leftovers.is_empty() {
        let reason = if setup_completed {
            ctx.skip_reason()
        } else {
            "Global setup failed".to_owned()
        };
        for entry in leftovers {
            let instance = &list.instances[entry.instance_index];
            ctx.test_started(instance.id.clone(), entry.retry, 0);
            let mut result = TestResult::synthetic_skip(entry.retry, reason.clone());
            result.expected_status = instance.expected_status;
            ctx.test_finished(instance, result, false);
        }
    }

    // Global teardown runs iff setup completed.
    if setup_completed {
        if let Some(teardown) = &config.global_teardown {
            if let Err(error) = teardown(&config).await {
                ctx.worker_error(ReportError {
                    message: format!("global teardown failed: {error}"),
                    ..ReportError::default()
                });
            }
        }
    }

    ctx.run_finished()
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    instance_index: usize,
    retry: usize,
}

#[derive(Debug)]
struct Group {
    hash: u64,
    entries: VecDeque<Entry>,
    /// Retries must land on a newly-spawned worker, never a reused one.
    fresh_only: bool,
}

#[derive(Debug)]
struct Current {
    entry: Entry,
    begun: bool,
}

#[derive(Debug)]
struct Assignment {
    group: Group,
    current: Option<Current>,
    /// Set when the last test failed unexpectedly: the worker is retired
    /// after its `Done` so corrupted fixture state cannot leak.
    retire_after_done: bool,
    slice: ConfigSlice,
}

struct Scheduler<'a> {
    config: &'a Arc<Config>,
    list: &'a Arc<TestList>,
    global_setup_result: Option<serde_json::Value>,
    pool: WorkerPool,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    groups: VecDeque<Group>,
    assignments: HashMap<usize, Assignment>,
    cancelled: bool,
    leftover_entries: Vec<Entry>,
}

impl<'a> Scheduler<'a> {
    fn new(
        config: &'a Arc<Config>,
        list: &'a Arc<TestList>,
        exe: PathBuf,
        global_setup_result: Option<serde_json::Value>,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let groups = list
            .worker_groups()
            .into_iter()
            .map(|(hash, indices)| Group {
                hash,
                entries: indices
                    .into_iter()
                    .map(|instance_index| Entry {
                        instance_index,
                        retry: 0,
                    })
                    .collect(),
                fresh_only: false,
            })
            .collect();
        Self {
            config,
            list,
            global_setup_result,
            pool: WorkerPool::new(exe, event_tx),
            events,
            groups,
            assignments: HashMap::new(),
            cancelled: false,
            leftover_entries: Vec::new(),
        }
    }

    fn leftovers(mut self) -> Vec<Entry> {
        for group in std::mem::take(&mut self.groups) {
            self.leftover_entries.extend(group.entries);
        }
        for (_, assignment) in self.assignments.drain() {
            if let Some(current) = assignment.current {
                self.leftover_entries.push(current.entry);
            }
            self.leftover_entries.extend(assignment.group.entries);
        }
        self.leftover_entries
            .sort_by_key(|entry| entry.instance_index);
        self.leftover_entries
    }

    async fn run<F>(&mut self, ctx: &mut DispatcherContext<F>, signal_kind: SignalHandlerKind)
    where
        F: FnMut(TestEvent),
    {
        let mut signal_handler = signal_kind.build();
        let mut global_timeout = std::pin::pin!(pending_or_sleep(self.config.global_timeout));

        loop {
            self.dispatch(ctx).await;
            if self.assignments.is_empty() && (self.cancelled || self.groups.is_empty()) {
                break;
            }

            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_pool_event(ctx, event).await;
                }
                signal = signal_handler.recv() => {
                    match signal {
                        Some(SignalEvent::Shutdown) => {
                            self.begin_cancel(ctx, CancelReason::Signal).await;
                        }
                        Some(SignalEvent::Kill) | None => {
                            self.abort_in_flight(ctx, CancelReason::Signal).await;
                            break;
                        }
                    }
                }
                _ = &mut global_timeout => {
                    self.abort_in_flight(ctx, CancelReason::GlobalTimeout).await;
                    break;
                }
            }
        }

        self.drain(ctx).await;
    }

    /// Hands pending groups to workers while capacity allows.
    async fn dispatch<F>(&mut self, ctx: &mut DispatcherContext<F>)
    where
        F: FnMut(TestEvent),
    {
        while !self.cancelled {
            // Fail discovery-error instances without dispatching them.
            while let Some(group) = self.groups.front_mut() {
                let Some(entry) = group.entries.front().copied() else {
                    self.groups.pop_front();
                    continue;
                };
                let instance = &self.list.instances[entry.instance_index];
                let Some(message) = instance.discovery_error.clone() else {
                    break;
                };
                group.entries.pop_front();
                ctx.test_started(instance.id.clone(), entry.retry, 0);
                let result = TestResult {
                    status: TestStatus::Failed,
                    expected_status: instance.expected_status,
                    duration: Duration::ZERO,
                    retry: entry.retry,
                    worker_index: 0,
                    error: Some(ReportError {
                        message,
                        ..ReportError::default()
                    }),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    attachments: Vec::new(),
                    data: Default::default(),
                    annotations: Vec::new(),
                    slow: false,
                };
                if ctx.test_finished(instance, result, false) {
                    self.begin_cancel(ctx, CancelReason::MaxFailures).await;
                    return;
                }
            }

            let Some(group) = self.groups.front() else { break };
            let hash = group.hash;
            let fresh_only = group.fresh_only;

            let reusable = if fresh_only {
                None
            } else {
                self.pool.idle_with_hash(hash)
            };
            let worker_index = match reusable {
                Some(index) => index,
                None if self.pool.live_count() < self.config.workers => {
                    match self.pool.spawn_worker(hash) {
                        Ok(index) => index,
                        Err(error) => {
                            self.fail_group(ctx, error).await;
                            continue;
                        }
                    }
                }
                None => {
                    // Full. Retire the least-recently-used idle worker and
                    // wait for its slot to open.
                    if let Some(lru) = self.pool.lru_idle() {
                        self.pool.retire(lru).await;
                    }
                    break;
                }
            };

            let group = self.groups.pop_front().expect("checked non-empty above");
            let first = group
                .entries
                .front()
                .expect("groups are drained of empty fronts above");
            let instance = &self.list.instances[first.instance_index];
            let slice = self.build_slice(instance, worker_index, hash);
            let mut assignment = Assignment {
                group,
                current: None,
                retire_after_done: false,
                slice,
            };
            if let Err(error) = self.send_next(worker_index, &mut assignment).await {
                warn!("failed to send work to worker {worker_index}: {error}");
                // The reader task will report the exit; requeue the batch.
                if let Some(current) = assignment.current.take() {
                    assignment.group.entries.push_front(current.entry);
                }
                self.groups.push_front(assignment.group);
                continue;
            }
            self.assignments.insert(worker_index, assignment);
        }
    }

    /// Fails every entry of the front group (used when a worker cannot even
    /// be spawned).
    async fn fail_group<F>(&mut self, ctx: &mut DispatcherContext<F>, error: WorkerError)
    where
        F: FnMut(TestEvent),
    {
        let Some(group) = self.groups.pop_front() else {
            return;
        };
        let message = error.to_string();
        for entry in group.entries {
            let instance = &self.list.instances[entry.instance_index];
            ctx.test_started(instance.id.clone(), entry.retry, 0);
            let result = TestResult {
                status: TestStatus::Failed,
                expected_status: instance.expected_status,
                duration: Duration::ZERO,
                retry: entry.retry,
                worker_index: 0,
                error: Some(ReportError {
                    message: message.clone(),
                    ..ReportError::default()
                }),
                stdout: Vec::new(),
                stderr: Vec::new(),
                attachments: Vec::new(),
                data: Default::default(),
                annotations: Vec::new(),
                slow: false,
            };
            if ctx.test_finished(instance, result, false) {
                self.begin_cancel(ctx, CancelReason::MaxFailures).await;
                return;
            }
        }
    }

    async fn send_next(
        &mut self,
        worker_index: usize,
        assignment: &mut Assignment,
    ) -> Result<(), WorkerError> {
        let entry = assignment
            .group
            .entries
            .pop_front()
            .expect("send_next requires a non-empty group");
        let spec = self.list.instances[entry.instance_index].to_run_spec(entry.retry);
        assignment.current = Some(Current {
            entry,
            begun: false,
        });
        self.pool
            .send(
                worker_index,
                &ControllerMessage::Run {
                    config: Box::new(assignment.slice.clone()),
                    tests: vec![spec],
                },
            )
            .await
    }

    async fn handle_pool_event<F>(&mut self, ctx: &mut DispatcherContext<F>, event: PoolEvent)
    where
        F: FnMut(TestEvent),
    {
        match event {
            PoolEvent::Message {
                worker_index,
                message,
            } => self.handle_message(ctx, worker_index, message).await,
            PoolEvent::ProtocolError {
                worker_index,
                error,
            } => {
                ctx.worker_error(serialize_error(&WorkerError::Protocol {
                    worker_index,
                    source: error,
                }));
                self.pool.kill(worker_index).await;
                self.handle_worker_gone(ctx, worker_index, None).await;
            }
            PoolEvent::Exited {
                worker_index,
                exit_code,
            } => {
                let exit_code = self.pool.reap(worker_index).await.or(exit_code);
                self.handle_worker_gone(ctx, worker_index, exit_code).await;
            }
        }
    }

    async fn handle_message<F>(
        &mut self,
        ctx: &mut DispatcherContext<F>,
        worker_index: usize,
        message: WorkerMessage,
    ) where
        F: FnMut(TestEvent),
    {
        match message {
            WorkerMessage::TestBegin { id } => {
                let retry = self
                    .assignments
                    .get_mut(&worker_index)
                    .and_then(|assignment| assignment.current.as_mut())
                    .map(|current| {
                        current.begun = true;
                        current.entry.retry
                    })
                    .unwrap_or(0);
                ctx.test_started(id, retry, worker_index);
            }
            WorkerMessage::TestEnd { id, result } => {
                self.handle_test_end(ctx, worker_index, &id, result).await;
            }
            WorkerMessage::Stdio {
                stream,
                test,
                chunk,
            } => {
                ctx.stdio(stream, test, chunk);
            }
            WorkerMessage::WorkerError { error } => {
                ctx.worker_error(error);
            }
            WorkerMessage::Done => {
                self.handle_done(ctx, worker_index).await;
            }
        }
    }

    async fn handle_test_end<F>(
        &mut self,
        ctx: &mut DispatcherContext<F>,
        worker_index: usize,
        id: &str,
        result: TestResult,
    ) where
        F: FnMut(TestEvent),
    {
        let Some(assignment) = self.assignments.get_mut(&worker_index) else {
            warn!(worker_index, "result from a worker with no assignment");
            return;
        };
        let Some(current) = assignment.current.take() else {
            warn!(worker_index, "result without a test in flight");
            return;
        };
        let Some(instance) = self.list.instance(id) else {
            warn!(worker_index, id, "result for an unknown instance");
            return;
        };

        let unexpected = is_unexpected(&result);
        let failing = matches!(result.status, TestStatus::Failed | TestStatus::TimedOut)
            && unexpected;
        let will_retry =
            unexpected && !self.cancelled && current.entry.retry < instance.retries;

        if failing {
            // Don't reuse this worker: fixture state may be corrupted.
            assignment.retire_after_done = true;
        }
        if will_retry {
            self.groups.push_back(Group {
                hash: instance.worker_hash,
                entries: VecDeque::from([Entry {
                    instance_index: current.entry.instance_index,
                    retry: current.entry.retry + 1,
                }]),
                fresh_only: true,
            });
        } else {
            self.clean_output_dir(instance, &result);
        }

        if ctx.test_finished(instance, result, will_retry) {
            self.begin_cancel(ctx, CancelReason::MaxFailures).await;
        }
    }

    async fn handle_done<F>(&mut self, ctx: &mut DispatcherContext<F>, worker_index: usize)
    where
        F: FnMut(TestEvent),
    {
        let Some(assignment) = self.assignments.get_mut(&worker_index) else {
            return;
        };
        if let Some(current) = assignment.current.take() {
            // A `Done` without a preceding `TestEnd` means the worker bailed
            // out of the batch (e.g. it could not initialize).
            let instance = &self.list.instances[current.entry.instance_index];
            if !current.begun {
                ctx.test_started(instance.id.clone(), current.entry.retry, worker_index);
            }
            let result = TestResult {
                status: TestStatus::Failed,
                expected_status: instance.expected_status,
                duration: Duration::ZERO,
                retry: current.entry.retry,
                worker_index,
                error: Some(ReportError {
                    message: "worker abandoned the test without reporting a result".to_owned(),
                    ..ReportError::default()
                }),
                stdout: Vec::new(),
                stderr: Vec::new(),
                attachments: Vec::new(),
                data: Default::default(),
                annotations: Vec::new(),
                slow: false,
            };
            assignment.retire_after_done = true;
            if ctx.test_finished(instance, result, false) {
                self.begin_cancel(ctx, CancelReason::MaxFailures).await;
            }
        }

        let (retire, has_more) = {
            let assignment = self
                .assignments
                .get(&worker_index)
                .expect("still assigned");
            (
                assignment.retire_after_done,
                !assignment.group.entries.is_empty(),
            )
        };
        if self.cancelled {
            let assignment = self.assignments.remove(&worker_index).expect("checked");
            self.leftover_entries.extend(assignment.group.entries);
            self.pool.retire(worker_index).await;
        } else if retire {
            let assignment = self.assignments.remove(&worker_index).expect("checked");
            if !assignment.group.entries.is_empty() {
                self.groups.push_front(Group {
                    hash: assignment.group.hash,
                    entries: assignment.group.entries,
                    fresh_only: false,
                });
            }
            self.pool.retire(worker_index).await;
        } else if has_more {
            let mut assignment = self.assignments.remove(&worker_index).expect("checked");
            if let Err(error) = self.send_next(worker_index, &mut assignment).await {
                warn!("failed to continue batch on worker {worker_index}: {error}");
                if let Some(current) = assignment.current.take() {
                    assignment.group.entries.push_front(current.entry);
                }
                self.groups.push_front(assignment.group);
            } else {
                self.assignments.insert(worker_index, assignment);
            }
        } else {
            self.assignments.remove(&worker_index);
            self.pool.mark_idle(worker_index);
        }
    }

    /// A worker went away. If it held an assignment this is a crash: the
    /// in-flight test is failed (with retry policy applied) and the rest of
    /// its batch is requeued.
    async fn handle_worker_gone<F>(
        &mut self,
        ctx: &mut DispatcherContext<F>,
        worker_index: usize,
        exit_code: Option<i32>,
    ) where
        F: FnMut(TestEvent),
    {
        let Some(mut assignment) = self.assignments.remove(&worker_index) else {
            // Normal retirement.
            return;
        };
        ctx.worker_error(serialize_error(&WorkerError::Crashed {
            worker_index,
            exit_code,
        }));

        if let Some(current) = assignment.current.take() {
            let instance = &self.list.instances[current.entry.instance_index];
            if !current.begun {
                ctx.test_started(instance.id.clone(), current.entry.retry, worker_index);
            }
            let result = TestResult {
                status: TestStatus::Failed,
                expected_status: instance.expected_status,
                duration: Duration::ZERO,
                retry: current.entry.retry,
                worker_index,
                error: Some(ReportError {
                    message: "worker crashed while running this test".to_owned(),
                    ..ReportError::default()
                }),
                stdout: Vec::new(),
                stderr: Vec::new(),
                attachments: Vec::new(),
                data: Default::default(),
                annotations: Vec::new(),
                slow: false,
            };
            let will_retry =
                !self.cancelled && current.entry.retry < instance.retries;
            if will_retry {
                self.groups.push_back(Group {
                    hash: instance.worker_hash,
                    entries: VecDeque::from([Entry {
                        instance_index: current.entry.instance_index,
                        retry: current.entry.retry + 1,
                    }]),
                    fresh_only: true,
                });
            }
            if ctx.test_finished(instance, result, will_retry) {
                self.begin_cancel(ctx, CancelReason::MaxFailures).await;
            }
        }

        if self.cancelled {
            self.leftover_entries.extend(assignment.group.entries);
        } else if !assignment.group.entries.is_empty() {
            self.groups.push_front(Group {
                hash: assignment.group.hash,
                entries: assignment.group.entries,
                fresh_only: false,
            });
        }
    }

    /// Stops dispatching; in-flight tests complete normally.
    async fn begin_cancel<F>(&mut self, ctx: &mut DispatcherContext<F>, reason: CancelReason)
    where
        F: FnMut(TestEvent),
    {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        let running = self
            .assignments
            .values()
            .filter(|a| a.current.is_some())
            .count();
        ctx.cancel(reason, running);
    }

    /// Cancels dispatch *and* in-flight work (global timeout, second
    /// signal). In-flight instances are recorded at the status they
    /// reached, which for an unsealed attempt is a cancellation skip.
    async fn abort_in_flight<F>(&mut self, ctx: &mut DispatcherContext<F>, reason: CancelReason)
    where
        F: FnMut(TestEvent),
    {
        self.begin_cancel(ctx, reason).await;
        self.pool.kill_all().await;
        let assignments: Vec<(usize, Assignment)> = self.assignments.drain().collect();
        let reason_text = ctx.skip_reason();
        for (worker_index, mut assignment) in assignments {
            if let Some(current) = assignment.current.take() {
                let instance = &self.list.instances[current.entry.instance_index];
                if !current.begun {
                    ctx.test_started(instance.id.clone(), current.entry.retry, worker_index);
                }
                let mut result =
                    TestResult::synthetic_skip(current.entry.retry, reason_text.clone());
                result.expected_status = instance.expected_status;
                result.worker_index = worker_index;
                ctx.test_finished(instance, result, false);
            }
            self.leftover_entries.extend(assignment.group.entries);
        }
    }

    /// Retires all workers and waits for their teardown output.
    async fn drain<F>(&mut self, ctx: &mut DispatcherContext<F>)
    where
        F: FnMut(TestEvent),
    {
        self.pool.retire_all().await;
        let drain_fut = async {
            while self.pool.live_count() > 0 {
                let Some(event) = self.events.recv().await else {
                    break;
                };
                match event {
                    PoolEvent::Message {
                        message: WorkerMessage::WorkerError { error },
                        ..
                    } => ctx.worker_error(error),
                    PoolEvent::Exited { worker_index, .. } => {
                        self.pool.reap(worker_index).await;
                        self.assignments.remove(&worker_index);
                    }
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(30), drain_fut)
            .await
            .is_err()
        {
            debug!("workers did not exit in time; killing remaining");
            self.pool.kill_all().await;
        }
    }

    fn project(&self, name: &str) -> Option<&Project> {
        self.config.projects.iter().find(|p| p.name == name)
    }

    fn build_slice(
        &self,
        instance: &TestInstance,
        worker_index: usize,
        worker_hash: u64,
    ) -> ConfigSlice {
        let timeout = self
            .project(&instance.project_name)
            .map(|project| project.timeout)
            .unwrap_or(self.config.timeout);
        ConfigSlice {
            worker_index,
            worker_hash,
            project_name: instance.project_name.clone(),
            project_tag: instance.project_tag.clone(),
            timeout,
            test_dir: self.config.test_dir.clone(),
            output_dir: self.config.output_dir.clone(),
            snapshot_dir: self.config.snapshot_root(),
            update_snapshots: self.config.update_snapshots,
            variation: instance.variation.clone(),
            repeat_index: instance.repeat_index,
            global_setup_result: self.global_setup_result.clone(),
        }
    }

    /// Applies the output-retention policy to a final attempt.
    fn clean_output_dir(&self, instance: &TestInstance, result: &TestResult) {
        let mut policy = self.config.preserve_output;
        if policy == PreserveOutput::Always && std::env::var_os("CI").is_some() {
            policy = PreserveOutput::FailuresOnly;
        }
        let keep = match policy {
            PreserveOutput::Always => true,
            PreserveOutput::Never => false,
            PreserveOutput::FailuresOnly => is_unexpected(result),
        };
        if keep {
            return;
        }
        let dir = instance_output_dir(
            &self.config.output_dir,
            &instance.file,
            &instance.suite_path,
            &instance.title,
            instance.project_tag.as_deref(),
            result.retry,
            instance.repeat_index,
        );
        let _ = std::fs::remove_dir_all(dir);
    }
}

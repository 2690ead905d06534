// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::stdio::{Capture, MessageWriter};
use crate::{
    context::{ModifierSignal, TestContext, TestInfo, WorkerInfo},
    errors::{BodyResult, FixtureError, serialize_error, serialize_error_at},
    fixtures::{AutoFixtures, FixtureArgs, FixtureRegistry, FixtureScope, FixtureStore},
    helpers::{SourceLocation, panic_message},
    protocol::{ConfigSlice, RunTestSpec, WorkerMessage},
    registry::{FileSuite, Hook, HookBodyKind, HookKind, ModifierCondition, ModifierKind, Suite, TestCase},
    reporter::events::{ExpectedStatus, TestResult, TestStatus},
    time::{DeadlineTimer, deadline, stopwatch},
};
use camino::Utf8Path;
use futures::FutureExt;
use indexmap::IndexMap;
use quire_metadata::ReportError;
use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

/// Captured panic details from the worker-global panic hook, attributed to
/// whatever unit is currently executing.
#[derive(Clone, Default)]
pub(crate) struct PanicSlot {
    inner: Arc<Mutex<Option<String>>>,
}

impl PanicSlot {
    /// Installs the process-wide hook. Panics are recorded for attribution
    /// to the running test; with no test in flight they go to stderr so
    /// they are never swallowed.
    pub(crate) fn install(&self, capture: Capture) {
        let slot = self.inner.clone();
        std::panic::set_hook(Box::new(move |panic_info| {
            let message = panic_info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_owned());
            let rendered = match panic_info.location() {
                Some(location) => format!("{message} (at {location})"),
                None => message,
            };
            if !capture.has_current() {
                eprintln!("worker panic: {rendered}");
            }
            *slot.lock().expect("panic slot poisoned") = Some(rendered);
        }));
    }

    fn take(&self) -> Option<String> {
        self.inner.lock().expect("panic slot poisoned").take()
    }
}

/// Per-suite `beforeAll` bookkeeping: how many of the suite's `beforeAll`
/// hooks completed, and the error that stopped the chain, if any.
struct SuiteScopeState {
    file: camino::Utf8PathBuf,
    suite_path: Vec<String>,
    before_all_total: usize,
    before_all_completed: usize,
    failure: Option<String>,
}

/// The worker-side engine: owns the worker scope and runs one test at a
/// time through the full lifecycle.
pub(crate) struct WorkerRuntime {
    files: Arc<Vec<FileSuite>>,
    registry: FixtureRegistry,
    slice: Arc<ConfigSlice>,
    worker_info: WorkerInfo,
    worker_store: FixtureStore,
    suite_scopes: IndexMap<String, SuiteScopeState>,
    writer: MessageWriter,
    capture: Capture,
    panic_slot: PanicSlot,
}

enum PhaseFailure {
    Failed(ReportError),
    TimedOut(ReportError),
}

impl WorkerRuntime {
    pub(crate) fn new(
        files: Arc<Vec<FileSuite>>,
        registry: FixtureRegistry,
        slice: ConfigSlice,
        writer: MessageWriter,
        capture: Capture,
        panic_slot: PanicSlot,
    ) -> Self {
        let slice = Arc::new(slice);
        let worker_info = WorkerInfo {
            worker_index: slice.worker_index,
            project_name: slice.project_name.clone(),
            project_tag: slice.project_tag.clone(),
            config: slice.clone(),
        };
        Self {
            files,
            registry,
            slice,
            worker_info,
            worker_store: FixtureStore::new(FixtureScope::Worker),
            suite_scopes: IndexMap::new(),
            writer,
            capture,
            panic_slot,
        }
    }

    pub(crate) fn worker_hash(&self) -> u64 {
        self.slice.worker_hash
    }

    /// Runs one attempt, emitting `TestBegin`, stdio, and `TestEnd`.
    pub(crate) async fn run_one(&mut self, spec: RunTestSpec) -> std::io::Result<()> {
        debug!(test = %spec.title, retry = spec.retry, "running test");
        self.writer.send(&WorkerMessage::TestBegin {
            id: spec.id.clone(),
        })?;
        self.capture.begin_test(spec.id.clone());
        let sw = stopwatch();

        let mut result = self.execute(&spec).await;

        let snapshot = sw.snapshot();
        let (stdout, stderr) = self.capture.end_test();
        result.duration = snapshot.elapsed;
        result.stdout = stdout;
        result.stderr = stderr;
        result.slow = result.status != TestStatus::Skipped
            && snapshot.elapsed >= spec.timeout / 2;

        self.writer.send(&WorkerMessage::TestEnd {
            id: spec.id.clone(),
            result,
        })
    }

    /// The per-test lifecycle:
    ///
    /// 1. evaluate modifiers (with fixture access); a skip short-circuits;
    /// 2. build worker fixtures and run pending `beforeAll` hooks;
    /// 3. build test fixtures, run `beforeEach` hooks outer-to-inner;
    /// 4. run the body under the adjustable deadline;
    /// 5. run `afterEach` hooks inner-to-outer and tear down test fixtures
    ///    under a fresh deadline, even after a timeout.
    async fn execute(&mut self, spec: &RunTestSpec) -> TestResult {
        let files = self.files.clone();
        let Some((chain, test)) = find_test(&files, &spec.file, &spec.suite_path, &spec.title)
        else {
            return self.bare_result(
                spec,
                TestStatus::Failed,
                spec.expected_status,
                Some(ReportError {
                    message: format!(
                        "test `{}` not found in `{}`; controller and worker registries disagree",
                        spec.title, spec.file
                    ),
                    ..ReportError::default()
                }),
            );
        };

        let (deadline_handle, mut timer) = deadline(spec.timeout);
        let info = TestInfo::new(
            self.worker_info.clone(),
            spec.title.clone(),
            spec.suite_path.clone(),
            spec.file.clone(),
            test.location.line,
            test.location.column,
            spec.retry,
            self.slice.repeat_index,
            spec.expected_status,
            spec.timeout,
            deadline_handle,
        );
        if spec.flaky {
            info.annotate("flaky", None);
        }
        let mut test_store = FixtureStore::new(FixtureScope::Test);
        let mut errors: Vec<ReportError> = Vec::new();

        // Phase 1: modifiers, outermost suite first, then the test's own.
        let mut skip_reason: Option<(ModifierKind, Option<String>)> = None;
        let mut status_override = None;
        let modifiers = chain
            .iter()
            .flat_map(|suite| suite.modifiers.iter())
            .chain(test.modifiers.iter());
        for modifier in modifiers {
            let active = match &modifier.condition {
                ModifierCondition::Always => true,
                ModifierCondition::Value(value) => *value,
                ModifierCondition::Fixtures(condition) => {
                    let resolved = {
                        let fut = self.resolve_args(
                            &modifier.deps,
                            "modifier condition",
                            &modifier.location,
                            Some(&mut test_store),
                        );
                        tokio::select! {
                            resolved = fut => Some(resolved),
                            _ = timer.expired() => None,
                        }
                    };
                    match resolved {
                        None => {
                            status_override = Some((
                                TestStatus::TimedOut,
                                timeout_error(info.timeout(), "evaluating modifiers"),
                            ));
                            break;
                        }
                        Some(Err(err)) => {
                            status_override = Some((
                                TestStatus::Failed,
                                serialize_error_at(&err, &modifier.location),
                            ));
                            break;
                        }
                        Some(Ok(args)) => condition(&args),
                    }
                }
            };
            if !active {
                continue;
            }
            match modifier.kind {
                ModifierKind::Skip | ModifierKind::Fixme => {
                    skip_reason = Some((modifier.kind, modifier.description.clone()));
                    break;
                }
                ModifierKind::Fail => {
                    info.fail(modifier.description.clone().unwrap_or_default());
                }
                ModifierKind::Slow => {
                    info.annotate("slow", modifier.description.clone());
                    info.set_timeout(info.timeout().saturating_mul(3));
                }
                ModifierKind::Flaky => {
                    info.annotate("flaky", modifier.description.clone());
                }
            }
        }

        if let Some((status, error)) = status_override {
            info.record_error(error);
            self.teardown_test_scope(&mut test_store, spec.timeout, &mut errors)
                .await;
            return self.seal(spec, &info, status, errors);
        }

        if let Some((kind, description)) = skip_reason {
            info.annotate(kind.annotation_name(), description);
            self.teardown_test_scope(&mut test_store, spec.timeout, &mut errors)
                .await;
            // A declarative skip never runs hooks.
            return self.seal(spec, &info, TestStatus::Skipped, errors);
        }

        // Phase 2: worker scope. Each beforeAll hook and the worker-fixture
        // builds it triggers are separate invocations against the same
        // timeout.
        if let Err(failure) = self.ensure_worker_scope(&chain, spec).await {
            let status = match failure {
                PhaseFailure::TimedOut(error) => {
                    info.record_error(error);
                    TestStatus::TimedOut
                }
                PhaseFailure::Failed(error) => {
                    info.record_error(error);
                    TestStatus::Failed
                }
            };
            self.teardown_test_scope(&mut test_store, spec.timeout, &mut errors)
                .await;
            return self.seal(spec, &info, status, errors);
        }

        // Phase 3: test fixtures, then beforeEach hooks outer-to-inner.
        // Track the suite depth reached so afterEach hooks pair up.
        let each_hooks: Vec<(usize, &Hook)> = chain
            .iter()
            .enumerate()
            .flat_map(|(depth, suite)| {
                suite
                    .hooks
                    .iter()
                    .filter(|hook| hook.kind == HookKind::BeforeEach)
                    .map(move |hook| (depth, hook))
            })
            .collect();

        let mut body_error: Option<(TestStatus, Option<ReportError>)> = None;
        let mut depth_reached = chain.len();

        for (depth, hook) in &each_hooks {
            match self
                .run_each_hook(hook, &info, &mut test_store, &mut timer)
                .await
            {
                Ok(()) => {}
                Err(PhaseFailure::TimedOut(error)) => {
                    body_error = Some((TestStatus::TimedOut, Some(error)));
                    depth_reached = *depth;
                    break;
                }
                Err(PhaseFailure::Failed(error)) => {
                    // A skip signal from inside a hook is not a failure.
                    body_error = Some((classify_signal(&error), Some(error)));
                    depth_reached = *depth;
                    break;
                }
            }
        }

        // Phase 4: the body, unless a beforeEach already decided the
        // outcome.
        let status = if let Some((status, error)) = body_error {
            if let Some(error) = error {
                if status != TestStatus::Skipped {
                    info.record_error(error);
                }
            }
            status
        } else {
            match self.run_body(test, &info, &mut test_store, &mut timer).await {
                Ok(()) => TestStatus::Passed,
                Err(PhaseFailure::TimedOut(error)) => {
                    info.record_error(error);
                    TestStatus::TimedOut
                }
                Err(PhaseFailure::Failed(error)) => {
                    let status = classify_signal(&error);
                    if status != TestStatus::Skipped {
                        info.record_error(error);
                    }
                    status
                }
            }
        };

        // The status is visible (and mutable) during afterEach hooks.
        info.set_status(status);

        // Phase 5: afterEach hooks inner-to-outer, for suites whose
        // beforeEach phase was reached. Teardown gets a fresh deadline so
        // it still runs after a timeout.
        let (_teardown_handle, mut teardown_timer) = deadline(spec.timeout);
        let after_hooks: Vec<(usize, &Hook)> = chain
            .iter()
            .enumerate()
            .flat_map(|(depth, suite)| {
                suite
                    .hooks
                    .iter()
                    .filter(|hook| hook.kind == HookKind::AfterEach)
                    .map(move |hook| (depth, hook))
            })
            .collect();
        for (depth, hook) in after_hooks.iter().rev() {
            if *depth > depth_reached {
                continue;
            }
            if let Err(failure) = self
                .run_each_hook(hook, &info, &mut test_store, &mut teardown_timer)
                .await
            {
                match failure {
                    PhaseFailure::TimedOut(error) | PhaseFailure::Failed(error) => {
                        if classify_signal(&error) != TestStatus::Skipped {
                            errors.push(error);
                        }
                    }
                }
            }
        }

        // Phase 6: test fixture teardown, still under the fresh deadline.
        self.teardown_test_scope(&mut test_store, spec.timeout, &mut errors)
            .await;

        // afterEach may have overridden the status.
        let final_status = info.status().unwrap_or(status);
        let final_status = if final_status == status && !errors.is_empty() && status == TestStatus::Passed {
            // Teardown errors fail an otherwise-passing test.
            TestStatus::Failed
        } else {
            final_status
        };
        self.seal(spec, &info, final_status, errors)
    }

    fn bare_result(
        &self,
        spec: &RunTestSpec,
        status: TestStatus,
        expected_status: ExpectedStatus,
        error: Option<ReportError>,
    ) -> TestResult {
        TestResult {
            status,
            expected_status,
            duration: Duration::ZERO,
            retry: spec.retry,
            worker_index: self.slice.worker_index,
            error,
            stdout: Vec::new(),
            stderr: Vec::new(),
            attachments: Vec::new(),
            data: std::collections::BTreeMap::new(),
            annotations: Vec::new(),
            slow: false,
        }
    }

    fn seal(
        &self,
        spec: &RunTestSpec,
        info: &TestInfo,
        status: TestStatus,
        mut errors: Vec<ReportError>,
    ) -> TestResult {
        let state = info.take_state();
        if let Some(primary) = state.error {
            errors.insert(0, primary);
        }
        let error = if errors.is_empty() {
            None
        } else if errors.len() == 1 {
            Some(errors.remove(0))
        } else {
            // Keep the first error primary; append the rest to its message.
            let mut primary = errors.remove(0);
            for extra in &errors {
                primary.message.push_str("\n\nalso: ");
                primary.message.push_str(&extra.message);
            }
            Some(primary)
        };
        TestResult {
            status,
            expected_status: state.expected_status,
            duration: Duration::ZERO,
            retry: spec.retry,
            worker_index: self.slice.worker_index,
            error,
            stdout: Vec::new(),
            stderr: Vec::new(),
            attachments: state.attachments,
            data: state.data,
            annotations: state.annotations,
            slow: false,
        }
    }

    async fn run_body(
        &mut self,
        test: &TestCase,
        info: &TestInfo,
        test_store: &mut FixtureStore,
        timer: &mut DeadlineTimer,
    ) -> Result<(), PhaseFailure> {
        let args = {
            let context_label = format!("test `{}`", test.title);
            let fut = self.resolve_args(
                &test.deps,
                &context_label,
                &test.location,
                Some(test_store),
            );
            tokio::select! {
                resolved = fut => resolved.map_err(|err| {
                    PhaseFailure::Failed(serialize_error_at(&err, &test.location))
                })?,
                _ = timer.expired() => {
                    return Err(PhaseFailure::TimedOut(timeout_error(
                        info.timeout(),
                        "setting up fixtures",
                    )));
                }
            }
        };
        let cx = TestContext::new(args, info.clone());
        let body = test.body.clone();
        let fut = AssertUnwindSafe(body.run(cx)).catch_unwind();
        tokio::select! {
            outcome = fut => self.classify_outcome(outcome, &test.location),
            _ = timer.expired() => Err(PhaseFailure::TimedOut(timeout_error(
                info.timeout(),
                "running the test body",
            ))),
        }
    }

    async fn run_each_hook(
        &mut self,
        hook: &Hook,
        info: &TestInfo,
        test_store: &mut FixtureStore,
        timer: &mut DeadlineTimer,
    ) -> Result<(), PhaseFailure> {
        let args = {
            let fut = self.resolve_args(&hook.deps, "hook", &hook.location, Some(test_store));
            tokio::select! {
                resolved = fut => resolved.map_err(|err| {
                    PhaseFailure::Failed(serialize_error_at(&err, &hook.location))
                })?,
                _ = timer.expired() => {
                    return Err(PhaseFailure::TimedOut(timeout_error(
                        info.timeout(),
                        "setting up hook fixtures",
                    )));
                }
            }
        };
        let body = match &hook.body {
            HookBodyKind::Each(body) => body.clone(),
            HookBodyKind::All(_) => unreachable!("each-hook with all-hook body"),
        };
        let cx = TestContext::new(args, info.clone());
        let fut = AssertUnwindSafe(body.run(cx)).catch_unwind();
        tokio::select! {
            outcome = fut => self.classify_outcome(outcome, &hook.location),
            _ = timer.expired() => Err(PhaseFailure::TimedOut(timeout_error(
                info.timeout(),
                "running a hook",
            ))),
        }
    }

    fn classify_outcome(
        &self,
        outcome: Result<BodyResult, Box<dyn std::any::Any + Send>>,
        location: &SourceLocation,
    ) -> Result<(), PhaseFailure> {
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                if error.is::<ModifierSignal>() {
                    // Signals carry their annotation already; serialize for
                    // classification by the caller.
                    Err(PhaseFailure::Failed(ReportError {
                        message: SIGNAL_MARKER.to_owned(),
                        ..ReportError::default()
                    }))
                } else {
                    Err(PhaseFailure::Failed(serialize_error_at(
                        error.as_ref(),
                        location,
                    )))
                }
            }
            Err(payload) => {
                let message = self
                    .panic_slot
                    .take()
                    .unwrap_or_else(|| panic_message(payload.as_ref()));
                Err(PhaseFailure::Failed(ReportError {
                    message,
                    location: Some(quire_metadata::ReportLocation {
                        file: location.file.clone(),
                        line: location.line,
                        column: location.column,
                    }),
                    ..ReportError::default()
                }))
            }
        }
    }

    /// Builds worker fixtures and runs pending `beforeAll` hooks for every
    /// suite on the chain, outermost first. Suites whose chain already
    /// failed fail fast.
    async fn ensure_worker_scope(
        &mut self,
        chain: &[&Suite],
        spec: &RunTestSpec,
    ) -> Result<(), PhaseFailure> {
        for depth in 0..chain.len() {
            let key = suite_key(&spec.file, &chain[..=depth]);
            if let Some(state) = self.suite_scopes.get(&key) {
                if let Some(failure) = &state.failure {
                    return Err(PhaseFailure::Failed(ReportError {
                        message: failure.clone(),
                        ..ReportError::default()
                    }));
                }
                continue;
            }

            let suite = chain[depth];
            let before_all: Vec<&Hook> = suite
                .hooks
                .iter()
                .filter(|hook| hook.kind == HookKind::BeforeAll)
                .collect();
            let mut state = SuiteScopeState {
                file: spec.file.clone(),
                suite_path: chain[..=depth]
                    .iter()
                    .filter(|s| !s.title.is_empty())
                    .map(|s| s.title.clone())
                    .collect(),
                before_all_total: before_all.len(),
                before_all_completed: 0,
                failure: None,
            };

            let mut failure = None;
            for hook in before_all {
                match self.run_all_hook(hook, spec.timeout).await {
                    Ok(()) => state.before_all_completed += 1,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = failure {
                let message = match &err {
                    PhaseFailure::Failed(error) | PhaseFailure::TimedOut(error) => {
                        format!("beforeAll hook failed: {}", error.message)
                    }
                };
                state.failure = Some(message);
                self.suite_scopes.insert(key, state);
                return Err(err);
            }
            self.suite_scopes.insert(key, state);
        }
        Ok(())
    }

    async fn run_all_hook(&mut self, hook: &Hook, timeout: Duration) -> Result<(), PhaseFailure> {
        let args = self
            .resolve_args(&hook.deps, "beforeAll hook", &hook.location, None)
            .await
            .map_err(|err| PhaseFailure::Failed(serialize_error_at(&err, &hook.location)))?;
        let body = match &hook.body {
            HookBodyKind::All(body) => body.clone(),
            HookBodyKind::Each(_) => unreachable!("all-hook with each-hook body"),
        };
        let fut = AssertUnwindSafe(body.run(args)).catch_unwind();
        match tokio::time::timeout(timeout, fut).await {
            Ok(outcome) => self.classify_outcome(outcome, &hook.location),
            Err(_) => Err(PhaseFailure::TimedOut(timeout_error(
                timeout,
                "running a beforeAll hook",
            ))),
        }
    }

    async fn teardown_test_scope(
        &mut self,
        test_store: &mut FixtureStore,
        timeout: Duration,
        errors: &mut Vec<ReportError>,
    ) {
        match tokio::time::timeout(timeout, test_store.teardown()).await {
            Ok(teardown_errors) => {
                for error in teardown_errors.iter() {
                    errors.push(serialize_error(error.as_ref()));
                }
            }
            Err(_) => {
                errors.push(timeout_error(timeout, "tearing down test fixtures"));
            }
        }
    }

    /// Resolves the named fixtures, lazily instantiating anything missing.
    /// Worker-scoped values live across tests; test-scoped values go into
    /// `test_store`. `None` means worker context (beforeAll/afterAll),
    /// where test-scoped fixtures are off limits.
    async fn resolve_args(
        &mut self,
        deps: &[String],
        requester: &str,
        location: &SourceLocation,
        mut test_store: Option<&mut FixtureStore>,
    ) -> Result<FixtureArgs, FixtureError> {
        let auto = match test_store {
            Some(_) => AutoFixtures::All,
            None => AutoFixtures::WorkerOnly,
        };
        let keys = self.registry.closure(deps, auto, requester, location)?;
        for key in &keys {
            let def = self.registry.def(key);
            let scope = def.scope();
            if scope == FixtureScope::Test && test_store.is_none() {
                return Err(FixtureError::WorkerOnTestDep {
                    worker_fixture: requester.to_owned(),
                    test_fixture: key.name.clone(),
                });
            }
            let exists = match scope {
                FixtureScope::Worker => self.worker_store.contains(key),
                FixtureScope::Test => test_store.as_ref().is_some_and(|s| s.contains(key)),
            };
            if exists {
                continue;
            }
            let mut dep_values = IndexMap::new();
            for dep_key in self.registry.dep_keys(key) {
                let dep_scope = self
                    .registry
                    .scope_of(&dep_key.name)
                    .expect("dependency validated at registry build");
                let value = match dep_scope {
                    FixtureScope::Worker => self.worker_store.value(&dep_key),
                    FixtureScope::Test => {
                        test_store.as_ref().and_then(|s| s.value(&dep_key))
                    }
                };
                let value = value.expect("dependencies set up in topological order");
                dep_values.insert(dep_key.name.clone(), value);
            }
            let param_value = self.slice.variation.get(&key.name).cloned();
            match scope {
                FixtureScope::Worker => {
                    self.worker_store
                        .setup(&self.registry, key, dep_values, param_value)
                        .await?;
                }
                FixtureScope::Test => {
                    test_store
                        .as_mut()
                        .expect("checked above")
                        .setup(&self.registry, key, dep_values, param_value)
                        .await?;
                }
            }
        }

        let mut values = IndexMap::new();
        for name in deps {
            let key = self.registry.top_key(name);
            let value = match self.registry.scope_of(name) {
                Some(FixtureScope::Worker) => self.worker_store.value(&key),
                Some(FixtureScope::Test) => test_store.as_ref().and_then(|s| s.value(&key)),
                None => None,
            };
            let value = value.expect("requested fixtures active after setup");
            values.insert(name.clone(), value);
        }
        Ok(FixtureArgs::new(values, requester, location.clone()))
    }

    /// Worker shutdown: `afterAll` hooks in reverse completion order, then
    /// worker fixture teardown. Errors become `WorkerError` messages.
    pub(crate) async fn shutdown(&mut self) -> std::io::Result<()> {
        let files = self.files.clone();
        let scopes: Vec<_> = self
            .suite_scopes
            .values()
            .map(|state| {
                (
                    state.file.clone(),
                    state.suite_path.clone(),
                    state.before_all_completed,
                    state.before_all_total,
                )
            })
            .collect();
        for (file, suite_path, completed, total) in scopes.into_iter().rev() {
            let Some(suite) = find_suite(&files, &file, &suite_path) else {
                continue;
            };
            let after_all: Vec<&Hook> = suite
                .hooks
                .iter()
                .filter(|hook| hook.kind == HookKind::AfterAll)
                .collect();
            // When the beforeAll chain completed, every afterAll runs; a
            // partial chain runs only the pairs whose beforeAll completed.
            let count = if completed == total {
                after_all.len()
            } else {
                completed.min(after_all.len())
            };
            for hook in after_all.into_iter().take(count).rev() {
                if let Err(failure) = self.run_all_hook(hook, self.slice.timeout).await {
                    let error = match failure {
                        PhaseFailure::Failed(error) | PhaseFailure::TimedOut(error) => error,
                    };
                    self.writer.send(&WorkerMessage::WorkerError {
                        error: ReportError {
                            message: format!("afterAll hook failed: {}", error.message),
                            ..error
                        },
                    })?;
                }
            }
        }

        let teardown_errors = self.worker_store.teardown().await;
        for error in teardown_errors.iter() {
            self.writer.send(&WorkerMessage::WorkerError {
                error: serialize_error(error.as_ref()),
            })?;
        }
        Ok(())
    }
}

const SIGNAL_MARKER: &str = "\u{1f}modifier-signal";

fn classify_signal(error: &ReportError) -> TestStatus {
    if error.message == SIGNAL_MARKER {
        TestStatus::Skipped
    } else {
        TestStatus::Failed
    }
}

fn timeout_error(timeout: Duration, phase: &str) -> ReportError {
    ReportError {
        message: format!(
            "Test timeout of {}ms exceeded while {phase}",
            timeout.as_millis()
        ),
        ..ReportError::default()
    }
}

fn suite_key(file: &Utf8Path, chain: &[&Suite]) -> String {
    let mut key = file.to_string();
    for suite in chain {
        key.push('\u{1f}');
        key.push_str(&suite.title);
    }
    key
}

fn find_test<'a>(
    files: &'a [FileSuite],
    file: &Utf8Path,
    suite_path: &[String],
    title: &str,
) -> Option<(Vec<&'a Suite>, &'a TestCase)> {
    let file_suite = files.iter().find(|f| f.file == file)?;
    let mut found: Option<(Vec<&'a Suite>, &'a TestCase)> = None;
    file_suite.suite.walk_tests(|chain, test| {
        if found.is_some() || test.title != title {
            return;
        }
        let path: Vec<&str> = chain
            .iter()
            .filter(|s| !s.title.is_empty())
            .map(|s| s.title.as_str())
            .collect();
        if path == suite_path.iter().map(String::as_str).collect::<Vec<_>>() {
            found = Some((chain.to_vec(), test));
        }
    });
    found
}

fn find_suite<'a>(
    files: &'a [FileSuite],
    file: &Utf8Path,
    suite_path: &[String],
) -> Option<&'a Suite> {
    let file_suite = files.iter().find(|f| f.file == file)?;
    let mut current = &file_suite.suite;
    'outer: for title in suite_path {
        for child in &current.children {
            if let crate::registry::SuiteItem::Suite(suite) = child {
                if &suite.title == title {
                    current = suite;
                    continue 'outer;
                }
            }
        }
        return None;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixtures::{FixtureDef, FixtureSet},
        registry::{FileCollector, ModifierKind, Modifier, TestOptions},
        reporter::events::ExpectedStatus,
    };
    use camino::Utf8PathBuf;
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    /// A shared in-memory sink standing in for the worker's saved stdout.
    #[derive(Clone, Default)]
    struct SinkWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SinkWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SinkWriter {
        fn messages(&self) -> Vec<WorkerMessage> {
            let bytes = self.0.lock().unwrap();
            String::from_utf8_lossy(&bytes)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| crate::protocol::decode_line(line).expect("valid worker message"))
                .collect()
        }
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn log_entries(log: &Log) -> Vec<&'static str> {
        log.lock().unwrap().clone()
    }

    struct Harness {
        runtime: WorkerRuntime,
        sink: SinkWriter,
    }

    fn harness(
        fixtures: FixtureSet,
        register: impl Fn(&mut FileCollector) + Send + Sync,
        variation: &[(&str, serde_json::Value)],
    ) -> Harness {
        let registry = FixtureRegistry::build(fixtures).expect("valid fixture set");
        let files = Arc::new(vec![crate::registry::load_file(
            "tests/sample.rs".into(),
            &register,
        )]);
        let sink = SinkWriter::default();
        let writer = MessageWriter::new(Box::new(sink.clone()));
        let slice = ConfigSlice {
            worker_index: 0,
            worker_hash: 1,
            project_name: "default".to_owned(),
            project_tag: None,
            timeout: Duration::from_secs(5),
            test_dir: "tests".into(),
            output_dir: "test-results".into(),
            snapshot_dir: "tests/__snapshots__".into(),
            update_snapshots: false,
            variation: variation
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
            repeat_index: 0,
            global_setup_result: None,
        };
        let runtime = WorkerRuntime::new(
            files,
            registry,
            slice,
            writer,
            Capture::new(),
            PanicSlot::default(),
        );
        Harness { runtime, sink }
    }

    fn spec(title: &str, suite_path: &[&str], timeout: Duration) -> RunTestSpec {
        RunTestSpec {
            id: format!("id-{title}"),
            file: Utf8PathBuf::from("tests/sample.rs"),
            suite_path: suite_path.iter().map(|s| (*s).to_owned()).collect(),
            title: title.to_owned(),
            retry: 0,
            timeout,
            expected_status: ExpectedStatus::Passed,
            flaky: false,
            tags: Vec::new(),
        }
    }

    fn end_result(messages: &[WorkerMessage]) -> TestResult {
        messages
            .iter()
            .find_map(|message| match message {
                WorkerMessage::TestEnd { result, .. } => Some(result.clone()),
                _ => None,
            })
            .expect("a TestEnd message")
    }

    fn push(log: &Log, entry: &'static str) {
        log.lock().unwrap().push(entry);
    }

    #[tokio::test]
    async fn hooks_and_fixtures_run_in_order() {
        let log: Log = Log::default();

        let mut fixtures = FixtureSet::new();
        let fixture_log = log.clone();
        fixtures
            .extend(
                FixtureDef::new("db", FixtureScope::Test, move |_args, mut handle: crate::fixtures::FixtureHandle| {
                    let log = fixture_log.clone();
                    async move {
                        push(&log, "fixture setup");
                        handle.supply("db value".to_owned()).await?;
                        push(&log, "fixture teardown");
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let register_log = log.clone();
        let mut h = harness(
            fixtures,
            move |c: &mut FileCollector| {
                let log = register_log.clone();
                let all_log = log.clone();
                c.before_all(&[], move |_args| {
                    let log = all_log.clone();
                    async move {
                        push(&log, "beforeAll");
                        Ok(())
                    }
                });
                let outer_before = log.clone();
                c.before_each(&[], move |_cx: TestContext| {
                    let log = outer_before.clone();
                    async move {
                        push(&log, "outer beforeEach");
                        Ok(())
                    }
                });
                let outer_after = log.clone();
                c.after_each(&[], move |_cx: TestContext| {
                    let log = outer_after.clone();
                    async move {
                        push(&log, "outer afterEach");
                        Ok(())
                    }
                });
                let describe_log = log.clone();
                c.describe("inner", move |c| {
                    let inner_before = describe_log.clone();
                    c.before_each(&[], move |_cx: TestContext| {
                        let log = inner_before.clone();
                        async move {
                            push(&log, "inner beforeEach");
                            Ok(())
                        }
                    });
                    let inner_after = describe_log.clone();
                    c.after_each(&[], move |_cx: TestContext| {
                        let log = inner_after.clone();
                        async move {
                            push(&log, "inner afterEach");
                            Ok(())
                        }
                    });
                    let body_log = describe_log.clone();
                    c.test_with(
                        "ordered",
                        TestOptions::new().deps(&["db"]),
                        move |cx: TestContext| {
                            let log = body_log.clone();
                            async move {
                                let value = cx.fixture::<String>("db")?;
                                assert_eq!(*value, "db value");
                                push(&log, "body");
                                Ok(())
                            }
                        },
                    );
                });
            },
            &[],
        );

        h.runtime
            .run_one(spec("ordered", &["inner"], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Passed);
        assert_eq!(
            log_entries(&log),
            vec![
                "beforeAll",
                "fixture setup",
                "outer beforeEach",
                "inner beforeEach",
                "body",
                "inner afterEach",
                "outer afterEach",
                "fixture teardown",
            ]
        );
    }

    #[tokio::test]
    async fn failing_before_each_skips_body_but_runs_after_each() {
        let log: Log = Log::default();
        let register_log = log.clone();
        let mut h = harness(
            FixtureSet::new(),
            move |c: &mut FileCollector| {
                let before = register_log.clone();
                c.before_each(&[], move |_cx: TestContext| {
                    let log = before.clone();
                    async move {
                        push(&log, "beforeEach");
                        Err("setup broke".into())
                    }
                });
                let after = register_log.clone();
                c.after_each(&[], move |_cx: TestContext| {
                    let log = after.clone();
                    async move {
                        push(&log, "afterEach");
                        Ok(())
                    }
                });
                let body = register_log.clone();
                c.test("never runs", move |_cx: TestContext| {
                    let log = body.clone();
                    async move {
                        push(&log, "body");
                        Ok(())
                    }
                });
            },
            &[],
        );

        h.runtime
            .run_one(spec("never runs", &[], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.error.unwrap().message.contains("setup broke"));
        assert_eq!(log_entries(&log), vec!["beforeEach", "afterEach"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_abandons_body_and_still_tears_down() {
        let log: Log = Log::default();

        let mut fixtures = FixtureSet::new();
        let fixture_log = log.clone();
        fixtures
            .extend(
                FixtureDef::new("guard", FixtureScope::Test, move |_args, mut handle: crate::fixtures::FixtureHandle| {
                    let log = fixture_log.clone();
                    async move {
                        handle.supply(()).await?;
                        push(&log, "test teardown");
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let mut h = harness(
            fixtures,
            |c: &mut FileCollector| {
                c.test_with(
                    "hangs forever",
                    TestOptions::new().deps(&["guard"]),
                    |_cx: TestContext| async move {
                        std::future::pending::<()>().await;
                        Ok(())
                    },
                );
            },
            &[],
        );

        h.runtime
            .run_one(spec("hangs forever", &[], Duration::from_millis(500)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::TimedOut);
        assert!(
            result.error.unwrap().message.contains("timeout"),
            "timeout error expected"
        );
        assert_eq!(log_entries(&log), vec!["test teardown"]);
    }

    #[tokio::test]
    async fn declarative_skip_runs_no_hooks() {
        let log: Log = Log::default();
        let register_log = log.clone();
        let mut h = harness(
            FixtureSet::new(),
            move |c: &mut FileCollector| {
                let hook_log = register_log.clone();
                c.before_each(&[], move |_cx: TestContext| {
                    let log = hook_log.clone();
                    async move {
                        push(&log, "beforeEach");
                        Ok(())
                    }
                });
                c.test_with(
                    "skipped",
                    TestOptions::new().skip("not ready"),
                    |_cx: TestContext| async move { Ok(()) },
                );
            },
            &[],
        );

        h.runtime
            .run_one(spec("skipped", &[], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Skipped);
        assert!(log_entries(&log).is_empty());
        assert_eq!(result.annotations.len(), 1);
        assert_eq!(result.annotations[0].kind, "skip");
    }

    #[tokio::test]
    async fn runtime_skip_signal_is_not_a_failure() {
        let mut h = harness(
            FixtureSet::new(),
            |c: &mut FileCollector| {
                c.test("self-skipping", |cx: TestContext| async move {
                    cx.skip("no display server")?;
                    unreachable!("skip returns Err");
                });
            },
            &[],
        );

        h.runtime
            .run_one(spec("self-skipping", &[], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Skipped);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn fixture_conditioned_skip_sees_parameter_values() {
        let mut fixtures = FixtureSet::new();
        fixtures
            .extend(FixtureDef::parameter("mode", "run mode", None))
            .unwrap();

        let mut h = harness(
            fixtures,
            |c: &mut FileCollector| {
                c.test_with(
                    "mode gated",
                    TestOptions::new().deps(&["mode"]).modifier(
                        Modifier::new(ModifierKind::Skip)
                            .describe("slow mode only")
                            .when_fixtures(&["mode"], |args| {
                                args.param("mode").unwrap() == serde_json::json!("fast")
                            }),
                    ),
                    |_cx: TestContext| async move { Ok(()) },
                );
            },
            &[("mode", serde_json::json!("fast"))],
        );

        h.runtime
            .run_one(spec("mode gated", &[], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Skipped);
    }

    #[tokio::test]
    async fn panic_in_body_is_a_failure_with_message() {
        let mut h = harness(
            FixtureSet::new(),
            |c: &mut FileCollector| {
                c.test("panics", |_cx: TestContext| async move {
                    panic!("boom at runtime");
                });
            },
            &[],
        );

        h.runtime
            .run_one(spec("panics", &[], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.error.unwrap().message.contains("boom at runtime"));
    }

    #[tokio::test]
    async fn runtime_fail_flips_expected_status() {
        let mut h = harness(
            FixtureSet::new(),
            |c: &mut FileCollector| {
                c.test("expected to fail", |cx: TestContext| async move {
                    cx.info().fail("known regression");
                    Err("the regression".into())
                });
            },
            &[],
        );

        h.runtime
            .run_one(spec("expected to fail", &[], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.expected_status, ExpectedStatus::Failed);
        assert!(result.expected_status.matches(result.status));
    }

    #[tokio::test]
    async fn after_all_runs_at_shutdown_for_completed_before_all() {
        let log: Log = Log::default();

        let mut fixtures = FixtureSet::new();
        let fixture_log = log.clone();
        fixtures
            .extend(
                FixtureDef::new("server", FixtureScope::Worker, move |_args, mut handle: crate::fixtures::FixtureHandle| {
                    let log = fixture_log.clone();
                    async move {
                        push(&log, "worker fixture setup");
                        handle.supply(()).await?;
                        push(&log, "worker teardown");
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let register_log = log.clone();
        let mut h = harness(
            fixtures,
            move |c: &mut FileCollector| {
                let before = register_log.clone();
                c.before_all(&["server"], move |_args| {
                    let log = before.clone();
                    async move {
                        push(&log, "beforeAll");
                        Ok(())
                    }
                });
                let after = register_log.clone();
                c.after_all(&[], move |_args| {
                    let log = after.clone();
                    async move {
                        push(&log, "afterAll");
                        Ok(())
                    }
                });
                c.test("uses worker scope", |_cx: TestContext| async move { Ok(()) });
            },
            &[],
        );

        h.runtime
            .run_one(spec("uses worker scope", &[], Duration::from_secs(5)))
            .await
            .unwrap();
        h.runtime.shutdown().await.unwrap();

        assert_eq!(
            log_entries(&log),
            vec![
                "worker fixture setup",
                "beforeAll",
                "afterAll",
                "worker teardown",
            ]
        );
        // No worker errors were reported.
        assert!(
            !h.sink
                .messages()
                .iter()
                .any(|m| matches!(m, WorkerMessage::WorkerError { .. }))
        );
    }

    #[tokio::test]
    async fn failing_before_all_blocks_the_test_and_its_after_all() {
        let log: Log = Log::default();
        let register_log = log.clone();
        let mut h = harness(
            FixtureSet::new(),
            move |c: &mut FileCollector| {
                c.before_all(&[], |_args| async move { Err("no database".into()) });
                let after = register_log.clone();
                c.after_all(&[], move |_args| {
                    let log = after.clone();
                    async move {
                        push(&log, "afterAll");
                        Ok(())
                    }
                });
                let body = register_log.clone();
                c.test("blocked", move |_cx: TestContext| {
                    let log = body.clone();
                    async move {
                        push(&log, "body");
                        Ok(())
                    }
                });
            },
            &[],
        );

        h.runtime
            .run_one(spec("blocked", &[], Duration::from_secs(5)))
            .await
            .unwrap();
        h.runtime.shutdown().await.unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.error.unwrap().message.contains("no database"));
        // Neither the body nor the unpaired afterAll ran.
        assert!(log_entries(&log).is_empty());
    }

    #[tokio::test]
    async fn after_each_can_override_the_status() {
        let mut h = harness(
            FixtureSet::new(),
            |c: &mut FileCollector| {
                c.after_each(&[], |cx: TestContext| async move {
                    // Quarantine: downgrade failures to skips.
                    if cx.info().status() == Some(TestStatus::Failed) {
                        cx.info().set_status(TestStatus::Skipped);
                    }
                    Ok(())
                });
                c.test("quarantined", |_cx: TestContext| async move {
                    Err("flaking again".into())
                });
            },
            &[],
        );

        h.runtime
            .run_one(spec("quarantined", &[], Duration::from_secs(5)))
            .await
            .unwrap();

        let result = end_result(&h.sink.messages());
        assert_eq!(result.status, TestStatus::Skipped);
    }
}

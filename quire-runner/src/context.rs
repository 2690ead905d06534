// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Context objects passed into user code.
//!
//! [`WorkerInfo`] describes the worker a test runs in; [`TestInfo`] extends
//! it with everything about the current test instance, including the mutable
//! bits (status, data bag, annotations, timeout). [`TestContext`] is the
//! argument handed to test bodies and each-hooks: resolved fixtures plus the
//! `TestInfo`.

use crate::{
    errors::{BodyError, BodyResult, FixtureError},
    fixtures::FixtureArgs,
    helpers::slugify,
    protocol::ConfigSlice,
    reporter::events::{ExpectedStatus, TestStatus},
    time::DeadlineHandle,
};
use camino::Utf8PathBuf;
use quire_metadata::{ReportAnnotation, ReportAttachment, ReportError};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// Information about the worker a test is running in.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    /// The worker's index, 0-based and stable for the worker's lifetime.
    pub worker_index: usize,
    /// The project this worker serves.
    pub project_name: String,
    /// The project tag, if any.
    pub project_tag: Option<String>,
    /// The resolved data configuration.
    pub config: Arc<ConfigSlice>,
}

/// A control-flow signal raised by `TestInfo::skip`/`fixme`.
///
/// It travels as an ordinary body error; the worker runtime downcasts it to
/// classify the outcome instead of recording a failure.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {}", description.as_deref().unwrap_or("no reason given"))]
pub struct ModifierSignal {
    /// Which modifier fired.
    pub kind: ModifierSignalKind,
    /// The reason, if one was given.
    pub description: Option<String>,
}

/// The kind of a [`ModifierSignal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifierSignalKind {
    /// Skip the rest of the test; the result is `skipped`.
    Skip,
    /// Like skip, but marks the test as needing a fix.
    Fixme,
}

impl fmt::Display for ModifierSignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Fixme => write!(f, "fixme"),
        }
    }
}

impl ModifierSignalKind {
    pub(crate) fn annotation_name(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Fixme => "fixme",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TestInfoState {
    pub(crate) status: Option<TestStatus>,
    pub(crate) expected_status: ExpectedStatus,
    pub(crate) error: Option<ReportError>,
    pub(crate) data: std::collections::BTreeMap<String, serde_json::Value>,
    pub(crate) annotations: Vec<ReportAnnotation>,
    pub(crate) attachments: Vec<ReportAttachment>,
    pub(crate) snapshot_segment: Option<String>,
    pub(crate) timeout: Duration,
}

struct TestInfoShared {
    worker: WorkerInfo,
    title: String,
    suite_path: Vec<String>,
    file: Utf8PathBuf,
    line: u32,
    column: u32,
    retry: usize,
    repeat_each_index: usize,
    deadline: DeadlineHandle,
    state: Mutex<TestInfoState>,
}

/// Everything user code may want to know (or change) about the running
/// test. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TestInfo {
    shared: Arc<TestInfoShared>,
}

impl TestInfo {
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker: WorkerInfo,
        title: String,
        suite_path: Vec<String>,
        file: Utf8PathBuf,
        line: u32,
        column: u32,
        retry: usize,
        repeat_each_index: usize,
        expected_status: ExpectedStatus,
        timeout: Duration,
        deadline: DeadlineHandle,
    ) -> Self {
        Self {
            shared: Arc::new(TestInfoShared {
                worker,
                title,
                suite_path,
                file,
                line,
                column,
                retry,
                repeat_each_index,
                deadline,
                state: Mutex::new(TestInfoState {
                    expected_status,
                    timeout,
                    ..Default::default()
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TestInfoState> {
        self.shared
            .state
            .lock()
            .expect("test info state poisoned")
    }

    /// The worker this test runs in.
    pub fn worker(&self) -> &WorkerInfo {
        &self.shared.worker
    }

    /// The worker index.
    pub fn worker_index(&self) -> usize {
        self.shared.worker.worker_index
    }

    /// The project name.
    pub fn project_name(&self) -> &str {
        &self.shared.worker.project_name
    }

    /// The test title.
    pub fn title(&self) -> &str {
        &self.shared.title
    }

    /// Titles of the enclosing suites, outermost first.
    pub fn suite_path(&self) -> &[String] {
        &self.shared.suite_path
    }

    /// The test's file.
    pub fn file(&self) -> &Utf8PathBuf {
        &self.shared.file
    }

    /// Declaration line.
    pub fn line(&self) -> u32 {
        self.shared.line
    }

    /// Declaration column.
    pub fn column(&self) -> u32 {
        self.shared.column
    }

    /// The retry index of this attempt, starting at 0.
    pub fn retry(&self) -> usize {
        self.shared.retry
    }

    /// The repeat-each index of this instance.
    pub fn repeat_each_index(&self) -> usize {
        self.shared.repeat_each_index
    }

    /// The value returned by global setup, if any.
    pub fn global_setup_result(&self) -> Option<serde_json::Value> {
        self.shared.worker.config.global_setup_result.clone()
    }

    /// The parameter variation for this instance.
    pub fn parameters(&self) -> indexmap::IndexMap<String, serde_json::Value> {
        self.shared.worker.config.variation.clone()
    }

    /// The currently configured timeout.
    pub fn timeout(&self) -> Duration {
        self.state().timeout
    }

    /// Replaces the timeout for the current attempt, measured from its
    /// start.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state().timeout = timeout;
        self.shared.deadline.set_timeout(timeout);
    }

    /// The instant the current attempt times out.
    pub fn deadline(&self) -> std::time::Instant {
        self.shared.deadline.expires_at().into_std()
    }

    /// The status the runner expects this test to reach.
    pub fn expected_status(&self) -> ExpectedStatus {
        self.state().expected_status
    }

    /// The status reached so far. `None` while the body is still running;
    /// set before `afterEach` hooks run, and mutable there.
    pub fn status(&self) -> Option<TestStatus> {
        self.state().status
    }

    /// Overrides the status; meaningful inside `afterEach` hooks.
    pub fn set_status(&self, status: TestStatus) {
        self.state().status = Some(status);
    }

    /// The error recorded for this attempt, if any.
    pub fn error(&self) -> Option<ReportError> {
        self.state().error.clone()
    }

    /// Writes a value into the data bag persisted into the result.
    pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.state().data.insert(key.into(), value);
    }

    /// Reads a value from the data bag.
    pub fn data(&self, key: &str) -> Option<serde_json::Value> {
        self.state().data.get(key).cloned()
    }

    /// Records an annotation.
    pub fn annotate(&self, kind: impl Into<String>, description: Option<String>) {
        self.state().annotations.push(ReportAnnotation {
            kind: kind.into(),
            description,
        });
    }

    /// The annotations recorded so far.
    pub fn annotations(&self) -> Vec<ReportAnnotation> {
        self.state().annotations.clone()
    }

    /// Registers an attachment on the result.
    pub fn attach(
        &self,
        name: impl Into<String>,
        path: Option<Utf8PathBuf>,
        content_type: impl Into<String>,
    ) {
        self.state().attachments.push(ReportAttachment {
            name: name.into(),
            path,
            content_type: content_type.into(),
        });
    }

    /// Skips the rest of the test. Use with `?`:
    ///
    /// ```ignore
    /// cx.info().skip("requires a display server")?;
    /// ```
    pub fn skip(&self, reason: impl Into<String>) -> BodyResult {
        self.signal(ModifierSignalKind::Skip, Some(reason.into()))
    }

    /// Skips the rest of the test, marking it as needing a fix.
    pub fn fixme(&self, reason: impl Into<String>) -> BodyResult {
        self.signal(ModifierSignalKind::Fixme, Some(reason.into()))
    }

    /// Marks the test as expected to fail from this point on, and
    /// continues running.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.state();
        state.expected_status = ExpectedStatus::Failed;
        state.annotations.push(ReportAnnotation {
            kind: "fail".to_owned(),
            description: Some(reason.into()),
        });
    }

    /// Triples the remaining timeout, the same as the `slow` modifier.
    pub fn slow(&self, reason: impl Into<String>) {
        let tripled = {
            let mut state = self.state();
            state.annotations.push(ReportAnnotation {
                kind: "slow".to_owned(),
                description: Some(reason.into()),
            });
            state.timeout = state.timeout.saturating_mul(3);
            state.timeout
        };
        self.shared.deadline.set_timeout(tripled);
    }

    fn signal(&self, kind: ModifierSignalKind, description: Option<String>) -> BodyResult {
        self.state().annotations.push(ReportAnnotation {
            kind: kind.annotation_name().to_owned(),
            description: description.clone(),
        });
        Err(Box::new(ModifierSignal { kind, description }) as BodyError)
    }

    /// The snapshot path segment for this instance, if one was set.
    pub fn snapshot_path_segment(&self) -> Option<String> {
        self.state().snapshot_segment.clone()
    }

    /// Sets the per-variation snapshot path segment.
    pub fn set_snapshot_path_segment(&self, segment: impl Into<String>) {
        self.state().snapshot_segment = Some(segment.into());
    }

    fn file_slug(&self) -> String {
        slugify(self.shared.file.as_str())
    }

    fn title_slug(&self) -> String {
        title_slug(&self.shared.suite_path, &self.shared.title)
    }

    /// The per-instance output directory:
    /// `<outputDir>/<file-slug>-<title-slug>[-<tag>][-retry<n>][-repeat<n>]`.
    pub fn output_dir(&self) -> Utf8PathBuf {
        instance_output_dir(
            &self.shared.worker.config.output_dir,
            &self.shared.file,
            &self.shared.suite_path,
            &self.shared.title,
            self.shared.worker.project_tag.as_deref(),
            self.shared.retry,
            self.shared.repeat_each_index,
        )
    }

    /// A path inside [`output_dir`](Self::output_dir).
    pub fn output_path<I, S>(&self, segments: I) -> Utf8PathBuf
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = self.output_dir();
        for segment in segments {
            path.push(segment.as_ref());
        }
        path
    }

    /// A path inside the snapshot tree:
    /// `<snapshotDir>/<file-slug>/<title-slug>/[<segment>/]<name>`.
    pub fn snapshot_path(&self, name: &str) -> Utf8PathBuf {
        let mut path = self
            .shared
            .worker
            .config
            .snapshot_dir
            .join(self.file_slug());
        path.push(self.title_slug());
        if let Some(segment) = self.snapshot_path_segment() {
            path.push(segment);
        }
        path.push(name);
        path
    }

    pub(crate) fn take_state(&self) -> TestInfoState {
        std::mem::take(&mut *self.state())
    }

    pub(crate) fn record_error(&self, error: ReportError) {
        let mut state = self.state();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }
}

impl fmt::Debug for TestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestInfo")
            .field("title", &self.shared.title)
            .field("file", &self.shared.file)
            .field("retry", &self.shared.retry)
            .field("worker_index", &self.shared.worker.worker_index)
            .finish_non_exhaustive()
    }
}

fn title_slug(suite_path: &[String], title: &str) -> String {
    let mut full = suite_path.join(" ");
    if !full.is_empty() {
        full.push(' ');
    }
    full.push_str(title);
    slugify(&full)
}

/// The output-directory rule, shared between `TestInfo` (in the worker) and
/// the controller's output-retention pass.
pub(crate) fn instance_output_dir(
    output_root: &Utf8PathBuf,
    file: &Utf8PathBuf,
    suite_path: &[String],
    title: &str,
    project_tag: Option<&str>,
    retry: usize,
    repeat_each_index: usize,
) -> Utf8PathBuf {
    let mut leaf = format!("{}-{}", slugify(file.as_str()), title_slug(suite_path, title));
    if let Some(tag) = project_tag {
        leaf.push('-');
        leaf.push_str(&slugify(tag));
    }
    if retry > 0 {
        leaf.push_str(&format!("-retry{retry}"));
    }
    if repeat_each_index > 0 {
        leaf.push_str(&format!("-repeat{repeat_each_index}"));
    }
    output_root.join(leaf)
}

/// The argument handed to test bodies and `beforeEach`/`afterEach` hooks:
/// resolved fixture values plus the test info.
pub struct TestContext {
    args: FixtureArgs,
    info: TestInfo,
}

impl TestContext {
    pub(crate) fn new(args: FixtureArgs, info: TestInfo) -> Self {
        Self { args, info }
    }

    /// The resolved fixture values.
    pub fn fixtures(&self) -> &FixtureArgs {
        &self.args
    }

    /// Fetches a fixture value, downcast to `T`.
    pub fn fixture<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, FixtureError> {
        self.args.get(name)
    }

    /// Fetches a parameter value.
    pub fn param(&self, name: &str) -> Result<serde_json::Value, FixtureError> {
        self.args.param(name)
    }

    /// The test info.
    pub fn info(&self) -> &TestInfo {
        &self.info
    }

    /// Shorthand for `info().skip(..)`.
    pub fn skip(&self, reason: impl Into<String>) -> BodyResult {
        self.info.skip(reason)
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller's event context.
//!
//! This sits between the scheduling loop and the reporter callback: it
//! keeps the run statistics, classifies sealed results against their
//! expectations, and turns everything into [`TestEvent`]s.

use crate::{
    config::Config,
    list::{TestInstance, TestList},
    reporter::events::{
        CancelReason, FinalStatus, RunStats, StdioKind, TestEvent, TestEventKind, TestResult,
        TestStatus,
    },
    time::{Stopwatch, stopwatch},
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use quire_metadata::{OutputChunk, ReportError};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// How a sealed final result counts against the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FinalOutcome {
    Passed,
    Flaky,
    ExpectedFlaky,
    Failed,
    TimedOut,
    Skipped,
}

/// Classifies the final (non-retried) result of an instance.
pub(crate) fn classify_final(instance: &TestInstance, result: &TestResult) -> FinalOutcome {
    if result.status == TestStatus::Skipped {
        return FinalOutcome::Skipped;
    }
    if result.expected_status.matches(result.status) {
        if result.retry > 0 && result.status == TestStatus::Passed {
            if instance.flaky {
                FinalOutcome::ExpectedFlaky
            } else {
                FinalOutcome::Flaky
            }
        } else {
            FinalOutcome::Passed
        }
    } else if result.status == TestStatus::TimedOut {
        FinalOutcome::TimedOut
    } else {
        // Unexpected failure, or an unexpected pass of a fail-expected
        // test.
        FinalOutcome::Failed
    }
}

/// True when this attempt diverged from its expectation (drives retries and
/// `--max-failures`).
pub(crate) fn is_unexpected(result: &TestResult) -> bool {
    !result.expected_status.matches(result.status)
}

#[derive_where::derive_where(Debug)]
pub(crate) struct DispatcherContext<F> {
    callback: DebugIgnore<F>,
    stopwatch: Stopwatch,
    pub(crate) run_stats: RunStats,
    max_failures: Option<usize>,
    global_timeout: Option<Duration>,
    unexpected_count: usize,
}

impl<F> DispatcherContext<F>
where
    F: FnMut(TestEvent),
{
    pub(crate) fn new(
        callback: F,
        initial_run_count: usize,
        max_failures: Option<usize>,
        global_timeout: Option<Duration>,
    ) -> Self {
        Self {
            callback: DebugIgnore(callback),
            stopwatch: stopwatch(),
            run_stats: RunStats {
                initial_run_count,
                ..RunStats::default()
            },
            max_failures,
            global_timeout,
            unexpected_count: 0,
        }
    }

    fn emit(&mut self, kind: TestEventKind) {
        let snapshot = self.stopwatch.snapshot();
        (self.callback)(TestEvent {
            timestamp: Local::now(),
            elapsed: snapshot.elapsed,
            kind,
        });
    }

    pub(crate) fn run_started(&mut self, config: Arc<Config>, test_list: Arc<TestList>) {
        self.emit(TestEventKind::RunStarted { config, test_list });
    }

    pub(crate) fn test_started(&mut self, instance_id: String, retry: usize, worker_index: usize) {
        self.emit(TestEventKind::TestStarted {
            instance_id,
            retry,
            worker_index,
        });
    }

    pub(crate) fn stdio(
        &mut self,
        kind: StdioKind,
        instance_id: Option<String>,
        chunk: OutputChunk,
    ) {
        self.emit(TestEventKind::Stdio {
            kind,
            instance_id,
            chunk,
        });
    }

    pub(crate) fn error(&mut self, error: ReportError) {
        self.emit(TestEventKind::Error { error });
    }

    /// Records a worker-level error. These fail the run.
    pub(crate) fn worker_error(&mut self, error: ReportError) {
        self.run_stats.worker_errors += 1;
        self.emit(TestEventKind::Error { error });
    }

    /// Processes a sealed result. Returns true when this result trips
    /// `--max-failures`.
    pub(crate) fn test_finished(
        &mut self,
        instance: &TestInstance,
        result: TestResult,
        will_retry: bool,
    ) -> bool {
        let unexpected = is_unexpected(&result);
        if !will_retry {
            self.run_stats.finished_count += 1;
            match classify_final(instance, &result) {
                FinalOutcome::Passed => self.run_stats.passed += 1,
                FinalOutcome::Flaky => {
                    self.run_stats.passed += 1;
                    self.run_stats.flaky += 1;
                }
                FinalOutcome::ExpectedFlaky => {
                    self.run_stats.passed += 1;
                    self.run_stats.expected_flaky += 1;
                }
                FinalOutcome::Failed => self.run_stats.failed += 1,
                FinalOutcome::TimedOut => self.run_stats.timed_out += 1,
                FinalOutcome::Skipped => self.run_stats.skipped += 1,
            }
        }
        if unexpected {
            self.unexpected_count += 1;
        }
        let current_stats = self.run_stats;
        self.emit(TestEventKind::TestFinished {
            instance_id: instance.id.clone(),
            result,
            will_retry,
            current_stats,
        });

        match self.max_failures {
            Some(limit) => unexpected && self.unexpected_count >= limit,
            None => false,
        }
    }

    /// Marks the run cancelled (first reason wins) and announces it.
    pub(crate) fn cancel(&mut self, reason: CancelReason, running: usize) {
        if self.run_stats.cancel_reason.is_none() {
            debug!(?reason, running, "cancelling run");
            self.run_stats.cancel_reason = Some(reason);
        }
        self.emit(TestEventKind::RunCancelRequested {
            reason,
            running,
        });
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        self.run_stats.cancel_reason
    }

    /// The reason string recorded on instances skipped by cancellation.
    pub(crate) fn skip_reason(&self) -> String {
        self.run_stats
            .cancel_reason
            .map(|reason| reason.skip_reason(self.global_timeout))
            .unwrap_or_else(|| "Cancelled".to_owned())
    }

    /// Emits the final event and returns the stats.
    pub(crate) fn run_finished(&mut self) -> RunStats {
        let snapshot = self.stopwatch.snapshot();
        let run_stats = self.run_stats;
        self.emit(TestEventKind::RunFinished {
            start_time: snapshot.start_time,
            elapsed: snapshot.elapsed,
            run_stats,
        });
        run_stats
    }

    /// The run's final status so far.
    pub(crate) fn final_status(&self) -> FinalStatus {
        self.run_stats.final_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::events::ExpectedStatus;
    use std::collections::BTreeMap;

    fn result(status: TestStatus, expected: ExpectedStatus, retry: usize) -> TestResult {
        TestResult {
            status,
            expected_status: expected,
            duration: Duration::from_millis(5),
            retry,
            worker_index: 0,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            attachments: Vec::new(),
            data: BTreeMap::new(),
            annotations: Vec::new(),
            slow: false,
        }
    }

    fn instance(flaky: bool) -> TestInstance {
        TestInstance {
            id: "0000000000000000".to_owned(),
            file: "tests/a.rs".into(),
            suite_path: vec![],
            title: "t".to_owned(),
            location: Default::default(),
            project_name: "default".to_owned(),
            project_tag: None,
            variation: Default::default(),
            repeat_index: 0,
            worker_hash: 0,
            timeout: Duration::from_secs(30),
            retries: 0,
            expected_status: ExpectedStatus::Passed,
            flaky,
            tags: vec![],
            discovery_error: None,
        }
    }

    #[test]
    fn classification_covers_the_matrix() {
        let i = instance(false);
        assert_eq!(
            classify_final(&i, &result(TestStatus::Passed, ExpectedStatus::Passed, 0)),
            FinalOutcome::Passed
        );
        assert_eq!(
            classify_final(&i, &result(TestStatus::Passed, ExpectedStatus::Passed, 1)),
            FinalOutcome::Flaky
        );
        assert_eq!(
            classify_final(
                &instance(true),
                &result(TestStatus::Passed, ExpectedStatus::Passed, 2)
            ),
            FinalOutcome::ExpectedFlaky
        );
        assert_eq!(
            classify_final(&i, &result(TestStatus::Failed, ExpectedStatus::Failed, 0)),
            FinalOutcome::Passed
        );
        assert_eq!(
            classify_final(&i, &result(TestStatus::Passed, ExpectedStatus::Failed, 0)),
            FinalOutcome::Failed
        );
        assert_eq!(
            classify_final(&i, &result(TestStatus::TimedOut, ExpectedStatus::Passed, 0)),
            FinalOutcome::TimedOut
        );
        assert_eq!(
            classify_final(&i, &result(TestStatus::Skipped, ExpectedStatus::Passed, 0)),
            FinalOutcome::Skipped
        );
    }

    #[test]
    fn max_failures_trips_on_unexpected_results() {
        let mut events = Vec::new();
        let mut ctx = DispatcherContext::new(
            |event: TestEvent| events.push(format!("{:?}", std::mem::discriminant(&event.kind))),
            10,
            Some(2),
            None,
        );
        let i = instance(false);
        assert!(!ctx.test_finished(
            &i,
            result(TestStatus::Failed, ExpectedStatus::Passed, 0),
            false
        ));
        assert!(ctx.test_finished(
            &i,
            result(TestStatus::Failed, ExpectedStatus::Passed, 0),
            false
        ));
        assert_eq!(ctx.run_stats.failed, 2);
    }

    #[test]
    fn retried_attempts_do_not_count_until_final() {
        let mut ctx = DispatcherContext::new(|_event: TestEvent| {}, 1, None, None);
        let i = instance(false);
        ctx.test_finished(
            &i,
            result(TestStatus::Failed, ExpectedStatus::Passed, 0),
            true,
        );
        assert_eq!(ctx.run_stats.finished_count, 0);
        ctx.test_finished(
            &i,
            result(TestStatus::Passed, ExpectedStatus::Passed, 1),
            false,
        );
        assert_eq!(ctx.run_stats.finished_count, 1);
        assert_eq!(ctx.run_stats.flaky, 1);
        assert_eq!(ctx.final_status(), FinalStatus::Passed);
    }
}

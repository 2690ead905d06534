// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events for the reporter.
//!
//! These types form the interface between the scheduler and the reporters.
//! The root structure for all events is [`TestEvent`].

use crate::{config::Config, list::TestList};
use chrono::{DateTime, Local};
use quire_metadata::{OutputChunk, ReportAnnotation, ReportAttachment, ReportError, ReportStatus};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// The status a single attempt reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    /// The attempt passed.
    Passed,
    /// The attempt failed.
    Failed,
    /// The attempt hit its wall-clock timeout.
    TimedOut,
    /// The attempt was skipped.
    Skipped,
}

impl TestStatus {
    /// Converts to the report representation.
    pub fn to_report(self) -> ReportStatus {
        match self {
            Self::Passed => ReportStatus::Passed,
            Self::Failed => ReportStatus::Failed,
            Self::TimedOut => ReportStatus::TimedOut,
            Self::Skipped => ReportStatus::Skipped,
        }
    }
}

/// The status the runner expects a test to reach. Divergence is a failure
/// even when the actual status is `passed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpectedStatus {
    /// The test should pass.
    #[default]
    Passed,
    /// The test should fail (`fail` modifier).
    Failed,
    /// The test should be skipped (`skip`/`fixme` modifiers).
    Skipped,
}

impl ExpectedStatus {
    /// Converts to the report representation.
    pub fn to_report(self) -> ReportStatus {
        match self {
            Self::Passed => ReportStatus::Passed,
            Self::Failed => ReportStatus::Failed,
            Self::Skipped => ReportStatus::Skipped,
        }
    }

    /// Whether reaching `status` counts as expected.
    ///
    /// A skip is always expected: skipping is a decision, not an outcome.
    pub fn matches(self, status: TestStatus) -> bool {
        match (self, status) {
            (_, TestStatus::Skipped) => true,
            (Self::Passed, TestStatus::Passed) => true,
            (Self::Failed, TestStatus::Failed) => true,
            (Self::Skipped, _) => false,
            _ => false,
        }
    }
}

/// The sealed result of one attempt at one test instance.
///
/// Created when the worker starts the attempt, sealed when it emits the
/// completion message. Teardown errors discovered later are appended by the
/// scheduler to the worker's error list, never silently dropped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    /// The status the attempt reached.
    pub status: TestStatus,

    /// The status that was expected at seal time. Runtime modifiers
    /// (`fail()`, fixture-conditioned `skip`) can change this from the
    /// statically-known value, so it travels with the result.
    #[serde(default)]
    pub expected_status: ExpectedStatus,

    /// Wall-clock duration of the attempt.
    #[serde(with = "crate::helpers::duration_millis")]
    pub duration: Duration,

    /// Retry index, starting at 0.
    pub retry: usize,

    /// The worker that ran the attempt.
    pub worker_index: usize,

    /// The error that decided the status, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,

    /// Captured stdout, in write order.
    #[serde(default)]
    pub stdout: Vec<OutputChunk>,

    /// Captured stderr, in write order.
    #[serde(default)]
    pub stderr: Vec<OutputChunk>,

    /// Attachments registered during the attempt.
    #[serde(default)]
    pub attachments: Vec<ReportAttachment>,

    /// The user-writable data bag.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,

    /// Annotations recorded during the attempt (runtime skip/fixme/...).
    #[serde(default)]
    pub annotations: Vec<ReportAnnotation>,

    /// True if the attempt took more than half its timeout.
    #[serde(default)]
    pub slow: bool,
}

impl TestResult {
    /// A synthetic skipped result, used when an instance never reaches a
    /// worker (cancellation, `--max-failures`).
    pub fn synthetic_skip(retry: usize, reason: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Skipped,
            expected_status: ExpectedStatus::Passed,
            duration: Duration::ZERO,
            retry,
            worker_index: 0,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            attachments: Vec::new(),
            data: BTreeMap::new(),
            annotations: vec![ReportAnnotation {
                kind: "skip".to_owned(),
                description: Some(reason.into()),
            }],
            slow: false,
        }
    }
}

/// Which stdio stream a chunk came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StdioKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Why a run was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// `--max-failures` was reached.
    MaxFailures,
    /// The global timeout expired.
    GlobalTimeout,
    /// An interrupt/termination signal arrived.
    Signal,
}

impl CancelReason {
    /// The reason string recorded on skipped instances.
    pub(crate) fn skip_reason(self, global_timeout: Option<Duration>) -> String {
        match self {
            Self::MaxFailures => "Reached maximum allowed failures".to_owned(),
            Self::GlobalTimeout => {
                let secs = global_timeout.map(|t| t.as_secs()).unwrap_or(0);
                format!("Timed out waiting {secs}s for the entire test run")
            }
            Self::Signal => "Interrupted".to_owned(),
        }
    }
}

/// Cumulative statistics for a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunStats {
    /// The total number of instances expected to run at the beginning.
    pub initial_run_count: usize,

    /// Instances that finished (reached a final status, counting all
    /// retries of an instance as one).
    pub finished_count: usize,

    /// Instances whose final attempt passed as expected.
    pub passed: usize,

    /// Instances that passed only on a retry while expected to pass
    /// outright.
    pub flaky: usize,

    /// Instances marked flaky that eventually passed.
    pub expected_flaky: usize,

    /// Instances whose final attempt failed unexpectedly.
    pub failed: usize,

    /// Instances whose final attempt timed out.
    pub timed_out: usize,

    /// Instances that were skipped (including cancellation skips).
    pub skipped: usize,

    /// Errors attributed to workers rather than tests.
    pub worker_errors: usize,

    /// Set when the run stopped early.
    pub cancel_reason: Option<CancelReason>,
}

impl RunStats {
    /// The final status of the run.
    ///
    /// Passed iff nothing failed or timed out, no worker errors, and the run
    /// wasn't cancelled. Flaky instances are reported but do not fail the
    /// run: their final attempt reached the expected status.
    pub fn final_status(&self) -> FinalStatus {
        let cancelled = self.cancel_reason.is_some();
        if self.failed == 0 && self.timed_out == 0 && self.worker_errors == 0 && !cancelled {
            FinalStatus::Passed
        } else {
            FinalStatus::Failed
        }
    }
}

/// The outcome of an entire run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalStatus {
    /// Every test reached its expected status.
    Passed,
    /// Something failed, timed out, flaked unexpectedly, or the run was
    /// cancelled.
    Failed,
}

/// A reporter event.
#[derive(Clone, Debug)]
pub struct TestEvent {
    /// The time at which the event was generated.
    pub timestamp: DateTime<Local>,

    /// Time elapsed since the start of the run.
    pub elapsed: Duration,

    /// The kind of event.
    pub kind: TestEventKind,
}

/// The kind of a [`TestEvent`].
#[derive(Clone, Debug)]
pub enum TestEventKind {
    /// The run started. Always the first event; in `--list` mode it is
    /// followed directly by `RunFinished`.
    RunStarted {
        /// The resolved configuration.
        config: Arc<Config>,
        /// The expanded test list (including the suite tree).
        test_list: Arc<TestList>,
    },

    /// An attempt at a test instance started in a worker.
    TestStarted {
        /// The instance ID.
        instance_id: String,
        /// Retry index, starting at 0.
        retry: usize,
        /// The worker running the attempt.
        worker_index: usize,
    },

    /// A stdio chunk arrived from a worker.
    Stdio {
        /// Which stream.
        kind: StdioKind,
        /// The instance the chunk is attributed to, if any.
        instance_id: Option<String>,
        /// The chunk.
        chunk: OutputChunk,
    },

    /// An attempt at a test instance finished.
    TestFinished {
        /// The instance ID.
        instance_id: String,
        /// The sealed result.
        result: TestResult,
        /// True when a further retry of the same instance will follow.
        will_retry: bool,
        /// Run statistics so far.
        current_stats: RunStats,
    },

    /// An error not attributable to a single test.
    Error {
        /// The serialized error.
        error: ReportError,
    },

    /// The run was asked to cancel; remaining instances will be skipped.
    RunCancelRequested {
        /// Why.
        reason: CancelReason,
        /// Instances still running.
        running: usize,
    },

    /// The run finished.
    RunFinished {
        /// When the run started.
        start_time: DateTime<Local>,
        /// Total elapsed time.
        elapsed: Duration,
        /// Final statistics.
        run_stats: RunStats,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ExpectedStatus::Passed, TestStatus::Passed, true)]
    #[test_case(ExpectedStatus::Passed, TestStatus::Failed, false)]
    #[test_case(ExpectedStatus::Passed, TestStatus::Skipped, true)]
    #[test_case(ExpectedStatus::Failed, TestStatus::Failed, true)]
    #[test_case(ExpectedStatus::Failed, TestStatus::Passed, false)]
    #[test_case(ExpectedStatus::Failed, TestStatus::TimedOut, false)]
    #[test_case(ExpectedStatus::Skipped, TestStatus::Skipped, true)]
    #[test_case(ExpectedStatus::Skipped, TestStatus::Passed, false)]
    fn expected_status_matching(expected: ExpectedStatus, actual: TestStatus, ok: bool) {
        assert_eq!(expected.matches(actual), ok);
    }

    #[test]
    fn final_status_rules() {
        let mut stats = RunStats::default();
        assert_eq!(stats.final_status(), FinalStatus::Passed);

        stats.flaky = 1;
        assert_eq!(stats.final_status(), FinalStatus::Passed);

        stats.failed = 1;
        assert_eq!(stats.final_status(), FinalStatus::Failed);

        let cancelled = RunStats {
            cancel_reason: Some(CancelReason::GlobalTimeout),
            ..RunStats::default()
        };
        assert_eq!(cancelled.final_status(), FinalStatus::Failed);
    }
}

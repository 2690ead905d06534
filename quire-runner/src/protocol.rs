// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller⇄worker message protocol.
//!
//! Messages are newline-delimited JSON. The controller writes
//! [`ControllerMessage`]s to the worker's stdin; the worker answers with
//! [`WorkerMessage`]s on its original stdout (user writes to stdout/stderr
//! are intercepted and forwarded as [`WorkerMessage::Stdio`] chunks).

use crate::reporter::events::{StdioKind, TestResult};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use quire_metadata::{OutputChunk, ReportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A stable identifier for one test instance:
/// `hash(file, title path, variation, project tag, repeat index)`.
pub type InstanceId = String;

/// The per-worker slice of resolved configuration.
///
/// Workers re-register the session (code-valued config included) on their
/// own; this slice carries only the data the controller resolved from the
/// file and the command line, so both processes agree on it without the
/// worker re-reading `quire.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigSlice {
    /// This worker's index, 0-based.
    pub worker_index: usize,

    /// The worker-hash equivalence key this worker serves.
    pub worker_hash: u64,

    /// The project to select from the worker's own config builder.
    pub project_name: String,

    /// The project's tag, if any.
    pub project_tag: Option<String>,

    /// Effective per-test timeout.
    #[serde(with = "crate::helpers::duration_millis")]
    pub timeout: Duration,

    /// Root directory test files are relative to.
    pub test_dir: Utf8PathBuf,

    /// Root of per-test output directories.
    pub output_dir: Utf8PathBuf,

    /// Root of the snapshot tree.
    pub snapshot_dir: Utf8PathBuf,

    /// Whether snapshot writes are allowed.
    pub update_snapshots: bool,

    /// The worker-scoped parameter variation shared by every test this
    /// worker runs.
    pub variation: IndexMap<String, serde_json::Value>,

    /// The repeat index shared by every test this worker runs.
    pub repeat_index: usize,

    /// The value returned by global setup, if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_setup_result: Option<serde_json::Value>,
}

/// One test to run, addressed structurally so the worker can find it in its
/// own registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunTestSpec {
    /// The instance ID; echoed back in `TestBegin`/`TestEnd`.
    pub id: InstanceId,

    /// Repo-relative test file.
    pub file: Utf8PathBuf,

    /// Titles of the enclosing suites, outermost first.
    pub suite_path: Vec<String>,

    /// The test title.
    pub title: String,

    /// Retry index for this attempt.
    pub retry: usize,

    /// Per-test timeout (project and modifier adjustments come later, in
    /// the worker).
    #[serde(with = "crate::helpers::duration_millis")]
    pub timeout: Duration,

    /// The status the runner expects.
    pub expected_status: crate::reporter::events::ExpectedStatus,

    /// True if the test is marked flaky.
    pub flaky: bool,

    /// Tags for this instance.
    pub tags: Vec<String>,
}

/// Controller→worker messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControllerMessage {
    /// Run these tests serially, in order.
    Run {
        /// The config slice for this worker. Identical across `Run`
        /// messages sent to one worker; workers reject a changed hash.
        config: Box<ConfigSlice>,
        /// The tests to run.
        tests: Vec<RunTestSpec>,
    },
    /// Tear down worker fixtures and exit cleanly.
    Stop,
}

/// Worker→controller messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// An attempt started.
    TestBegin {
        /// The instance.
        id: InstanceId,
    },

    /// An attempt finished; the result is sealed.
    TestEnd {
        /// The instance.
        id: InstanceId,
        /// The sealed result.
        result: TestResult,
    },

    /// A stdio chunk, attributed to the currently-running test if any.
    Stdio {
        /// Which stream.
        stream: StdioKind,
        /// The test the chunk belongs to.
        #[serde(skip_serializing_if = "Option::is_none")]
        test: Option<InstanceId>,
        /// The chunk: text, or base64 for binary writes.
        chunk: OutputChunk,
    },

    /// A worker-level error: fixture teardown failure, unhandled panic
    /// outside a test.
    WorkerError {
        /// The serialized error.
        error: ReportError,
    },

    /// The current `Run` batch is complete.
    Done,
}

/// Encodes a message as one NDJSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one NDJSON line.
pub fn decode_line<T: for<'de> Deserialize<'de>>(
    line: &str,
) -> Result<T, crate::errors::ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|source| crate::errors::ProtocolError::Malformed {
        line: line.to_owned(),
        source,
    })
}

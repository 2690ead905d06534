// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The JSON report schema.
//!
//! A [`RunReport`] is the root object written by the JSON reporter. The tree
//! mirrors the suite structure discovered at load time: files contain suites,
//! suites contain specs, and each spec carries one test entry per project
//! (with one result entry per attempt).

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The root of the JSON report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// The resolved configuration the run was started with.
    pub config: ReportConfig,

    /// Errors not attributable to a single test: load errors, worker errors,
    /// global setup failures.
    pub errors: Vec<ReportError>,

    /// One entry per test file.
    pub suites: Vec<SuiteReport>,
}

/// The subset of the configuration echoed into the report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    /// Root directory test files are relative to.
    pub test_dir: Utf8PathBuf,

    /// Root of the per-test output directories.
    pub output_dir: Utf8PathBuf,

    /// Per-test timeout in milliseconds.
    pub timeout_ms: u64,

    /// Global wall-clock bound in milliseconds, if one was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_timeout_ms: Option<u64>,

    /// Default retry count.
    pub retries: usize,

    /// Number of worker processes.
    pub workers: usize,

    /// Repeat count for every test.
    pub repeat_each: usize,

    /// Names of the projects that were expanded.
    pub projects: Vec<String>,
}

/// A suite node: either a file root or a nested `describe` group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    /// Suite title. Empty for file roots.
    pub title: String,

    /// Repo-relative file the suite was declared in.
    pub file: Utf8PathBuf,

    /// Declaration location, absent for file roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<ReportLocation>,

    /// Nested suites.
    pub suites: Vec<SuiteReport>,

    /// Specs declared directly in this suite.
    pub specs: Vec<SpecReport>,
}

/// A single test declaration (one `test(...)` call), across all projects and
/// variations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecReport {
    /// The test title.
    pub title: String,

    /// Repo-relative file the test was declared in.
    pub file: Utf8PathBuf,

    /// Declaration line.
    pub line: u32,

    /// Declaration column.
    pub column: u32,

    /// True if every instance of this spec reached its expected status.
    pub ok: bool,

    /// One entry per (project, variation, repeat) instance.
    pub tests: Vec<TestReport>,
}

/// One executed instance of a spec.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    /// The project this instance ran under.
    pub project_name: String,

    /// Tags from the declaration and the project.
    pub tags: Vec<String>,

    /// The parameter variation for this instance.
    pub parameters: BTreeMap<String, Value>,

    /// Annotations recorded at declaration or run time.
    pub annotations: Vec<ReportAnnotation>,

    /// The status the runner expected this instance to reach.
    pub expected_status: ReportStatus,

    /// One entry per attempt, in retry order.
    pub results: Vec<ResultReport>,
}

/// The sealed result of a single attempt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    /// Index of the worker that ran the attempt.
    pub worker_index: usize,

    /// Retry number, starting at 0.
    pub retry: usize,

    /// The status the attempt reached.
    pub status: ReportStatus,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,

    /// The error that failed the attempt, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,

    /// Captured stdout chunks, in write order.
    pub stdout: Vec<OutputChunk>,

    /// Captured stderr chunks, in write order.
    pub stderr: Vec<OutputChunk>,

    /// Attachments registered through `TestInfo`.
    pub attachments: Vec<ReportAttachment>,

    /// The user-writable data bag, sealed with the result.
    pub data: BTreeMap<String, Value>,
}

/// A captured stdio chunk: UTF-8 text, or base64-encoded bytes for binary
/// writes.
///
/// Serializes as `{"text": ...}` or `{"buffer": ...}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutputChunk {
    /// A text write.
    Text {
        /// The written text.
        text: String,
    },
    /// A binary write, base64-encoded.
    Buffer {
        /// The base64-encoded bytes.
        buffer: String,
    },
}

/// A serialized error with an optional stack and source location.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportError {
    /// Human-readable message.
    pub message: String,

    /// Captured stack or backtrace, if available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Repo-relative location the error is attributed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<ReportLocation>,

    /// Structured payload carried by the error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A source location in a test file.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportLocation {
    /// Repo-relative file.
    pub file: Utf8PathBuf,

    /// 1-based line.
    pub line: u32,

    /// 1-based column.
    pub column: u32,
}

/// A `{type, description}` annotation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportAnnotation {
    /// The annotation type, e.g. `skip` or `fixme`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Optional human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A file attached to a test result.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportAttachment {
    /// Attachment name.
    pub name: String,

    /// Path to the attachment on disk, if written out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,

    /// MIME content type.
    pub content_type: String,
}

/// Test statuses as they appear in reports.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReportStatus {
    /// The test passed.
    #[default]
    Passed,
    /// The test failed.
    Failed,
    /// The test hit its wall-clock timeout.
    TimedOut,
    /// The test was skipped.
    Skipped,
}

impl ReportStatus {
    /// Returns the canonical lowercase name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timedOut",
            Self::Skipped => "skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ReportStatus::Passed, "\"passed\"")]
    #[test_case(ReportStatus::TimedOut, "\"timedOut\"")]
    #[test_case(ReportStatus::Skipped, "\"skipped\"")]
    fn status_serialization(status: ReportStatus, expected: &str) {
        assert_eq!(serde_json::to_string(&status).unwrap(), expected);
    }

    #[test]
    fn output_chunk_round_trip() {
        let chunks = vec![
            OutputChunk::Text {
                text: "hello\n".to_owned(),
            },
            OutputChunk::Buffer {
                buffer: "AAEC".to_owned(),
            },
        ];
        let json = serde_json::to_string(&chunks).unwrap();
        assert_eq!(json, r#"[{"text":"hello\n"},{"buffer":"AAEC"}]"#);
        let parsed: Vec<OutputChunk> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, chunks);
    }
}

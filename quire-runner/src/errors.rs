// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by quire.

use crate::{fixtures::FixtureScope, helpers::SourceLocation};
use camino::Utf8PathBuf;
use quire_metadata::{ReportError, ReportLocation};
use std::fmt;
use thiserror::Error;

/// The error type user-supplied bodies (fixtures, hooks, tests, global
/// setup/teardown) may return.
pub type BodyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for user-supplied bodies.
pub type BodyResult = Result<(), BodyError>;

/// An error raised while assembling or resolving the fixture graph.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// A consumer asked for a fixture name that isn't defined anywhere.
    #[error("unknown fixture `{name}`, requested by `{requester}` at {location}")]
    UnknownFixture {
        /// The missing name.
        name: String,
        /// The test, hook, or fixture that asked for it.
        requester: String,
        /// Where the requester was registered.
        location: SourceLocation,
    },

    /// A body asked at run time for a name it did not declare in its
    /// dependency list.
    #[error(
        "fixture value `{name}` was requested by `{requester}` at {location}, \
         but is not in its declared dependencies"
    )]
    UndeclaredDependency {
        /// The requested name.
        name: String,
        /// The consumer that asked for it.
        requester: String,
        /// Where the consumer was registered.
        location: SourceLocation,
    },

    /// The dependency graph contains a cycle.
    #[error("fixture dependency cycle: {}", path.join(" -> "))]
    DependencyCycle {
        /// The names along the cycle, first repeated at the end.
        path: Vec<String>,
    },

    /// A worker-scoped fixture depends on a test-scoped fixture.
    #[error(
        "worker-scoped fixture `{worker_fixture}` depends on test-scoped fixture `{test_fixture}`"
    )]
    WorkerOnTestDep {
        /// The worker-scoped fixture.
        worker_fixture: String,
        /// The test-scoped dependency.
        test_fixture: String,
    },

    /// The same name was defined twice.
    #[error("fixture `{name}` is already defined at {first}; second definition at {second}")]
    DuplicateFixture {
        /// The duplicated name.
        name: String,
        /// First registration site.
        first: SourceLocation,
        /// Second registration site.
        second: SourceLocation,
    },

    /// An override was registered for a name with no base definition.
    #[error("override of fixture `{name}` at {location} has no base definition")]
    OverrideWithoutBase {
        /// The overridden name.
        name: String,
        /// The override's registration site.
        location: SourceLocation,
    },

    /// An override changed the fixture's scope.
    #[error(
        "override of fixture `{name}` changes its scope from {base_scope} to {override_scope}"
    )]
    ScopeMismatchOnOverride {
        /// The overridden name.
        name: String,
        /// Scope of the base definition.
        base_scope: FixtureScope,
        /// Scope declared on the override.
        override_scope: FixtureScope,
    },

    /// A consumer downcast a fixture value to the wrong type.
    #[error("fixture `{name}` does not hold a value of type `{requested}`")]
    TypeMismatch {
        /// The fixture name.
        name: String,
        /// The requested Rust type.
        requested: &'static str,
    },

    /// A fixture body failed before supplying a value.
    #[error("fixture `{name}` failed during setup")]
    SetupFailed {
        /// The fixture name.
        name: String,
        /// The body's error.
        #[source]
        source: BodyError,
    },

    /// A fixture body returned without ever calling `supply`.
    #[error("fixture `{name}` returned without supplying a value")]
    NeverSupplied {
        /// The fixture name.
        name: String,
    },

    /// A fixture body panicked.
    #[error("fixture `{name}` panicked: {message}")]
    Panicked {
        /// The fixture name.
        name: String,
        /// The panic payload, rendered.
        message: String,
    },

    /// A parameter fixture has no configured value and no default.
    #[error("parameter `{name}` has no value; pass --param {name}=... or set a default")]
    MissingParameterValue {
        /// The parameter name.
        name: String,
    },
}

/// An error loading or validating the configuration. Fatal: the process
/// exits with the setup error code.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or parsed.
    #[error("failed to load config at `{path}`")]
    Load {
        /// The config file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: config::ConfigError,
    },

    /// No config file was found searching upward from the working directory.
    #[error("no quire.toml found searching upward from `{start}`")]
    NotFound {
        /// The directory the search started from.
        start: Utf8PathBuf,
    },

    /// An option value is out of range or malformed.
    #[error("invalid value for `{option}`: {message}")]
    InvalidOption {
        /// The option name.
        option: String,
        /// What was wrong with it.
        message: String,
    },

    /// `--param` named a parameter that was never declared.
    #[error("unknown parameter `{name}` (declared parameters: {})", known.join(", "))]
    UnknownParameter {
        /// The unknown name.
        name: String,
        /// Names that are declared.
        known: Vec<String>,
    },

    /// A project inherits from itself, directly or transitively.
    #[error("project definitions form a cycle involving `{project}`")]
    CyclicProjects {
        /// A project on the cycle.
        project: String,
    },

    /// `--forbid-only` was passed and an `only` marker survived load.
    #[error("`only` marker found at {location} with --forbid-only set")]
    ForbidOnly {
        /// Where the marker was declared.
        location: SourceLocation,
    },
}

/// An error raised while loading a single test file. Other files continue to
/// load; the error is recorded at file level in the report.
#[derive(Debug, Error)]
#[error("error loading test file `{file}`: {message}")]
pub struct LoadError {
    /// The file that failed to load.
    pub file: Utf8PathBuf,
    /// Rendered failure message.
    pub message: String,
    /// Location of the offending call, when known.
    pub location: Option<SourceLocation>,
}

/// A worker protocol failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be serialized or deserialized.
    #[error("malformed worker message: {line}")]
    Malformed {
        /// The offending line.
        line: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The transport failed.
    #[error("worker channel I/O error")]
    Io(#[from] std::io::Error),

    /// The peer went away mid-conversation.
    #[error("worker channel closed unexpectedly")]
    Closed,
}

/// An error attributed to a worker process as a whole.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker process could not be spawned.
    #[error("failed to spawn worker process")]
    Spawn(#[source] std::io::Error),

    /// The worker exited without sending `done`.
    #[error("worker {worker_index} exited unexpectedly{}", render_exit_code(.exit_code))]
    Crashed {
        /// The worker's index.
        worker_index: usize,
        /// The exit code, if one was observed.
        exit_code: Option<i32>,
    },

    /// The worker sent something the controller could not understand.
    #[error("worker {worker_index} protocol error")]
    Protocol {
        /// The worker's index.
        worker_index: usize,
        /// The protocol failure.
        #[source]
        source: ProtocolError,
    },

    /// The worker reported an error of its own (fixture teardown, unhandled
    /// panic outside a test).
    #[error("worker {worker_index} reported: {message}")]
    Reported {
        /// The worker's index.
        worker_index: usize,
        /// The reported message.
        message: String,
    },
}

fn render_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

/// An error building the test runner itself.
#[derive(Debug, Error)]
pub enum RunnerBuildError {
    /// Creation of the tokio runtime failed.
    #[error("failed to create tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The current executable could not be determined for worker re-exec.
    #[error("failed to determine current executable for worker spawn")]
    CurrentExe(#[source] std::io::Error),
}

/// A list of errors that occurred while tearing down a scope.
///
/// Teardown never stops at the first failure; every error is collected and
/// reported together.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<BodyError>,
}

impl ErrorList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error.
    pub fn push(&mut self, error: BodyError) {
        self.errors.push(error);
    }

    /// True if no errors were recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Iterates over the recorded errors.
    pub fn iter(&self) -> impl Iterator<Item = &BodyError> {
        self.errors.iter()
    }

    /// Returns `Ok(())` if empty, `Err(self)` otherwise.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                writeln!(f, "{n} errors occurred during teardown:")?;
                for error in &self.errors {
                    writeln!(f, "  - {error}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ErrorList {}

/// Converts any error into the serialized `{message, stack, location}` form
/// used on the wire and in reports.
pub fn serialize_error(error: &(dyn std::error::Error + 'static)) -> ReportError {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str("\n  caused by: ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    ReportError {
        message,
        stack: None,
        location: None,
        value: None,
    }
}

/// Attaches a location to a serialized error.
pub fn serialize_error_at(
    error: &(dyn std::error::Error + 'static),
    location: &SourceLocation,
) -> ReportError {
    let mut report = serialize_error(error);
    report.location = Some(ReportLocation {
        file: location.file.clone(),
        line: location.line,
        column: location.column,
    });
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("inner failure")]
    struct Inner;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer(#[source] Inner);

    #[test]
    fn serialize_error_includes_causes() {
        let report = serialize_error(&Outer(Inner));
        assert_eq!(report.message, "outer failure\n  caused by: inner failure");
    }

    #[test]
    fn error_list_display() {
        let mut list = ErrorList::new();
        assert!(list.into_result().is_ok());

        let mut list = ErrorList::new();
        list.push(Box::new(Inner));
        list.push(Box::new(Inner));
        let rendered = list.to_string();
        assert!(rendered.contains("2 errors occurred"));
    }
}

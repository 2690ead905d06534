// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session: everything the user's binary registers before a run.
//!
//! A session bundles the registered test files, the fixture set, declared
//! parameters and their matrices, and the config builder. The controller
//! resolves it once; each worker re-registers the identical session and
//! relies on registration being deterministic.

use crate::{
    config::ConfigBuilder,
    errors::FixtureError,
    fixtures::{FixtureDef, FixtureSet},
    registry::{self, FileCollector, FileSuite},
};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::{fmt, sync::Arc};

type RegisterFn = Arc<dyn Fn(&mut FileCollector) + Send + Sync>;

/// A registered test file: a repo-relative path plus its registration
/// function.
#[derive(Clone)]
pub struct TestFileSpec {
    /// The repo-relative path identifying the file.
    pub path: Utf8PathBuf,
    register: RegisterFn,
}

impl fmt::Debug for TestFileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestFileSpec")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// The full registration state of the user's binary.
#[derive(Default)]
pub struct Session {
    files: Vec<TestFileSpec>,
    fixtures: FixtureSet,
    matrices: IndexMap<String, Vec<serde_json::Value>>,
    config: ConfigBuilder,
}

impl Session {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a test file. `path` identifies the file in reports and on
    /// the command line; `register` declares its suites and tests.
    pub fn test_file(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        register: impl Fn(&mut FileCollector) + Send + Sync + 'static,
    ) -> &mut Self {
        self.files.push(TestFileSpec {
            path: path.into(),
            register: Arc::new(register),
        });
        self
    }

    /// Adds a fixture definition to the session set.
    pub fn fixture(&mut self, def: FixtureDef) -> Result<&mut Self, FixtureError> {
        self.fixtures.extend(def)?;
        Ok(self)
    }

    /// Adds an override layer for an existing fixture.
    pub fn override_fixture(&mut self, def: FixtureDef) -> Result<&mut Self, FixtureError> {
        self.fixtures.override_with(def)?;
        Ok(self)
    }

    /// Declares a parameter: a worker-scoped fixture whose value comes from
    /// the configuration or the command line.
    #[track_caller]
    pub fn parameter(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        default: Option<serde_json::Value>,
    ) -> Result<&mut Self, FixtureError> {
        self.fixtures
            .extend(FixtureDef::parameter(name, description, default))?;
        Ok(self)
    }

    /// Multiplies the test space across the given values of a declared
    /// parameter. The name must refer to a declared parameter.
    pub fn generate_parametrized_tests(
        &mut self,
        name: impl Into<String>,
        values: Vec<serde_json::Value>,
    ) -> &mut Self {
        self.matrices.entry(name.into()).or_default().extend(values);
        self
    }

    /// The config builder for code-valued configuration.
    pub fn config_mut(&mut self) -> &mut ConfigBuilder {
        &mut self.config
    }

    /// The config builder, read-only.
    pub fn config(&self) -> &ConfigBuilder {
        &self.config
    }

    /// The session fixture set.
    pub fn fixtures(&self) -> &FixtureSet {
        &self.fixtures
    }

    /// The declared parameter matrices.
    pub fn matrices(&self) -> &IndexMap<String, Vec<serde_json::Value>> {
        &self.matrices
    }

    /// The registered test files, in registration order.
    pub fn files(&self) -> &[TestFileSpec] {
        &self.files
    }

    /// Loads every registered file into a suite tree. Load errors are
    /// captured per file; other files continue to load.
    pub fn load_files(&self) -> Vec<FileSuite> {
        self.files
            .iter()
            .map(|spec| registry::load_file(spec.path.clone(), spec.register.as_ref()))
            .collect()
    }

    /// The session fixture set with all `define` layers applied.
    pub fn base_fixtures(&self) -> Result<FixtureSet, FixtureError> {
        let mut base = self.fixtures.clone();
        for layer in self.config.defined_fixtures() {
            base = FixtureSet::union(&base, layer)?;
        }
        Ok(base)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("files", &self.files.len())
            .field("matrices", &self.matrices)
            .finish_non_exhaustive()
    }
}

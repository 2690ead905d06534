// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test list construction: expanding the registry across parameter
//! matrices, projects, and `repeat-each` into concrete test instances.
//!
//! Each instance gets a deterministic ID, a hash of `(file, title path,
//! variation, project tag, repeat index)`, so the controller and its
//! workers, which expand the registry independently, agree on identity.

use crate::{
    config::{Config, Project},
    errors::{ConfigError, FixtureError, LoadError},
    fixtures::{AutoFixtures, FixtureRegistry, FixtureSet},
    helpers::SourceLocation,
    protocol::{InstanceId, RunTestSpec},
    registry::{FileSuite, Modifier, ModifierCondition, ModifierKind, Suite, TestCase},
    reporter::events::ExpectedStatus,
    session::Session,
};
use camino::Utf8PathBuf;
use globset::{Glob, GlobSet, GlobSetBuilder};
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use regex::Regex;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// An error building the test list. All of these surface before any test
/// runs.
#[derive(Debug, Error)]
pub enum BuildListError {
    /// Configuration-level problem (unknown parameter, bad glob/regex,
    /// `--forbid-only` violation).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Structural fixture-graph problem (duplicate, cycle, scope rule).
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// One concrete test instance: a test declaration bound to a project, a
/// parameter variation, and a repeat index.
#[derive(Clone, Debug)]
pub struct TestInstance {
    /// Deterministic instance ID.
    pub id: InstanceId,
    /// Repo-relative file.
    pub file: Utf8PathBuf,
    /// Titles of enclosing suites, outermost first.
    pub suite_path: Vec<String>,
    /// The test title.
    pub title: String,
    /// Declaration location.
    pub location: SourceLocation,
    /// The project this instance belongs to.
    pub project_name: String,
    /// The project tag.
    pub project_tag: Option<String>,
    /// The parameter variation.
    pub variation: IndexMap<String, serde_json::Value>,
    /// Repeat index, `0..repeat_each`.
    pub repeat_index: usize,
    /// The worker-equivalence key: instances with equal hashes may share a
    /// worker.
    pub worker_hash: u64,
    /// Base timeout (before `slow` adjustments made in the worker).
    pub timeout: Duration,
    /// Retry budget from the project.
    pub retries: usize,
    /// Statically-known expected status; the worker refines this with
    /// fixture-conditioned modifiers.
    pub expected_status: ExpectedStatus,
    /// Marked flaky: passing on a retry is expected.
    pub flaky: bool,
    /// Tags from the declaration and the project.
    pub tags: Vec<String>,
    /// Set when discovery failed for this instance (unknown fixture); the
    /// scheduler fails it without dispatching.
    pub discovery_error: Option<String>,
}

impl TestInstance {
    /// The full title used for `--grep` matching and human reporters.
    pub fn full_title(&self) -> String {
        let mut parts = vec![self.file.to_string()];
        parts.extend(self.suite_path.iter().cloned());
        parts.push(self.title.clone());
        parts.join(" > ")
    }

    /// Converts to the wire spec for a given retry.
    pub fn to_run_spec(&self, retry: usize) -> RunTestSpec {
        RunTestSpec {
            id: self.id.clone(),
            file: self.file.clone(),
            suite_path: self.suite_path.clone(),
            title: self.title.clone(),
            retry,
            timeout: self.timeout,
            expected_status: self.expected_status,
            flaky: self.flaky,
            tags: self.tags.clone(),
        }
    }
}

/// The expanded list of test instances, plus the loaded suite trees.
#[derive(Debug)]
pub struct TestList {
    /// Loaded files in registration order, including per-file load errors.
    pub files: Vec<FileSuite>,
    /// All instances, in discovery order.
    pub instances: Vec<TestInstance>,
    by_id: HashMap<InstanceId, usize>,
}

impl TestList {
    /// Expands the session's registry against the resolved config.
    pub fn build(session: &Session, config: &Config) -> Result<Self, BuildListError> {
        let base_fixtures = session.base_fixtures()?;
        let known_params = declared_parameters(&base_fixtures);

        // Unrecognized parameter names are rejected at load time.
        for name in session.matrices().keys() {
            if !known_params.contains(name) {
                return Err(ConfigError::UnknownParameter {
                    name: name.clone(),
                    known: known_params.iter().cloned().collect(),
                }
                .into());
            }
        }
        for name in config.params.keys() {
            if !known_params.contains(name) {
                return Err(ConfigError::UnknownParameter {
                    name: name.clone(),
                    known: known_params.iter().cloned().collect(),
                }
                .into());
            }
        }

        let files = session.load_files();

        if config.forbid_only {
            for file in &files {
                if let Some(location) = file.suite.first_only_location() {
                    return Err(ConfigError::ForbidOnly { location }.into());
                }
            }
        }

        let filters = Filters::new(config)?;

        // One validated fixture registry per project.
        let mut registries = Vec::with_capacity(config.projects.len());
        for project in &config.projects {
            let set = FixtureSet::union(&base_fixtures, &project.fixtures)?;
            registries.push(FixtureRegistry::build(set)?);
        }

        let mut instances = Vec::new();
        for file in &files {
            if !filters.file_selected(&file.file) {
                continue;
            }
            file.suite.walk_tests(|chain, test| {
                for (project, registry) in config.projects.iter().zip(&registries) {
                    expand_test(
                        session, config, project, registry, file, chain, test, &filters,
                        &mut instances,
                    );
                }
            });
        }

        let by_id = instances
            .iter()
            .enumerate()
            .map(|(index, instance)| (instance.id.clone(), index))
            .collect();

        Ok(Self {
            files,
            instances,
            by_id,
        })
    }

    /// Number of instances that will run.
    pub fn run_count(&self) -> usize {
        self.instances.len()
    }

    /// Load errors across all files.
    pub fn load_errors(&self) -> impl Iterator<Item = &LoadError> {
        self.files.iter().filter_map(|file| file.error.as_ref())
    }

    /// Looks up an instance by ID.
    pub fn instance(&self, id: &str) -> Option<&TestInstance> {
        self.by_id.get(id).map(|&index| &self.instances[index])
    }

    /// Groups instance indices by worker hash, preserving discovery order
    /// both across and within groups.
    pub fn worker_groups(&self) -> IndexMap<u64, Vec<usize>> {
        let mut groups: IndexMap<u64, Vec<usize>> = IndexMap::new();
        for (index, instance) in self.instances.iter().enumerate() {
            groups.entry(instance.worker_hash).or_default().push(index);
        }
        groups
    }
}

fn declared_parameters(set: &FixtureSet) -> IndexSet<String> {
    set.entries
        .iter()
        .filter(|(_, chain)| {
            chain
                .base
                .as_ref()
                .is_some_and(|def| def.is_parameter())
        })
        .map(|(name, _)| name.clone())
        .collect()
}

struct Filters {
    grep: Option<Regex>,
    grep_invert: Option<Regex>,
    test_match: Option<GlobSet>,
    test_ignore: Option<GlobSet>,
}

impl Filters {
    fn new(config: &Config) -> Result<Self, ConfigError> {
        let compile_regex = |option: &str, pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|err| ConfigError::InvalidOption {
                    option: option.to_owned(),
                    message: err.to_string(),
                })
        };
        let compile_globs = |option: &str, patterns: &[String]| {
            if patterns.is_empty() {
                return Ok(None);
            }
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                let glob = Glob::new(pattern).map_err(|err| ConfigError::InvalidOption {
                    option: option.to_owned(),
                    message: err.to_string(),
                })?;
                builder.add(glob);
            }
            builder
                .build()
                .map(Some)
                .map_err(|err| ConfigError::InvalidOption {
                    option: option.to_owned(),
                    message: err.to_string(),
                })
        };

        Ok(Self {
            grep: compile_regex("grep", &config.grep)?,
            grep_invert: compile_regex("grep-invert", &config.grep_invert)?,
            test_match: compile_globs("test-match", &config.test_match)?,
            test_ignore: compile_globs("test-ignore", &config.test_ignore)?,
        })
    }

    fn file_selected(&self, file: &Utf8PathBuf) -> bool {
        if let Some(matcher) = &self.test_match {
            if !matcher.is_match(file.as_std_path()) {
                return false;
            }
        }
        if let Some(ignore) = &self.test_ignore {
            if ignore.is_match(file.as_std_path()) {
                return false;
            }
        }
        true
    }

    fn title_selected(&self, full_title: &str) -> bool {
        if let Some(grep) = &self.grep {
            if !grep.is_match(full_title) {
                return false;
            }
        }
        if let Some(invert) = &self.grep_invert {
            if invert.is_match(full_title) {
                return false;
            }
        }
        true
    }
}

#[expect(clippy::too_many_arguments)]
fn expand_test(
    session: &Session,
    config: &Config,
    project: &Project,
    registry: &FixtureRegistry,
    file: &FileSuite,
    chain: &[&Suite],
    test: &TestCase,
    filters: &Filters,
    instances: &mut Vec<TestInstance>,
) {
    let suite_path: Vec<String> = chain
        .iter()
        .filter(|suite| !suite.title.is_empty())
        .map(|suite| suite.title.clone())
        .collect();

    // Everything this test pulls in: its own deps, hook deps along the
    // suite chain, and modifier-condition deps.
    let mut roots: IndexSet<String> = IndexSet::new();
    roots.extend(test.deps.iter().cloned());
    for suite in chain {
        for hook in &suite.hooks {
            roots.extend(hook.deps.iter().cloned());
        }
        for modifier in &suite.modifiers {
            roots.extend(modifier.deps.iter().cloned());
        }
    }
    for modifier in &test.modifiers {
        roots.extend(modifier.deps.iter().cloned());
    }
    let roots: Vec<String> = roots.into_iter().collect();

    let closure = registry.closure_names(&roots, AutoFixtures::All, &test.title, &test.location);
    let (closure, discovery_error) = match closure {
        Ok(closure) => (closure, None),
        Err(err) => (IndexSet::new(), Some(err.to_string())),
    };

    // Parameter axes: declared parameters in this test's closure, with the
    // project's fixed values taking precedence over CLI/file values, which
    // take precedence over registered matrices, then declaration defaults.
    let mut axes: Vec<Vec<(String, serde_json::Value)>> = Vec::new();
    for def in registry.parameters() {
        let name = def.name().to_owned();
        if !closure.contains(&name) {
            continue;
        }
        let values: Vec<serde_json::Value> = if let Some(value) = project.params.get(&name) {
            vec![value.clone()]
        } else if let Some(values) = config.params.get(&name) {
            values.clone()
        } else if let Some(values) = session.matrices().get(&name) {
            values.clone()
        } else if let Some(default) = def.default_value() {
            vec![default.clone()]
        } else {
            continue;
        };
        axes.push(values.into_iter().map(|v| (name.clone(), v)).collect());
    }

    let variations: Vec<IndexMap<String, serde_json::Value>> = if axes.is_empty() {
        vec![IndexMap::new()]
    } else {
        axes.into_iter()
            .multi_cartesian_product()
            .map(|combo| combo.into_iter().collect())
            .collect()
    };

    let (expected_status, flaky) = static_modifier_pass(chain, test);
    let timeout = test.timeout.unwrap_or(project.timeout);
    let mut tags = test.tags.clone();
    tags.extend(project.tags.iter().cloned());

    for variation in variations {
        for repeat_index in 0..config.repeat_each {
            let id = instance_id(
                &file.file,
                &suite_path,
                &test.title,
                &variation,
                project.tag.as_deref(),
                &project.name,
                repeat_index,
            );
            let worker_hash = worker_hash(&project.name, &variation, repeat_index);
            let instance = TestInstance {
                id,
                file: file.file.clone(),
                suite_path: suite_path.clone(),
                title: test.title.clone(),
                location: test.location.clone(),
                project_name: project.name.clone(),
                project_tag: project.tag.clone(),
                variation: variation.clone(),
                repeat_index,
                worker_hash,
                timeout,
                retries: project.retries,
                expected_status,
                flaky,
                tags: tags.clone(),
                discovery_error: discovery_error.clone(),
            };
            if filters.title_selected(&instance.full_title()) {
                instances.push(instance);
            }
        }
    }
}

/// Applies declaration-time-decidable modifiers. Fixture-conditioned
/// modifiers are re-evaluated in the worker; this pass only fixes what is
/// statically known, for `--list` and scheduling.
fn static_modifier_pass(chain: &[&Suite], test: &TestCase) -> (ExpectedStatus, bool) {
    let mut expected = ExpectedStatus::Passed;
    let mut flaky = false;
    let all_modifiers = chain
        .iter()
        .flat_map(|suite| suite.modifiers.iter())
        .chain(test.modifiers.iter());
    for modifier in all_modifiers {
        if !statically_active(modifier) {
            continue;
        }
        match modifier.kind {
            ModifierKind::Skip | ModifierKind::Fixme => expected = ExpectedStatus::Skipped,
            ModifierKind::Fail => expected = ExpectedStatus::Failed,
            ModifierKind::Flaky => flaky = true,
            // Slow affects the timeout, applied in the worker.
            ModifierKind::Slow => {}
        }
    }
    (expected, flaky)
}

fn statically_active(modifier: &Modifier) -> bool {
    match &modifier.condition {
        ModifierCondition::Always => true,
        ModifierCondition::Value(value) => *value,
        ModifierCondition::Fixtures(_) => false,
    }
}

fn instance_id(
    file: &Utf8PathBuf,
    suite_path: &[String],
    title: &str,
    variation: &IndexMap<String, serde_json::Value>,
    project_tag: Option<&str>,
    project_name: &str,
    repeat_index: usize,
) -> InstanceId {
    let variation_json =
        serde_json::to_string(variation).expect("JSON values always serialize");
    let input = format!(
        "{file}\u{1f}{}\u{1f}{title}\u{1f}{variation_json}\u{1f}{}\u{1f}{project_name}\u{1f}{repeat_index}",
        suite_path.join("\u{1f}"),
        project_tag.unwrap_or(""),
    );
    format!("{:016x}", xxh3_64(input.as_bytes()))
}

/// The worker-equivalence key: same project, same worker-scoped parameter
/// values, same repeat index. Parameters are worker-scoped by construction,
/// so the whole variation participates.
fn worker_hash(
    project_name: &str,
    variation: &IndexMap<String, serde_json::Value>,
    repeat_index: usize,
) -> u64 {
    let variation_json =
        serde_json::to_string(variation).expect("JSON values always serialize");
    let input = format!("{project_name}\u{1f}{variation_json}\u{1f}{repeat_index}");
    xxh3_64(input.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{CliOverrides, ConfigBuilder},
        context::TestContext,
        registry::TestOptions,
    };
    use pretty_assertions::assert_eq;

    fn ok_body() -> impl crate::registry::TestBody {
        |_cx: TestContext| async move { Ok(()) }
    }

    fn basic_session() -> Session {
        let mut session = Session::new();
        session
            .parameter("foo", "first axis", None)
            .unwrap()
            .parameter("bar", "second axis", None)
            .unwrap();
        session.generate_parametrized_tests(
            "foo",
            vec![serde_json::json!("a"), serde_json::json!("b")],
        );
        session.generate_parametrized_tests(
            "bar",
            vec![serde_json::json!("x"), serde_json::json!("y")],
        );
        session.test_file("tests/matrix.rs", |c| {
            c.test_with(
                "combo",
                TestOptions::new().deps(&["foo", "bar"]),
                |_cx: TestContext| async move { Ok(()) },
            );
        });
        session
    }

    fn resolve_config(session: &Session) -> crate::config::Config {
        session.config().resolve(&CliOverrides::default()).unwrap()
    }

    #[test]
    fn parameter_matrix_multiplies_instances() {
        let session = basic_session();
        let config = resolve_config(&session);
        let list = TestList::build(&session, &config).unwrap();

        assert_eq!(list.run_count(), 4);
        let variations: Vec<String> = list
            .instances
            .iter()
            .map(|i| {
                format!(
                    "{},{}",
                    i.variation["foo"].as_str().unwrap(),
                    i.variation["bar"].as_str().unwrap()
                )
            })
            .collect();
        assert_eq!(variations, vec!["a,x", "a,y", "b,x", "b,y"]);
    }

    #[test]
    fn instances_have_distinct_stable_ids() {
        let session = basic_session();
        let config = resolve_config(&session);
        let first = TestList::build(&session, &config).unwrap();
        let second = TestList::build(&session, &config).unwrap();

        let ids: IndexSet<_> = first.instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids.len(), 4);
        let again: Vec<_> = second.instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids.iter().cloned().collect::<Vec<_>>(), again);
    }

    #[test]
    fn worker_hash_separates_parameter_values() {
        let session = basic_session();
        let config = resolve_config(&session);
        let list = TestList::build(&session, &config).unwrap();

        let groups = list.worker_groups();
        // Four distinct worker-scoped variations -> four groups.
        assert_eq!(groups.len(), 4);
    }

    #[test]
    fn tests_without_parameters_share_a_worker_hash() {
        let mut session = Session::new();
        session.test_file("tests/plain.rs", |c| {
            c.test("one", |_cx: TestContext| async move { Ok(()) });
            c.test("two", |_cx: TestContext| async move { Ok(()) });
        });
        let config = resolve_config(&session);
        let list = TestList::build(&session, &config).unwrap();

        assert_eq!(list.run_count(), 2);
        assert_eq!(list.worker_groups().len(), 1);
    }

    #[test]
    fn unknown_matrix_parameter_is_rejected() {
        let mut session = Session::new();
        session.generate_parametrized_tests("ghost", vec![serde_json::json!(1)]);
        session.test_file("tests/plain.rs", |c| {
            c.test("one", |_cx: TestContext| async move { Ok(()) });
        });
        let config = resolve_config(&session);
        let err = TestList::build(&session, &config).unwrap_err();
        assert!(matches!(
            err,
            BuildListError::Config(ConfigError::UnknownParameter { name, .. }) if name == "ghost"
        ));
    }

    #[test]
    fn unknown_fixture_marks_instance_with_discovery_error() {
        let mut session = Session::new();
        session.test_file("tests/broken.rs", |c| {
            c.test_with(
                "needs ghost",
                TestOptions::new().deps(&["ghost"]),
                |_cx: TestContext| async move { Ok(()) },
            );
        });
        let config = resolve_config(&session);
        let list = TestList::build(&session, &config).unwrap();
        assert_eq!(list.run_count(), 1);
        let error = list.instances[0].discovery_error.as_ref().unwrap();
        assert!(error.contains("ghost"));
    }

    #[test]
    fn repeat_each_multiplies_and_distinguishes_instances() {
        let mut session = Session::new();
        session.test_file("tests/plain.rs", |c| {
            c.test("one", |_cx: TestContext| async move { Ok(()) });
        });
        let mut overrides = CliOverrides::default();
        overrides.repeat_each = Some(3);
        let config = session.config().resolve(&overrides).unwrap();
        let list = TestList::build(&session, &config).unwrap();

        assert_eq!(list.run_count(), 3);
        let ids: IndexSet<_> = list.instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids.len(), 3);
        // Different repeat indices never share a worker.
        assert_eq!(list.worker_groups().len(), 3);
    }

    #[test]
    fn grep_filters_by_full_title() {
        let mut session = Session::new();
        session.test_file("tests/auth.rs", |c| {
            c.describe("login", |c| {
                c.test("succeeds", ok_body());
                c.test("fails politely", ok_body());
            });
        });
        let mut overrides = CliOverrides::default();
        overrides.grep = Some("login > succeeds".to_owned());
        let config = session.config().resolve(&overrides).unwrap();
        let list = TestList::build(&session, &config).unwrap();
        assert_eq!(list.run_count(), 1);
        assert_eq!(list.instances[0].title, "succeeds");
    }

    #[test]
    fn skip_modifier_sets_expected_status() {
        let mut session = Session::new();
        session.test_file("tests/skipped.rs", |c| {
            c.describe("group", |c| {
                c.skip("not ready");
                c.test("inside", ok_body());
            });
        });
        let config = resolve_config(&session);
        let list = TestList::build(&session, &config).unwrap();
        assert_eq!(list.instances[0].expected_status, ExpectedStatus::Skipped);
    }

    #[test]
    fn projects_expand_independently() {
        let mut session = basic_session();
        session.config_mut().run_with(
            FixtureSet::new(),
            crate::config::ProjectOptions::named("alpha"),
        );
        session.config_mut().run_with(
            FixtureSet::new(),
            crate::config::ProjectOptions::named("beta").with_param(
                "foo",
                serde_json::json!("fixed"),
            ),
        );
        let config = resolve_config(&session);
        let list = TestList::build(&session, &config).unwrap();

        // alpha: 2x2 = 4; beta: foo fixed -> 1x2 = 2.
        assert_eq!(list.run_count(), 6);
        let beta_ids: IndexSet<_> = list
            .instances
            .iter()
            .filter(|i| i.project_name == "beta")
            .map(|i| i.id.clone())
            .collect();
        assert_eq!(beta_ids.len(), 2);
    }
}

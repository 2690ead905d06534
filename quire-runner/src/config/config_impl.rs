// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::projects::{Project, ProjectOptions};
use crate::{
    errors::{BodyError, ConfigError},
    fixtures::FixtureSet,
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};

/// The config file name searched for when `--config` is not passed.
pub const CONFIG_FILE_NAME: &str = "quire.toml";

/// Default per-test timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do with per-test output directories once a run finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreserveOutput {
    /// Keep every output directory.
    Always,
    /// Remove every output directory.
    Never,
    /// Keep output only for tests whose final attempt failed. This is also
    /// the behavior when the `CI` environment variable is set.
    #[default]
    FailuresOnly,
}

/// The value of a `globalSetup` hook, handed to workers and exposed on
/// `TestInfo::global_setup_result`.
pub type GlobalSetupResult = serde_json::Value;

type GlobalHook =
    Arc<dyn Fn(&Config) -> BoxFuture<'static, Result<GlobalSetupResult, BodyError>> + Send + Sync>;

/// The data-only shape of `quire.toml`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileConfig {
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    global_timeout: Option<Duration>,
    retries: Option<usize>,
    test_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    test_match: Vec<String>,
    #[serde(default)]
    test_ignore: Vec<String>,
    output_dir: Option<Utf8PathBuf>,
    snapshot_dir: Option<Utf8PathBuf>,
    preserve_output: Option<PreserveOutput>,
    forbid_only: Option<bool>,
    #[serde(default)]
    reporter: Vec<String>,
    workers: Option<usize>,
    repeat_each: Option<usize>,
    max_failures: Option<usize>,
    #[serde(default)]
    params: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    projects: Vec<FileProject>,
}

/// A project declared in `quire.toml`. Code-declared projects can carry
/// fixture sets as well; file projects are data only.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileProject {
    name: String,
    tag: Option<String>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    retries: Option<usize>,
    #[serde(default)]
    params: IndexMap<String, serde_json::Value>,
}

/// The fully resolved configuration for a run.
#[derive(Clone)]
pub struct Config {
    /// Per-test timeout.
    pub timeout: Duration,
    /// Wall-clock bound for the entire run.
    pub global_timeout: Option<Duration>,
    /// Default retry count for failing tests.
    pub retries: usize,
    /// Root directory test files are registered relative to.
    pub test_dir: Utf8PathBuf,
    /// Globs selecting which registered files run.
    pub test_match: Vec<String>,
    /// Globs excluding registered files.
    pub test_ignore: Vec<String>,
    /// Root of per-test output directories.
    pub output_dir: Utf8PathBuf,
    /// Root of the snapshot tree; defaults to `<test_dir>/__snapshots__`.
    pub snapshot_dir: Option<Utf8PathBuf>,
    /// Output directory retention policy.
    pub preserve_output: PreserveOutput,
    /// Fail the run if an `only` marker survives load.
    pub forbid_only: bool,
    /// Reporter names, in order.
    pub reporter: Vec<String>,
    /// Maximum number of concurrent worker processes.
    pub workers: usize,
    /// Number of times to run every test.
    pub repeat_each: usize,
    /// Stop dispatching after this many unexpected failures.
    pub max_failures: Option<usize>,
    /// Only run tests whose full title matches.
    pub grep: Option<String>,
    /// Skip tests whose full title matches.
    pub grep_invert: Option<String>,
    /// Allow snapshot writes.
    pub update_snapshots: bool,
    /// Discovery-only mode: report the suite tree without running.
    pub list_only: bool,
    /// Parameter values from file and `--param` flags. Repeated `--param`
    /// flags produce multiple matrix entries.
    pub params: IndexMap<String, Vec<serde_json::Value>>,
    /// The projects to expand. Never empty: a nameless default project is
    /// synthesized when no `run_with` call or file project exists.
    pub projects: Vec<Project>,

    pub(crate) global_setup: Option<GlobalHook>,
    pub(crate) global_teardown: Option<GlobalHook>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("timeout", &self.timeout)
            .field("global_timeout", &self.global_timeout)
            .field("retries", &self.retries)
            .field("test_dir", &self.test_dir)
            .field("output_dir", &self.output_dir)
            .field("workers", &self.workers)
            .field("repeat_each", &self.repeat_each)
            .field("max_failures", &self.max_failures)
            .field("projects", &self.projects)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// The effective snapshot root.
    pub fn snapshot_root(&self) -> Utf8PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.test_dir.join("__snapshots__"))
    }

    pub(crate) fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Builder for [`Config`]: code-valued settings plus the file/CLI merge.
#[derive(Default)]
pub struct ConfigBuilder {
    file_path: Option<Utf8PathBuf>,
    defines: Vec<FixtureSet>,
    projects: Vec<(FixtureSet, ProjectOptions)>,
    global_setup: Option<GlobalHook>,
    global_teardown: Option<GlobalHook>,
}

impl ConfigBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an explicit config file instead of searching upward.
    pub fn config_file(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.file_path = Some(path.into());
        self
    }

    /// Layers a set of fixture overrides over the session's fixtures for
    /// every project.
    pub fn define(&mut self, fixtures: FixtureSet) -> &mut Self {
        self.defines.push(fixtures);
        self
    }

    /// Declares a project: one full expansion of the test registry with the
    /// given fixture set layered on top of the session's.
    pub fn run_with(&mut self, fixtures: FixtureSet, options: ProjectOptions) -> &mut Self {
        self.projects.push((fixtures, options));
        self
    }

    /// Registers a hook run once before any worker spawns. Its value is
    /// exposed to tests as `TestInfo::global_setup_result`.
    pub fn global_setup<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GlobalSetupResult, BodyError>> + Send + 'static,
    {
        self.global_setup = Some(Arc::new(move |config| Box::pin(hook(config))));
        self
    }

    /// Registers a hook run once after all workers exit. It runs only if
    /// global setup completed.
    pub fn global_teardown<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GlobalSetupResult, BodyError>> + Send + 'static,
    {
        self.global_teardown = Some(Arc::new(move |config| Box::pin(hook(config))));
        self
    }

    /// The fixture-override layers registered with [`define`](Self::define).
    pub fn defined_fixtures(&self) -> &[FixtureSet] {
        &self.defines
    }

    /// The fixture set of the code-declared project with this resolved
    /// name. Workers use this to rebuild a project's graph from their own
    /// registration. File-declared and synthesized projects have no code
    /// fixtures, so an empty set is returned for them.
    pub fn project_fixtures(&self, name: &str) -> FixtureSet {
        for (fixtures, options) in &self.projects {
            let resolved = if options.name.is_empty() {
                options.tag.clone().unwrap_or_else(|| "default".to_owned())
            } else {
                options.name.clone()
            };
            if resolved == name {
                return fixtures.clone();
            }
        }
        FixtureSet::new()
    }

    /// Loads the file config, applies CLI overrides, and resolves projects.
    pub fn resolve(&self, overrides: &CliOverrides) -> Result<Config, ConfigError> {
        let file = self.load_file(overrides)?;

        let timeout = overrides.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT);
        let retries = overrides.retries.or(file.retries).unwrap_or(0);
        let test_dir = file.test_dir.unwrap_or_else(|| Utf8PathBuf::from("tests"));
        let output_dir = overrides
            .output_dir
            .clone()
            .or(file.output_dir)
            .unwrap_or_else(|| Utf8PathBuf::from("test-results"));
        let workers = match overrides.workers.or(file.workers) {
            Some(0) => {
                return Err(ConfigError::InvalidOption {
                    option: "workers".to_owned(),
                    message: "must be at least 1".to_owned(),
                });
            }
            Some(n) => n,
            None => Config::default_workers(),
        };
        let repeat_each = match overrides.repeat_each.or(file.repeat_each) {
            Some(0) => {
                return Err(ConfigError::InvalidOption {
                    option: "repeat-each".to_owned(),
                    message: "must be at least 1".to_owned(),
                });
            }
            Some(n) => n,
            None => 1,
        };

        let mut reporter = if overrides.reporter.is_empty() {
            file.reporter
        } else {
            overrides.reporter.clone()
        };
        if reporter.is_empty() {
            reporter.push("line".to_owned());
        }

        // File params give a single value each. CLI params replace the file
        // value for that name; a repeated --param flag accumulates matrix
        // entries.
        let mut params: IndexMap<String, Vec<serde_json::Value>> = file
            .params
            .into_iter()
            .map(|(name, value)| (name, vec![value]))
            .collect();
        let mut cli_params: IndexMap<String, Vec<serde_json::Value>> = IndexMap::new();
        for (name, value) in &overrides.params {
            cli_params
                .entry(name.clone())
                .or_default()
                .push(value.clone());
        }
        for (name, values) in cli_params {
            params.insert(name, values);
        }

        let mut projects = Vec::new();
        for (fixtures, options) in &self.projects {
            projects.push(Project::new(
                options.clone(),
                fixtures.clone(),
                timeout,
                retries,
            ));
        }
        for file_project in file.projects {
            let options = ProjectOptions {
                name: file_project.name,
                tag: file_project.tag,
                timeout: file_project.timeout,
                retries: file_project.retries,
                params: file_project.params,
                tags: Vec::new(),
            };
            projects.push(Project::new(options, FixtureSet::new(), timeout, retries));
        }
        if projects.is_empty() {
            projects.push(Project::new(
                ProjectOptions::default(),
                FixtureSet::new(),
                timeout,
                retries,
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for project in &projects {
            if !seen.insert(project.name.clone()) {
                return Err(ConfigError::InvalidOption {
                    option: "projects".to_owned(),
                    message: format!("duplicate project name `{}`", project.name),
                });
            }
        }

        Ok(Config {
            timeout,
            global_timeout: overrides.global_timeout.or(file.global_timeout),
            retries,
            test_dir,
            test_match: if overrides.test_match.is_empty() {
                file.test_match
            } else {
                overrides.test_match.clone()
            },
            test_ignore: if overrides.test_ignore.is_empty() {
                file.test_ignore
            } else {
                overrides.test_ignore.clone()
            },
            output_dir,
            snapshot_dir: file.snapshot_dir,
            preserve_output: file.preserve_output.unwrap_or_default(),
            forbid_only: overrides.forbid_only || file.forbid_only.unwrap_or(false),
            reporter,
            workers,
            repeat_each,
            max_failures: overrides.max_failures.or(file.max_failures).filter(|n| *n > 0),
            grep: overrides.grep.clone(),
            grep_invert: overrides.grep_invert.clone(),
            update_snapshots: overrides.update_snapshots,
            list_only: overrides.list_only,
            params,
            projects,
            global_setup: self.global_setup.clone(),
            global_teardown: self.global_teardown.clone(),
        })
    }

    fn load_file(&self, overrides: &CliOverrides) -> Result<FileConfig, ConfigError> {
        let explicit = overrides.config_path.clone().or_else(|| self.file_path.clone());
        let path = match explicit {
            Some(path) => Some(path),
            None => search_upward()?,
        };
        let Some(path) = path else {
            return Ok(FileConfig::default());
        };
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_std_path()).format(config::FileFormat::Toml))
            .build()
            .map_err(|source| ConfigError::Load {
                path: path.clone(),
                source,
            })?;
        settings
            .try_deserialize()
            .map_err(|source| ConfigError::Load { path, source })
    }
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("file_path", &self.file_path)
            .field("defines", &self.defines.len())
            .field("projects", &self.projects.len())
            .field("global_setup", &self.global_setup.is_some())
            .field("global_teardown", &self.global_teardown.is_some())
            .finish()
    }
}

/// Searches upward from the working directory for `quire.toml`. A missing
/// file is not an error; every setting has a default.
fn search_upward() -> Result<Option<Utf8PathBuf>, ConfigError> {
    let start = std::env::current_dir()
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok());
    let Some(start) = start else {
        return Ok(None);
    };
    let mut dir: &Utf8Path = &start;
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return Ok(None),
        }
    }
}

/// Values collected from the command line; `None`/empty means "not passed".
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    /// `--config`.
    pub config_path: Option<Utf8PathBuf>,
    /// `--workers` / `-j`.
    pub workers: Option<usize>,
    /// `--timeout`.
    pub timeout: Option<Duration>,
    /// `--global-timeout`.
    pub global_timeout: Option<Duration>,
    /// `--retries`.
    pub retries: Option<usize>,
    /// `--repeat-each`.
    pub repeat_each: Option<usize>,
    /// `--grep`.
    pub grep: Option<String>,
    /// `--grep-invert`.
    pub grep_invert: Option<String>,
    /// `--test-match`.
    pub test_match: Vec<String>,
    /// `--test-ignore`.
    pub test_ignore: Vec<String>,
    /// `--max-failures` / `-x`.
    pub max_failures: Option<usize>,
    /// `--forbid-only`.
    pub forbid_only: bool,
    /// `--update-snapshots` / `-u`.
    pub update_snapshots: bool,
    /// `--list`.
    pub list_only: bool,
    /// `--reporter`.
    pub reporter: Vec<String>,
    /// `--output`.
    pub output_dir: Option<Utf8PathBuf>,
    /// `--param name=value`, in flag order.
    pub params: Vec<(String, serde_json::Value)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_a_file() {
        let overrides = CliOverrides::default();
        let builder = ConfigBuilder::new();
        let config = builder.resolve(&overrides).unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.retries, 0);
        assert_eq!(config.repeat_each, 1);
        assert_eq!(config.projects.len(), 1);
        assert_eq!(config.reporter, vec!["line".to_owned()]);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let overrides = CliOverrides {
            workers: Some(0),
            ..Default::default()
        };
        let err = ConfigBuilder::new().resolve(&overrides).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { option, .. } if option == "workers"));
    }

    #[test]
    fn repeated_cli_params_accumulate() {
        let overrides = CliOverrides {
            params: vec![
                ("browser".to_owned(), serde_json::json!("chrome")),
                ("browser".to_owned(), serde_json::json!("firefox")),
            ],
            ..Default::default()
        };
        let config = ConfigBuilder::new().resolve(&overrides).unwrap();
        assert_eq!(
            config.params["browser"],
            vec![serde_json::json!("chrome"), serde_json::json!("firefox")]
        );
    }
}

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use quire_metadata::QuireExitCode;
use quire_runner::{
    config::CliOverrides,
    errors::ConfigError,
    list::BuildListError,
    reporter::ReporterBus,
    runner::{RunError, TestRunnerBuilder, WORKER_SUBCOMMAND},
    session::Session,
};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// A fixture-first parallel test runner.
#[derive(Debug, Parser)]
#[command(name = "quire", max_term_width = 100)]
pub struct QuireApp {
    #[command(subcommand)]
    command: Option<QuireCommand>,

    #[clap(flatten)]
    run_opts: RunOpts,
}

#[derive(Debug, Subcommand)]
enum QuireCommand {
    /// Discover and run tests.
    Run(RunOpts),
    /// Private mode, used by the controller to spawn worker processes.
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    Worker,
}

/// Options for a test run.
#[derive(Debug, Args, Default)]
pub struct RunOpts {
    /// Test directories or files to run; everything registered by default.
    pub paths: Vec<Utf8PathBuf>,

    /// Config file to load instead of searching upward for quire.toml.
    #[arg(long, value_name = "PATH")]
    pub config: Option<Utf8PathBuf>,

    /// Number of worker processes.
    #[arg(long, short = 'j', value_name = "N")]
    pub workers: Option<usize>,

    /// Per-test timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Wall-clock bound for the entire run, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub global_timeout: Option<u64>,

    /// Retries for failing tests.
    #[arg(long, value_name = "N")]
    pub retries: Option<usize>,

    /// Run every test N times.
    #[arg(long, value_name = "N")]
    pub repeat_each: Option<usize>,

    /// Only run tests whose full title matches this regex.
    #[arg(long, value_name = "REGEX")]
    pub grep: Option<String>,

    /// Skip tests whose full title matches this regex.
    #[arg(long, value_name = "REGEX")]
    pub grep_invert: Option<String>,

    /// Only run files matching these globs.
    #[arg(long, value_name = "GLOB")]
    pub test_match: Vec<String>,

    /// Skip files matching these globs.
    #[arg(long, value_name = "GLOB")]
    pub test_ignore: Vec<String>,

    /// Stop dispatching after N unexpected failures.
    #[arg(long, value_name = "N")]
    pub max_failures: Option<usize>,

    /// Shorthand for --max-failures=1.
    #[arg(short = 'x', conflicts_with = "max_failures")]
    pub fail_fast: bool,

    /// Fail if any `only` marker survives load.
    #[arg(long)]
    pub forbid_only: bool,

    /// Allow snapshot writes.
    #[arg(long, short = 'u')]
    pub update_snapshots: bool,

    /// Report discovery without running anything.
    #[arg(long)]
    pub list: bool,

    /// Reporters to use (line, list, dot, json, junit). Repeatable or
    /// comma-separated.
    #[arg(long, value_name = "NAME", value_delimiter = ',')]
    pub reporter: Vec<String>,

    /// Root of the per-test output directories.
    #[arg(long, value_name = "DIR")]
    pub output: Option<Utf8PathBuf>,

    /// Set a parameter: `--param name=value`. A bare `--param name` sets a
    /// boolean parameter to true; repeating a name produces a value matrix.
    #[arg(long, value_name = "NAME=VALUE")]
    pub param: Vec<String>,
}

impl RunOpts {
    fn into_overrides(self) -> Result<CliOverrides, String> {
        let mut params = Vec::new();
        for raw in &self.param {
            let (name, value) = match raw.split_once('=') {
                Some((name, value)) => (name, parse_param_value(value)),
                // Bare flag form for boolean parameters.
                None => (raw.as_str(), serde_json::Value::Bool(true)),
            };
            if name.is_empty() {
                return Err(format!("invalid --param `{raw}`: empty name"));
            }
            params.push((name.to_owned(), value));
        }

        let mut test_match = self.test_match;
        for path in &self.paths {
            // A positional path selects that file, or everything under the
            // directory.
            test_match.push(path.to_string());
            test_match.push(format!("{path}/**"));
        }

        Ok(CliOverrides {
            config_path: self.config,
            workers: self.workers,
            timeout: self.timeout.map(Duration::from_millis),
            global_timeout: self.global_timeout.map(Duration::from_millis),
            retries: self.retries,
            repeat_each: self.repeat_each,
            grep: self.grep,
            grep_invert: self.grep_invert,
            test_match,
            test_ignore: self.test_ignore,
            max_failures: if self.fail_fast {
                Some(1)
            } else {
                self.max_failures
            },
            forbid_only: self.forbid_only,
            update_snapshots: self.update_snapshots,
            list_only: self.list,
            reporter: self.reporter,
            output_dir: self.output,
            params,
        })
    }
}

/// Parameter values are JSON when they parse as JSON, strings otherwise:
/// `--param retries=3` is a number, `--param browser=firefox` a string.
fn parse_param_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_owned()))
}

impl QuireApp {
    /// Executes the parsed command against a registered session.
    pub fn exec(self, session: Session) -> i32 {
        match self.command {
            Some(QuireCommand::Worker) => quire_runner::worker::worker_main(session),
            Some(QuireCommand::Run(opts)) => run_tests(session, opts),
            None => run_tests(session, self.run_opts),
        }
    }
}

fn init_tracing() {
    // DEBUG enables diagnostic streaming on stderr.
    let filter = if std::env::var_os("DEBUG").is_some() {
        "quire_runner=debug,quire_cli=debug"
    } else {
        "warn"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_tests(session: Session, opts: RunOpts) -> i32 {
    init_tracing();

    let overrides = match opts.into_overrides() {
        Ok(overrides) => overrides,
        Err(message) => {
            eprintln!("error: {message}");
            return QuireExitCode::SETUP_ERROR;
        }
    };

    let config = match session.config().resolve(&overrides) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return QuireExitCode::SETUP_ERROR;
        }
    };

    let mut bus = match ReporterBus::from_names(&config.reporter, &config) {
        Ok(bus) => bus,
        Err(err) => {
            eprintln!("error: {err}");
            return QuireExitCode::SETUP_ERROR;
        }
    };

    let builder = TestRunnerBuilder::new();
    let runner = match builder.build(Arc::new(session), config) {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("error: {err}");
            return QuireExitCode::TEST_RUN_FAILED;
        }
    };

    match runner.execute(|event| bus.handle(event)) {
        Ok(stats) => {
            debug!(?stats, "run complete");
            match stats.final_status() {
                quire_runner::reporter::events::FinalStatus::Passed => QuireExitCode::OK,
                quire_runner::reporter::events::FinalStatus::Failed => {
                    QuireExitCode::TEST_RUN_FAILED
                }
            }
        }
        Err(RunError::List(BuildListError::Config(err))) => {
            eprintln!("error: {err}");
            exit_code_for_config_error(&err)
        }
        Err(RunError::List(BuildListError::Fixture(err))) => {
            eprintln!("error: {err}");
            QuireExitCode::TEST_RUN_FAILED
        }
        Err(RunError::Build(err)) => {
            eprintln!("error: {err}");
            QuireExitCode::TEST_RUN_FAILED
        }
    }
}

fn exit_code_for_config_error(_err: &ConfigError) -> i32 {
    QuireExitCode::SETUP_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        QuireApp::command().debug_assert();
    }

    #[test]
    fn params_parse_typed_values() {
        let opts = RunOpts {
            param: vec![
                "browser=firefox".to_owned(),
                "retries=3".to_owned(),
                "headless".to_owned(),
            ],
            ..Default::default()
        };
        let overrides = opts.into_overrides().unwrap();
        assert_eq!(
            overrides.params,
            vec![
                ("browser".to_owned(), serde_json::json!("firefox")),
                ("retries".to_owned(), serde_json::json!(3)),
                ("headless".to_owned(), serde_json::json!(true)),
            ]
        );
    }

    #[test]
    fn fail_fast_maps_to_max_failures_one() {
        let opts = RunOpts {
            fail_fast: true,
            ..Default::default()
        };
        let overrides = opts.into_overrides().unwrap();
        assert_eq!(overrides.max_failures, Some(1));
    }

    #[test]
    fn positional_paths_become_match_globs() {
        let opts = RunOpts {
            paths: vec!["tests/auth.rs".into(), "tests/api".into()],
            ..Default::default()
        };
        let overrides = opts.into_overrides().unwrap();
        assert!(overrides.test_match.contains(&"tests/auth.rs".to_owned()));
        assert!(overrides.test_match.contains(&"tests/api/**".to_owned()));
    }
}

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-readable reporters: the JSON report (schema in
//! `quire-metadata`) and JUnit XML.

use super::Reporter;
use crate::{
    config::Config,
    errors::serialize_error,
    list::{TestInstance, TestList},
    reporter::events::{RunStats, TestResult, TestStatus},
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use quire_metadata::{
    ReportConfig, ReportError, ResultReport, RunReport, SpecReport, SuiteReport,
};
use std::{collections::HashMap, time::Duration};
use tracing::warn;

fn to_result_report(result: &TestResult) -> ResultReport {
    ResultReport {
        worker_index: result.worker_index,
        retry: result.retry,
        status: result.status.to_report(),
        duration_ms: result.duration.as_millis() as u64,
        error: result.error.clone(),
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        attachments: result.attachments.clone(),
        data: result.data.clone(),
    }
}

/// Accumulated per-instance state shared by the machine reporters.
#[derive(Default)]
struct Accumulator {
    instances: Vec<TestInstance>,
    results: HashMap<String, Vec<(TestResult, bool)>>,
    errors: Vec<ReportError>,
}

impl Accumulator {
    fn on_begin(&mut self, list: &TestList) {
        self.instances = list.instances.clone();
        for error in list.load_errors() {
            self.errors.push(serialize_error(error));
        }
    }

    fn on_test_end(&mut self, instance: &TestInstance, result: &TestResult, will_retry: bool) {
        self.results
            .entry(instance.id.clone())
            .or_default()
            .push((result.clone(), will_retry));
    }

    /// True when every recorded attempt sequence ends in an expected
    /// status.
    fn instance_ok(&self, id: &str) -> bool {
        match self.results.get(id).and_then(|r| r.last()) {
            Some((result, _)) => result.expected_status.matches(result.status),
            None => false,
        }
    }
}

/// The `json` reporter: writes the full run report to `JSON_OUTPUT_NAME`
/// (or stdout) at the end of the run.
pub struct JsonReporter {
    acc: Accumulator,
    config: ReportConfig,
    output: Option<Utf8PathBuf>,
}

impl JsonReporter {
    pub(crate) fn new(config: &Config) -> Self {
        let output = std::env::var("JSON_OUTPUT_NAME")
            .ok()
            .map(Utf8PathBuf::from);
        Self {
            acc: Accumulator::default(),
            config: ReportConfig {
                test_dir: config.test_dir.clone(),
                output_dir: config.output_dir.clone(),
                timeout_ms: config.timeout.as_millis() as u64,
                global_timeout_ms: config.global_timeout.map(|t| t.as_millis() as u64),
                retries: config.retries,
                workers: config.workers,
                repeat_each: config.repeat_each,
                projects: config.projects.iter().map(|p| p.name.clone()).collect(),
            },
            output,
        }
    }

    fn assemble(&self) -> RunReport {
        // Sort for stability under parallel completion order.
        let mut order: Vec<&TestInstance> = self.acc.instances.iter().collect();
        order.sort_by(|a, b| {
            (a.file.as_str(), a.location.line, a.project_name.as_str()).cmp(&(
                b.file.as_str(),
                b.location.line,
                b.project_name.as_str(),
            ))
        });

        // file -> suite-path tree -> specs.
        let mut suites: IndexMap<Utf8PathBuf, SuiteReport> = IndexMap::new();
        for instance in order {
            let file_suite =
                suites
                    .entry(instance.file.clone())
                    .or_insert_with(|| SuiteReport {
                        title: String::new(),
                        file: instance.file.clone(),
                        location: None,
                        suites: Vec::new(),
                        specs: Vec::new(),
                    });
            let mut node = file_suite;
            for title in &instance.suite_path {
                let position = node.suites.iter().position(|s| &s.title == title);
                let index = match position {
                    Some(index) => index,
                    None => {
                        node.suites.push(SuiteReport {
                            title: title.clone(),
                            file: instance.file.clone(),
                            location: None,
                            suites: Vec::new(),
                            specs: Vec::new(),
                        });
                        node.suites.len() - 1
                    }
                };
                node = &mut node.suites[index];
            }

            let spec_position = node
                .specs
                .iter()
                .position(|s| s.title == instance.title && s.line == instance.location.line);
            let spec_index = match spec_position {
                Some(index) => index,
                None => {
                    node.specs.push(SpecReport {
                        title: instance.title.clone(),
                        file: instance.file.clone(),
                        line: instance.location.line,
                        column: instance.location.column,
                        ok: true,
                        tests: Vec::new(),
                    });
                    node.specs.len() - 1
                }
            };
            let spec = &mut node.specs[spec_index];

            let ok = self.acc.instance_ok(&instance.id);
            spec.ok &= ok;

            let mut results: Vec<ResultReport> = self
                .acc
                .results
                .get(&instance.id)
                .map(|attempts| {
                    attempts
                        .iter()
                        .map(|(result, _)| to_result_report(result))
                        .collect()
                })
                .unwrap_or_default();
            results.sort_by_key(|r| r.retry);

            let last = self.acc.results.get(&instance.id).and_then(|r| r.last());
            let annotations = last
                .map(|(result, _)| result.annotations.clone())
                .unwrap_or_default();
            spec.tests.push(quire_metadata::TestReport {
                project_name: instance.project_name.clone(),
                tags: instance.tags.clone(),
                parameters: instance
                    .variation
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                annotations,
                expected_status: last
                    .map(|(result, _)| result.expected_status.to_report())
                    .unwrap_or_else(|| instance.expected_status.to_report()),
                results,
            });
        }

        RunReport {
            config: self.config.clone(),
            errors: self.acc.errors.clone(),
            suites: suites.into_values().collect(),
        }
    }
}

impl Reporter for JsonReporter {
    fn on_begin(&mut self, _config: &Config, list: &TestList) {
        self.acc.on_begin(list);
    }

    fn on_test_end(&mut self, instance: &TestInstance, result: &TestResult, will_retry: bool) {
        self.acc.on_test_end(instance, result, will_retry);
    }

    fn on_error(&mut self, error: &ReportError) {
        self.acc.errors.push(error.clone());
    }

    fn on_end(&mut self, _stats: &RunStats, _start_time: DateTime<Local>, _elapsed: Duration) {
        let report = self.assemble();
        let rendered = match serde_json::to_string_pretty(&report) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!("failed to serialize JSON report: {err}");
                return;
            }
        };
        match &self.output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(err) = std::fs::write(path, rendered) {
                    warn!("failed to write JSON report to `{path}`: {err}");
                }
            }
            None => println!("{rendered}"),
        }
    }
}

/// The `junit` reporter: one `<testsuite>` per file, one `<testcase>` per
/// test instance, written to `<output_dir>/junit.xml`.
pub struct JunitReporter {
    acc: Accumulator,
    output: Utf8PathBuf,
}

impl JunitReporter {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            acc: Accumulator::default(),
            output: config.output_dir.join("junit.xml"),
        }
    }
}

impl Reporter for JunitReporter {
    fn on_begin(&mut self, _config: &Config, list: &TestList) {
        self.acc.on_begin(list);
    }

    fn on_test_end(&mut self, instance: &TestInstance, result: &TestResult, will_retry: bool) {
        self.acc.on_test_end(instance, result, will_retry);
    }

    fn on_error(&mut self, error: &ReportError) {
        self.acc.errors.push(error.clone());
    }

    fn on_end(&mut self, _stats: &RunStats, _start_time: DateTime<Local>, _elapsed: Duration) {
        let mut report = Report::new("quire");
        let mut suites: IndexMap<Utf8PathBuf, TestSuite> = IndexMap::new();

        for instance in &self.acc.instances {
            let suite = suites
                .entry(instance.file.clone())
                .or_insert_with(|| TestSuite::new(instance.file.as_str()));
            let Some(attempts) = self.acc.results.get(&instance.id) else {
                continue;
            };
            let Some((last, _)) = attempts.last() else {
                continue;
            };
            let mut status = if last.expected_status.matches(last.status) {
                if last.status == TestStatus::Skipped {
                    TestCaseStatus::skipped()
                } else {
                    TestCaseStatus::success()
                }
            } else {
                let kind = match last.status {
                    TestStatus::TimedOut => NonSuccessKind::Error,
                    _ => NonSuccessKind::Failure,
                };
                let mut status = TestCaseStatus::non_success(kind);
                if let Some(error) = &last.error {
                    status.set_message(error.message.clone());
                }
                status
            };
            if attempts.len() > 1 {
                status.set_description(format!("{} attempts", attempts.len()));
            }
            let mut name = instance.full_title();
            if instance.project_name != "default" {
                name = format!("[{}] {name}", instance.project_name);
            }
            let mut case = TestCase::new(name, status);
            case.set_time(last.duration);
            suite.add_test_case(case);
        }

        for suite in suites.into_values() {
            report.add_test_suite(suite);
        }

        if let Some(parent) = self.output.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::File::create(&self.output) {
            Ok(file) => {
                if let Err(err) = report.serialize(file) {
                    warn!("failed to write JUnit report: {err}");
                }
            }
            Err(err) => {
                warn!("failed to create `{}`: {err}", self.output);
            }
        }
    }
}

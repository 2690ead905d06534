// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reporting bus.
//!
//! The runner produces a stream of [`events::TestEvent`]s; the
//! [`ReporterBus`] resolves instance IDs back to test instances and fans the
//! stream out to any number of [`Reporter`]s. Built-in reporters: `line`
//! (default), `list`, `dot`, `json`, `junit`.

pub mod aggregator;
pub mod displayer;
pub mod events;

use crate::{
    config::Config,
    errors::ConfigError,
    list::{TestInstance, TestList},
    reporter::events::{RunStats, StdioKind, TestEvent, TestEventKind, TestResult},
};
use chrono::{DateTime, Local};
use quire_metadata::{OutputChunk, ReportError};
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// A consumer of run lifecycle events.
///
/// All methods have empty defaults so reporters implement only what they
/// need.
pub trait Reporter: Send {
    /// The run is starting; discovery is complete.
    fn on_begin(&mut self, _config: &Config, _list: &TestList) {}

    /// An attempt began in a worker.
    fn on_test_begin(&mut self, _instance: &TestInstance, _retry: usize, _worker_index: usize) {}

    /// A stdio chunk arrived, attributed to `instance` when known.
    fn on_stdio(
        &mut self,
        _kind: StdioKind,
        _instance: Option<&TestInstance>,
        _chunk: &OutputChunk,
    ) {
    }

    /// An attempt finished. `will_retry` is true when another attempt of
    /// the same instance will follow.
    fn on_test_end(&mut self, _instance: &TestInstance, _result: &TestResult, _will_retry: bool) {}

    /// An error not attributable to a single test.
    fn on_error(&mut self, _error: &ReportError) {}

    /// The run finished.
    fn on_end(&mut self, _stats: &RunStats, _start_time: DateTime<Local>, _elapsed: Duration) {}
}

/// Fans lifecycle events out to the configured reporters.
pub struct ReporterBus {
    reporters: Vec<Box<dyn Reporter>>,
    list: Option<Arc<TestList>>,
}

impl ReporterBus {
    /// Creates a bus over the given reporters.
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self {
            reporters,
            list: None,
        }
    }

    /// Builds the named built-in reporters.
    pub fn from_names(names: &[String], config: &Config) -> Result<Self, ConfigError> {
        let mut reporters: Vec<Box<dyn Reporter>> = Vec::with_capacity(names.len());
        for name in names {
            match name.as_str() {
                "line" => reporters.push(Box::new(displayer::LineReporter::new(false))),
                "list" => reporters.push(Box::new(displayer::LineReporter::new(true))),
                "dot" => reporters.push(Box::new(displayer::DotReporter::new())),
                "json" => reporters.push(Box::new(aggregator::JsonReporter::new(config))),
                "junit" => reporters.push(Box::new(aggregator::JunitReporter::new(config))),
                other => {
                    return Err(ConfigError::InvalidOption {
                        option: "reporter".to_owned(),
                        message: format!(
                            "unknown reporter `{other}` (known: line, list, dot, json, junit)"
                        ),
                    });
                }
            }
        }
        Ok(Self::new(reporters))
    }

    /// Routes one runner event to every reporter.
    pub fn handle(&mut self, event: TestEvent) {
        match event.kind {
            TestEventKind::RunStarted { config, test_list } => {
                self.list = Some(test_list.clone());
                for reporter in &mut self.reporters {
                    reporter.on_begin(&config, &test_list);
                }
            }
            TestEventKind::TestStarted {
                instance_id,
                retry,
                worker_index,
            } => {
                let Some(instance) = self.lookup(&instance_id) else {
                    return;
                };
                for reporter in &mut self.reporters {
                    reporter.on_test_begin(&instance, retry, worker_index);
                }
            }
            TestEventKind::Stdio {
                kind,
                instance_id,
                chunk,
            } => {
                let instance = instance_id.as_deref().and_then(|id| self.lookup(id));
                for reporter in &mut self.reporters {
                    reporter.on_stdio(kind, instance.as_deref(), &chunk);
                }
            }
            TestEventKind::TestFinished {
                instance_id,
                result,
                will_retry,
                current_stats: _,
            } => {
                let Some(instance) = self.lookup(&instance_id) else {
                    return;
                };
                for reporter in &mut self.reporters {
                    reporter.on_test_end(&instance, &result, will_retry);
                }
            }
            TestEventKind::Error { error } => {
                for reporter in &mut self.reporters {
                    reporter.on_error(&error);
                }
            }
            TestEventKind::RunCancelRequested { .. } => {}
            TestEventKind::RunFinished {
                start_time,
                elapsed,
                run_stats,
            } => {
                for reporter in &mut self.reporters {
                    reporter.on_end(&run_stats, start_time, elapsed);
                }
            }
        }
    }

    fn lookup(&self, id: &str) -> Option<InstanceRef> {
        let list = self.list.as_ref()?;
        if list.instance(id).is_none() {
            warn!(id, "event for unknown test instance");
            return None;
        }
        Some(InstanceRef {
            list: list.clone(),
            id: id.to_owned(),
        })
    }
}

/// A cheap owned handle to an instance inside the shared test list.
struct InstanceRef {
    list: Arc<TestList>,
    id: String,
}

impl std::ops::Deref for InstanceRef {
    type Target = TestInstance;

    fn deref(&self) -> &TestInstance {
        self.list
            .instance(&self.id)
            .expect("existence checked at construction")
    }
}


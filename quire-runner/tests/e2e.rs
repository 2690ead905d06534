// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios through real worker processes.
//!
//! This binary is both the controller and the worker: the runner re-executes
//! `current_exe()` with the hidden worker subcommand, and `main` routes that
//! invocation into `worker_main` with the same session the controller built.
//! The scenario name travels through an environment variable so both sides
//! agree on what is registered.

use camino::Utf8PathBuf;
use quire_runner::{
    config::CliOverrides,
    context::TestContext,
    fixtures::{FixtureDef, FixtureHandle, FixtureScope},
    list::TestList,
    registry::TestOptions,
    reporter::events::{
        FinalStatus, RunStats, TestEvent, TestEventKind, TestResult, TestStatus,
    },
    runner::{TestRunnerBuilder, WORKER_SUBCOMMAND},
    session::Session,
    signal::SignalHandlerKind,
    worker::worker_main,
};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

const SCENARIO_ENV: &str = "QUIRE_E2E_SCENARIO";
const SIDE_FILE_ENV: &str = "QUIRE_E2E_SIDE_FILE";

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some(WORKER_SUBCOMMAND) {
        let scenario = std::env::var(SCENARIO_ENV).expect("worker spawned without a scenario");
        std::process::exit(worker_main(build_session(&scenario)));
    }

    run_scenario("flaky-passes", flaky_passes);
    run_scenario("timeout-teardown", timeout_teardown);
    run_scenario("override-order", override_order);
    run_scenario("parameter-matrix", parameter_matrix);
    run_scenario("worker-reuse", worker_reuse);
    run_scenario("fail-fast", fail_fast);

    println!("all e2e scenarios passed");
}

fn run_scenario(name: &str, check: fn(RunStats, &[TestEvent])) {
    // The worker inherits this environment and rebuilds the same session.
    unsafe {
        std::env::set_var(SCENARIO_ENV, name);
    }
    if name == "timeout-teardown" {
        // Stale side files from earlier runs would satisfy the assertions.
        let _ = std::fs::remove_file(side_file_path());
    }
    let (stats, events) = execute(name);
    check(stats, &events);
    println!("scenario `{name}` ok");
}

fn execute(scenario: &str) -> (RunStats, Vec<TestEvent>) {
    let session = build_session(scenario);
    let overrides = overrides_for(scenario);
    let config = session
        .config()
        .resolve(&overrides)
        .expect("config resolves");

    let mut builder = TestRunnerBuilder::new();
    builder.set_signal_handler(SignalHandlerKind::Noop);
    let runner = builder
        .build(Arc::new(session), config)
        .expect("runner builds");

    let mut events = Vec::new();
    let stats = runner
        .execute(|event| events.push(event))
        .expect("run executes");
    (stats, events)
}

fn overrides_for(scenario: &str) -> CliOverrides {
    match scenario {
        "flaky-passes" => CliOverrides {
            retries: Some(1),
            workers: Some(2),
            ..CliOverrides::default()
        },
        "timeout-teardown" => CliOverrides {
            timeout: Some(Duration::from_millis(1000)),
            workers: Some(1),
            ..CliOverrides::default()
        },
        "worker-reuse" => CliOverrides {
            workers: Some(4),
            ..CliOverrides::default()
        },
        "fail-fast" => CliOverrides {
            max_failures: Some(3),
            workers: Some(2),
            ..CliOverrides::default()
        },
        _ => CliOverrides {
            workers: Some(2),
            ..CliOverrides::default()
        },
    }
}

fn build_session(scenario: &str) -> Session {
    let mut session = Session::new();
    match scenario {
        "flaky-passes" => {
            session.test_file("tests/flaky.rs", |c| {
                c.test("settles on retry", |cx: TestContext| async move {
                    if cx.info().retry() == 1 {
                        Ok(())
                    } else {
                        Err("first attempt fails".into())
                    }
                });
            });
        }
        "timeout-teardown" => {
            let side_file = side_file_path();
            session
                .fixture(FixtureDef::new(
                    "worker_log",
                    FixtureScope::Worker,
                    move |_args, mut handle: FixtureHandle| {
                        let path = side_file.clone();
                        async move {
                            handle.supply(()).await?;
                            append_line(&path, "worker teardown");
                            Ok(())
                        }
                    },
                ))
                .unwrap();
            let side_file = side_file_path();
            session
                .fixture(FixtureDef::new(
                    "test_log",
                    FixtureScope::Test,
                    move |_args, mut handle: FixtureHandle| {
                        let path = side_file.clone();
                        async move {
                            handle.supply(()).await?;
                            append_line(&path, "test teardown");
                            Ok(())
                        }
                    },
                )
                .with_deps(&["worker_log"]))
                .unwrap();
            session.test_file("tests/hang.rs", |c| {
                c.test_with(
                    "hangs forever",
                    TestOptions::new().deps(&["test_log"]),
                    |_cx: TestContext| async move {
                        std::future::pending::<()>().await;
                        Ok(())
                    },
                );
            });
        }
        "override-order" => {
            session
                .fixture(FixtureDef::new(
                    "f",
                    FixtureScope::Test,
                    |_args, mut handle: FixtureHandle| async move {
                        handle.supply("base".to_owned()).await
                    },
                ))
                .unwrap();
            for suffix in ["-1", "-2"] {
                session
                    .override_fixture(
                        FixtureDef::new(
                            "f",
                            FixtureScope::Test,
                            move |args: quire_runner::fixtures::FixtureArgs,
                                  mut handle: FixtureHandle| async move {
                                let prev = args.get::<String>("f")?;
                                handle.supply(format!("{prev}{suffix}")).await
                            },
                        )
                        .with_deps(&["f"]),
                    )
                    .unwrap();
            }
            session.test_file("tests/override.rs", |c| {
                c.test_with(
                    "sees composed value",
                    TestOptions::new().deps(&["f"]),
                    |cx: TestContext| async move {
                        let value = cx.fixture::<String>("f")?;
                        if *value == "base-1-2" {
                            Ok(())
                        } else {
                            Err(format!("unexpected override chain: {value}").into())
                        }
                    },
                );
            });
        }
        "parameter-matrix" => {
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
        }
        "worker-reuse" => {
            session.parameter("mode", "worker mode", None).unwrap();
            session.generate_parametrized_tests(
                "mode",
                vec![serde_json::json!("a"), serde_json::json!("b")],
            );
            session.test_file("tests/reuse.rs", |c| {
                c.test("one", |_cx: TestContext| async move { Ok(()) });
                c.test("two", |_cx: TestContext| async move { Ok(()) });
                c.test_with(
                    "three",
                    TestOptions::new().deps(&["mode"]),
                    |_cx: TestContext| async move { Ok(()) },
                );
            });
        }
        "fail-fast" => {
            session.test_file("tests/failfast.rs", |c| {
                for index in 0..10 {
                    c.test(format!("failing {index}"), |_cx: TestContext| async move {
                        Err("deliberate failure".into())
                    });
                }
                for index in 0..10 {
                    c.test(format!("passing {index}"), |_cx: TestContext| async move {
                        Ok(())
                    });
                }
            });
        }
        other => panic!("unknown scenario `{other}`"),
    }
    session
}

fn side_file_path() -> Utf8PathBuf {
    let raw = std::env::var(SIDE_FILE_ENV).unwrap_or_else(|_| {
        let path = std::env::temp_dir().join(format!("quire-e2e-{}.log", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        unsafe {
            std::env::set_var(SIDE_FILE_ENV, &path);
        }
        path
    });
    Utf8PathBuf::from(raw)
}

fn append_line(path: &Utf8PathBuf, line: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("side file opens");
    writeln!(file, "{line}").expect("side file writes");
}

fn finished(events: &[TestEvent]) -> Vec<(String, TestResult)> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            TestEventKind::TestFinished {
                instance_id,
                result,
                ..
            } => Some((instance_id.clone(), result.clone())),
            _ => None,
        })
        .collect()
}

fn test_list(events: &[TestEvent]) -> Arc<TestList> {
    events
        .iter()
        .find_map(|event| match &event.kind {
            TestEventKind::RunStarted { test_list, .. } => Some(test_list.clone()),
            _ => None,
        })
        .expect("RunStarted is always first")
}

fn flaky_passes(stats: RunStats, events: &[TestEvent]) {
    let results = finished(events);
    assert_eq!(results.len(), 2, "one failed attempt, one retry");
    assert_eq!(results[0].1.status, TestStatus::Failed);
    assert_eq!(results[0].1.retry, 0);
    assert_eq!(results[1].1.status, TestStatus::Passed);
    assert_eq!(results[1].1.retry, 1);

    assert_eq!(stats.passed, 1);
    assert_eq!(stats.flaky, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.final_status(), FinalStatus::Passed);
}

fn timeout_teardown(stats: RunStats, events: &[TestEvent]) {
    let results = finished(events);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1.status, TestStatus::TimedOut);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.final_status(), FinalStatus::Failed);

    let content = std::fs::read_to_string(side_file_path()).expect("side file exists");
    assert!(
        content.contains("test teardown"),
        "test fixture teardown ran: {content:?}"
    );
    assert!(
        content.contains("worker teardown"),
        "worker fixture teardown ran: {content:?}"
    );
    let _ = std::fs::remove_file(side_file_path());
}

fn override_order(stats: RunStats, events: &[TestEvent]) {
    let results = finished(events);
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].1.status,
        TestStatus::Passed,
        "override chain composed incorrectly: {:?}",
        results[0].1.error
    );
    assert_eq!(stats.final_status(), FinalStatus::Passed);
}

fn parameter_matrix(stats: RunStats, events: &[TestEvent]) {
    let list = test_list(events);
    let results = finished(events);
    assert_eq!(results.len(), 4);
    assert_eq!(stats.passed, 4);

    let mut variations: Vec<String> = results
        .iter()
        .map(|(id, _)| {
            let instance = list.instance(id).expect("instance exists");
            format!(
                "{},{}",
                instance.variation["foo"].as_str().unwrap(),
                instance.variation["bar"].as_str().unwrap()
            )
        })
        .collect();
    variations.sort();
    assert_eq!(variations, vec!["a,x", "a,y", "b,x", "b,y"]);
}

fn worker_reuse(stats: RunStats, events: &[TestEvent]) {
    let list = test_list(events);
    assert_eq!(stats.passed, 4, "one + two + three[a] + three[b]");

    let mut by_title: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (id, result) in finished(events) {
        let instance = list.instance(&id).expect("instance exists");
        by_title
            .entry(instance.title.clone())
            .or_default()
            .push(result.worker_index);
    }

    let one = by_title["one"][0];
    let two = by_title["two"][0];
    assert_eq!(one, two, "tests with equal worker hashes share a worker");

    for index in &by_title["three"] {
        assert_ne!(
            *index, one,
            "a different worker-scoped parameter value means a different worker"
        );
    }
}

fn fail_fast(stats: RunStats, events: &[TestEvent]) {
    assert_eq!(stats.failed, 3, "max-failures stops after three failures");
    assert_eq!(stats.skipped, 17, "the rest is skipped with a reason");
    assert_eq!(stats.finished_count, 20);
    assert_eq!(stats.final_status(), FinalStatus::Failed);

    let max_worker = finished(events)
        .iter()
        .map(|(_, result)| result.worker_index)
        .max()
        .unwrap_or(0);
    assert!(
        max_worker <= 2 + 3,
        "no more than workers + max-failures workers started (saw index {max_worker})"
    );
}

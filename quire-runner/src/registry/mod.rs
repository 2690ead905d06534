// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test registry: suites, tests, hooks, and modifiers collected from
//! registered test files.
//!
//! Each test file is a registration function run against a
//! [`FileCollector`], the load-time sandbox surface. Load is deterministic:
//! running the same
//! registration twice yields structurally identical suite trees, which is
//! what lets the controller and its workers agree on test identity.

mod collector;
mod suite;

pub use collector::*;
pub use suite::*;

use crate::{errors::LoadError, helpers::panic_message};
use camino::Utf8PathBuf;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Loads one test file by running its registration function inside the
/// collector sandbox. A panic during registration is captured as a
/// file-level [`LoadError`]; other files continue to load.
pub fn load_file(file: Utf8PathBuf, register: &(dyn Fn(&mut FileCollector) + Send + Sync)) -> FileSuite {
    let mut collector = FileCollector::new(file.clone());
    let result = catch_unwind(AssertUnwindSafe(|| register(&mut collector)));
    let suite = collector.finish();
    let error = result.err().map(|payload| LoadError {
        file: file.clone(),
        message: panic_message(payload.as_ref()),
        location: None,
    });
    FileSuite { file, suite, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TestContext;

    fn ok_body() -> impl TestBody {
        |_cx: TestContext| async move { Ok(()) }
    }

    fn register_sample(c: &mut FileCollector) {
        c.before_each(&[], ok_body());
        c.test("top level", ok_body());
        c.describe("group", |c| {
            c.test("inner one", ok_body());
            c.test("inner two", ok_body());
        });
    }

    #[test]
    fn collects_a_suite_tree() {
        let loaded = load_file("tests/sample.rs".into(), &register_sample);
        assert!(loaded.error.is_none());
        assert_eq!(loaded.suite.test_count(), 3);

        let mut titles = Vec::new();
        loaded.suite.walk_tests(|chain, test| {
            let path: Vec<_> = chain
                .iter()
                .filter(|s| !s.title.is_empty())
                .map(|s| s.title.clone())
                .collect();
            titles.push((path, test.title.clone()));
        });
        assert_eq!(
            titles,
            vec![
                (vec![], "top level".to_owned()),
                (vec!["group".to_owned()], "inner one".to_owned()),
                (vec!["group".to_owned()], "inner two".to_owned()),
            ]
        );
    }

    #[test]
    fn loading_twice_is_structurally_identical() {
        let a = load_file("tests/sample.rs".into(), &register_sample);
        let b = load_file("tests/sample.rs".into(), &register_sample);

        let shape = |file: &FileSuite| {
            let mut out = Vec::new();
            file.suite.walk_tests(|chain, test| {
                out.push((chain.len(), test.title.clone(), test.location.clone()));
            });
            out
        };
        assert_eq!(shape(&a), shape(&b));
    }

    #[test]
    fn only_prunes_siblings_at_load_completion() {
        let loaded = load_file("tests/focused.rs".into(), &|c: &mut FileCollector| {
            c.test("unmarked", ok_body());
            c.describe("group", |c| {
                c.test_only("focused", TestOptions::new(), ok_body());
                c.test("sibling", ok_body());
            });
        });
        assert!(loaded.error.is_none());
        let mut titles = Vec::new();
        loaded.suite.walk_tests(|_, test| titles.push(test.title.clone()));
        assert_eq!(titles, vec!["focused".to_owned()]);
    }

    #[test]
    fn only_suite_keeps_its_subtree() {
        let loaded = load_file("tests/focused.rs".into(), &|c: &mut FileCollector| {
            c.describe_only("kept", |c| {
                c.test("one", ok_body());
                c.test("two", ok_body());
            });
            c.test("dropped", ok_body());
        });
        let mut titles = Vec::new();
        loaded.suite.walk_tests(|_, test| titles.push(test.title.clone()));
        assert_eq!(titles, vec!["one".to_owned(), "two".to_owned()]);
    }

    #[test]
    fn registration_panic_becomes_a_load_error() {
        let loaded = load_file("tests/broken.rs".into(), &|c: &mut FileCollector| {
            c.test("before the panic", ok_body());
            panic!("bad registration");
        });
        let error = loaded.error.expect("panic must surface");
        assert_eq!(error.file, Utf8PathBuf::from("tests/broken.rs"));
        assert!(error.message.contains("bad registration"));
        // The partial tree up to the panic is kept.
        assert_eq!(loaded.suite.test_count(), 1);
    }

    #[test]
    fn open_describe_frames_survive_a_panic() {
        let loaded = load_file("tests/broken.rs".into(), &|c: &mut FileCollector| {
            c.describe("outer", |c| {
                c.test("registered", ok_body());
                panic!("mid-describe");
            });
        });
        assert!(loaded.error.is_some());
        assert_eq!(loaded.suite.test_count(), 1);
    }
}

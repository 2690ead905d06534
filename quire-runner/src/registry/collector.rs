// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::suite::{
    AllHookBody, Hook, HookBodyKind, HookKind, Modifier, Suite, SuiteItem, TestBody, TestCase,
    TestOptions,
};
use crate::helpers::SourceLocation;
use camino::Utf8PathBuf;
use std::sync::Arc;

/// The registration surface a test file sees.
///
/// One collector is open per file while its registration function runs; the
/// suite stack tracks nested `describe` calls. This is the only process-wide
/// mutable state of the load phase, and it is scoped to the collector
/// itself: nothing survives between files.
#[derive(Debug)]
pub struct FileCollector {
    file: Utf8PathBuf,
    stack: Vec<Suite>,
}

impl FileCollector {
    pub(crate) fn new(file: Utf8PathBuf) -> Self {
        Self {
            file,
            stack: vec![Suite::default()],
        }
    }

    /// The file being loaded.
    pub fn file(&self) -> &Utf8PathBuf {
        &self.file
    }

    fn current(&mut self) -> &mut Suite {
        self.stack.last_mut().expect("suite stack never empty")
    }

    /// Declares a test with no fixture dependencies or options.
    #[track_caller]
    pub fn test(&mut self, title: impl Into<String>, body: impl TestBody) {
        self.push_test(title.into(), TestOptions::new(), body, false, SourceLocation::caller());
    }

    /// Declares a test with options (fixture deps, timeout, tags,
    /// modifiers).
    #[track_caller]
    pub fn test_with(&mut self, title: impl Into<String>, options: TestOptions, body: impl TestBody) {
        self.push_test(title.into(), options, body, false, SourceLocation::caller());
    }

    /// Declares a focused test: when any `only` marker exists in a file,
    /// everything unmarked is pruned at load completion.
    #[track_caller]
    pub fn test_only(&mut self, title: impl Into<String>, options: TestOptions, body: impl TestBody) {
        self.push_test(title.into(), options, body, true, SourceLocation::caller());
    }

    fn push_test(
        &mut self,
        title: String,
        options: TestOptions,
        body: impl TestBody,
        only: bool,
        location: SourceLocation,
    ) {
        let test = TestCase {
            title,
            location,
            deps: options.deps,
            modifiers: options.modifiers,
            timeout: options.timeout,
            tags: options.tags,
            only,
            body: Arc::new(body),
        };
        self.current().children.push(SuiteItem::Test(test));
    }

    /// Opens a nested suite for the duration of `register`.
    #[track_caller]
    pub fn describe(&mut self, title: impl Into<String>, register: impl FnOnce(&mut Self)) {
        self.push_describe(title.into(), register, false, SourceLocation::caller());
    }

    /// A focused suite: keeps its whole subtree when `only` pruning runs.
    #[track_caller]
    pub fn describe_only(&mut self, title: impl Into<String>, register: impl FnOnce(&mut Self)) {
        self.push_describe(title.into(), register, true, SourceLocation::caller());
    }

    fn push_describe(
        &mut self,
        title: String,
        register: impl FnOnce(&mut Self),
        only: bool,
        location: SourceLocation,
    ) {
        self.stack.push(Suite {
            title,
            location: Some(location),
            only,
            ..Suite::default()
        });
        register(self);
        let suite = self.stack.pop().expect("matching push above");
        self.current().children.push(SuiteItem::Suite(suite));
    }

    /// Registers a `beforeAll` hook on the current suite. `deps` may name
    /// worker-scoped fixtures only.
    #[track_caller]
    pub fn before_all(&mut self, deps: &[&str], body: impl AllHookBody) {
        self.push_all_hook(HookKind::BeforeAll, deps, body, SourceLocation::caller());
    }

    /// Registers an `afterAll` hook on the current suite.
    #[track_caller]
    pub fn after_all(&mut self, deps: &[&str], body: impl AllHookBody) {
        self.push_all_hook(HookKind::AfterAll, deps, body, SourceLocation::caller());
    }

    fn push_all_hook(
        &mut self,
        kind: HookKind,
        deps: &[&str],
        body: impl AllHookBody,
        location: SourceLocation,
    ) {
        let hook = Hook {
            kind,
            deps: deps.iter().map(|s| (*s).to_owned()).collect(),
            location,
            body: HookBodyKind::All(Arc::new(body)),
        };
        self.current().hooks.push(hook);
    }

    /// Registers a `beforeEach` hook on the current suite.
    #[track_caller]
    pub fn before_each(&mut self, deps: &[&str], body: impl TestBody) {
        self.push_each_hook(HookKind::BeforeEach, deps, body, SourceLocation::caller());
    }

    /// Registers an `afterEach` hook on the current suite.
    #[track_caller]
    pub fn after_each(&mut self, deps: &[&str], body: impl TestBody) {
        self.push_each_hook(HookKind::AfterEach, deps, body, SourceLocation::caller());
    }

    fn push_each_hook(
        &mut self,
        kind: HookKind,
        deps: &[&str],
        body: impl TestBody,
        location: SourceLocation,
    ) {
        let hook = Hook {
            kind,
            deps: deps.iter().map(|s| (*s).to_owned()).collect(),
            location,
            body: HookBodyKind::Each(Arc::new(body)),
        };
        self.current().hooks.push(hook);
    }

    /// Attaches a modifier to the current suite; it applies to every
    /// contained test.
    pub fn modifier(&mut self, modifier: Modifier) {
        self.current().modifiers.push(modifier);
    }

    /// Skips every test in the current suite.
    #[track_caller]
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.modifier(Modifier::new(super::suite::ModifierKind::Skip).describe(reason));
    }

    /// Marks every test in the current suite as needing a fix.
    #[track_caller]
    pub fn fixme(&mut self, reason: impl Into<String>) {
        self.modifier(Modifier::new(super::suite::ModifierKind::Fixme).describe(reason));
    }

    /// Marks every test in the current suite as expected to fail.
    #[track_caller]
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.modifier(Modifier::new(super::suite::ModifierKind::Fail).describe(reason));
    }

    /// Triples the timeout of every test in the current suite.
    #[track_caller]
    pub fn slow(&mut self) {
        self.modifier(Modifier::new(super::suite::ModifierKind::Slow));
    }

    pub(crate) fn finish(mut self) -> Suite {
        // A panic during registration can leave describe frames open; fold
        // them back into their parents so the partial tree is coherent.
        while self.stack.len() > 1 {
            let suite = self.stack.pop().expect("len checked");
            self.current().children.push(SuiteItem::Suite(suite));
        }
        let mut root = self.stack.pop().expect("root frame");
        root.prune_only();
        root
    }
}

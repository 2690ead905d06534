// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    context::TestContext,
    errors::{BodyResult, LoadError},
    fixtures::FixtureArgs,
    helpers::SourceLocation,
};
use camino::Utf8PathBuf;
use futures::future::BoxFuture;
use std::{fmt, future::Future, sync::Arc, time::Duration};

/// A test body or `beforeEach`/`afterEach` hook body.
pub trait TestBody: Send + Sync + 'static {
    /// Runs the body.
    fn run(&self, cx: TestContext) -> BoxFuture<'static, BodyResult>;
}

impl<F, Fut> TestBody for F
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BodyResult> + Send + 'static,
{
    fn run(&self, cx: TestContext) -> BoxFuture<'static, BodyResult> {
        Box::pin(self(cx))
    }
}

/// A `beforeAll`/`afterAll` hook body: runs once per worker, with access to
/// worker-scoped fixtures only.
pub trait AllHookBody: Send + Sync + 'static {
    /// Runs the hook.
    fn run(&self, args: FixtureArgs) -> BoxFuture<'static, BodyResult>;
}

impl<F, Fut> AllHookBody for F
where
    F: Fn(FixtureArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BodyResult> + Send + 'static,
{
    fn run(&self, args: FixtureArgs) -> BoxFuture<'static, BodyResult> {
        Box::pin(self(args))
    }
}

/// The four hook positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// Once per worker, before the first test of a suite.
    BeforeAll,
    /// Once per worker, after the last test of a suite.
    AfterAll,
    /// Before every test.
    BeforeEach,
    /// After every test.
    AfterEach,
}

#[derive(Clone)]
pub(crate) enum HookBodyKind {
    All(Arc<dyn AllHookBody>),
    Each(Arc<dyn TestBody>),
}

/// A hook registered inside a suite.
#[derive(Clone)]
pub struct Hook {
    /// Which position the hook runs at.
    pub kind: HookKind,
    /// Fixture names the hook consumes.
    pub deps: Vec<String>,
    /// Registration location.
    pub location: SourceLocation,
    pub(crate) body: HookBodyKind,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("deps", &self.deps)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// The declarative modifier kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifierKind {
    /// Don't run the test; expect `skipped`.
    Skip,
    /// Like skip, with "needs a fix" semantics.
    Fixme,
    /// Run the test and expect it to fail.
    Fail,
    /// Triple the timeout.
    Slow,
    /// Passing on a retry is the expected behavior.
    Flaky,
}

impl ModifierKind {
    pub(crate) fn annotation_name(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Fixme => "fixme",
            Self::Fail => "fail",
            Self::Slow => "slow",
            Self::Flaky => "flaky",
        }
    }
}

/// When a modifier applies.
#[derive(Clone)]
pub enum ModifierCondition {
    /// Unconditionally.
    Always,
    /// Decided at declaration time.
    Value(bool),
    /// Decided in the worker, with access to fixture values named in the
    /// modifier's `deps`.
    Fixtures(Arc<dyn Fn(&FixtureArgs) -> bool + Send + Sync>),
}

impl fmt::Debug for ModifierCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Value(v) => write!(f, "Value({v})"),
            Self::Fixtures(_) => write!(f, "Fixtures(..)"),
        }
    }
}

/// A declarative annotation attached to a test or suite.
#[derive(Clone, Debug)]
pub struct Modifier {
    /// The kind.
    pub kind: ModifierKind,
    /// Optional reason, surfaced as an annotation.
    pub description: Option<String>,
    /// The condition under which the modifier applies.
    pub condition: ModifierCondition,
    /// Fixture names a `Fixtures` condition consumes.
    pub deps: Vec<String>,
    /// Registration location.
    pub location: SourceLocation,
}

impl Modifier {
    /// An unconditional modifier.
    #[track_caller]
    pub fn new(kind: ModifierKind) -> Self {
        Self {
            kind,
            description: None,
            condition: ModifierCondition::Always,
            deps: Vec::new(),
            location: SourceLocation::caller(),
        }
    }

    /// Attaches a reason.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Applies the modifier only when `value` is true.
    pub fn when(mut self, value: bool) -> Self {
        self.condition = ModifierCondition::Value(value);
        self
    }

    /// Applies the modifier when the condition, evaluated in the worker with
    /// the named fixture values, returns true.
    pub fn when_fixtures<F>(mut self, deps: &[&str], condition: F) -> Self
    where
        F: Fn(&FixtureArgs) -> bool + Send + Sync + 'static,
    {
        self.deps = deps.iter().map(|s| (*s).to_owned()).collect();
        self.condition = ModifierCondition::Fixtures(Arc::new(condition));
        self
    }
}

/// Options accepted by `test_with`.
#[derive(Clone, Debug, Default)]
pub struct TestOptions {
    /// Fixture names the body consumes.
    pub deps: Vec<String>,
    /// Per-test timeout override.
    pub timeout: Option<Duration>,
    /// Tags for filtering and reports.
    pub tags: Vec<String>,
    /// Modifiers attached to this test.
    pub modifiers: Vec<Modifier>,
}

impl TestOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the fixture names the body consumes.
    pub fn deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Overrides the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds tags.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Attaches a modifier.
    pub fn modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Shorthand for an unconditional skip.
    #[track_caller]
    pub fn skip(self, reason: impl Into<String>) -> Self {
        self.modifier(Modifier::new(ModifierKind::Skip).describe(reason))
    }

    /// Shorthand for an unconditional fixme.
    #[track_caller]
    pub fn fixme(self, reason: impl Into<String>) -> Self {
        self.modifier(Modifier::new(ModifierKind::Fixme).describe(reason))
    }

    /// Shorthand for an expected failure.
    #[track_caller]
    pub fn fail(self, reason: impl Into<String>) -> Self {
        self.modifier(Modifier::new(ModifierKind::Fail).describe(reason))
    }

    /// Shorthand for a slow test (tripled timeout).
    #[track_caller]
    pub fn slow(self) -> Self {
        self.modifier(Modifier::new(ModifierKind::Slow))
    }

    /// Shorthand for a known-flaky test.
    #[track_caller]
    pub fn flaky(self) -> Self {
        self.modifier(Modifier::new(ModifierKind::Flaky))
    }
}

/// A single registered test.
#[derive(Clone)]
pub struct TestCase {
    /// The title.
    pub title: String,
    /// Declaration location.
    pub location: SourceLocation,
    /// Fixture names the body consumes.
    pub deps: Vec<String>,
    /// Modifiers attached directly to the test.
    pub modifiers: Vec<Modifier>,
    /// Timeout override.
    pub timeout: Option<Duration>,
    /// Tags.
    pub tags: Vec<String>,
    /// Marked `only`.
    pub only: bool,
    pub(crate) body: Arc<dyn TestBody>,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("title", &self.title)
            .field("location", &self.location)
            .field("deps", &self.deps)
            .field("only", &self.only)
            .finish_non_exhaustive()
    }
}

/// A child of a suite.
#[derive(Clone, Debug)]
pub enum SuiteItem {
    /// A nested suite.
    Suite(Suite),
    /// A test.
    Test(TestCase),
}

/// A suite node. The root suite of a file has an empty title.
#[derive(Clone, Debug, Default)]
pub struct Suite {
    /// The suite title.
    pub title: String,
    /// Declaration location; absent for file roots.
    pub location: Option<SourceLocation>,
    /// Hooks registered directly in this suite.
    pub hooks: Vec<Hook>,
    /// Modifiers that apply to every contained test.
    pub modifiers: Vec<Modifier>,
    /// Marked `only`.
    pub only: bool,
    /// Children in declaration order.
    pub children: Vec<SuiteItem>,
}

impl Suite {
    /// True if this suite or any descendant carries an `only` marker.
    pub fn contains_only(&self) -> bool {
        if self.only {
            return true;
        }
        self.children.iter().any(|child| match child {
            SuiteItem::Suite(suite) => suite.contains_only(),
            SuiteItem::Test(test) => test.only,
        })
    }

    /// The first `only` marker's location, for `--forbid-only` diagnostics.
    pub fn first_only_location(&self) -> Option<SourceLocation> {
        if self.only {
            return self.location.clone();
        }
        for child in &self.children {
            match child {
                SuiteItem::Suite(suite) => {
                    if let Some(loc) = suite.first_only_location() {
                        return Some(loc);
                    }
                }
                SuiteItem::Test(test) => {
                    if test.only {
                        return Some(test.location.clone());
                    }
                }
            }
        }
        None
    }

    /// Prunes siblings of `only`-marked entries. No-op when the tree has no
    /// `only` markers. An `only` suite keeps its entire subtree.
    pub fn prune_only(&mut self) {
        if !self.contains_only() || self.only {
            return;
        }
        self.children.retain_mut(|child| match child {
            SuiteItem::Test(test) => test.only,
            SuiteItem::Suite(suite) => {
                if suite.only {
                    true
                } else if suite.contains_only() {
                    suite.prune_only();
                    true
                } else {
                    false
                }
            }
        });
    }

    /// Visits every test with its suite path and the modifier/hook chain of
    /// its ancestors (outermost first).
    pub fn walk_tests<'a>(&'a self, mut visit: impl FnMut(&[&'a Suite], &'a TestCase)) {
        fn inner<'a>(
            suite: &'a Suite,
            chain: &mut Vec<&'a Suite>,
            visit: &mut impl FnMut(&[&'a Suite], &'a TestCase),
        ) {
            chain.push(suite);
            for child in &suite.children {
                match child {
                    SuiteItem::Test(test) => visit(chain, test),
                    SuiteItem::Suite(nested) => inner(nested, chain, visit),
                }
            }
            chain.pop();
        }
        let mut chain = Vec::new();
        inner(self, &mut chain, &mut visit);
    }

    /// Number of tests in the subtree.
    pub fn test_count(&self) -> usize {
        let mut count = 0;
        self.walk_tests(|_, _| count += 1);
        count
    }
}

/// A loaded test file: its suite tree, or the error that interrupted load.
#[derive(Debug)]
pub struct FileSuite {
    /// The registered file path, repo-relative.
    pub file: Utf8PathBuf,
    /// The root suite. Partial if `error` is set.
    pub suite: Suite,
    /// The load error, if registration panicked or misused the collector.
    pub error: Option<LoadError>,
}

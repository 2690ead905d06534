// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{BodyResult, FixtureError},
    helpers::SourceLocation,
};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{any::Any, fmt, future::Future, sync::Arc};
use tokio::sync::{Notify, oneshot};

/// The lifetime of a fixture value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixtureScope {
    /// Built once per worker process and reused across its tests.
    Worker,
    /// Built fresh for every test.
    Test,
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// A resolved fixture value: type-erased and shared.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// The resolved dependency values handed to a body, keyed by fixture name.
///
/// Only names declared in the consumer's dependency list are present;
/// requesting anything else is diagnosed with the consumer's registration
/// location.
pub struct FixtureArgs {
    values: IndexMap<String, FixtureValue>,
    requester: String,
    location: SourceLocation,
}

impl FixtureArgs {
    pub(crate) fn new(
        values: IndexMap<String, FixtureValue>,
        requester: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        Self {
            values,
            requester: requester.into(),
            location,
        }
    }

    /// An empty argument set, for consumers with no dependencies.
    pub(crate) fn empty(requester: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(IndexMap::new(), requester, location)
    }

    /// Fetches a dependency value, downcast to `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, FixtureError> {
        let value = self.raw(name)?;
        value
            .clone()
            .downcast::<T>()
            .map_err(|_| FixtureError::TypeMismatch {
                name: name.to_owned(),
                requested: std::any::type_name::<T>(),
            })
    }

    /// Fetches a parameter value as JSON.
    pub fn param(&self, name: &str) -> Result<serde_json::Value, FixtureError> {
        self.get::<serde_json::Value>(name).map(|v| (*v).clone())
    }

    /// Fetches the type-erased value.
    pub fn raw(&self, name: &str) -> Result<&FixtureValue, FixtureError> {
        self.values
            .get(name)
            .ok_or_else(|| FixtureError::UndeclaredDependency {
                name: name.to_owned(),
                requester: self.requester.clone(),
                location: self.location.clone(),
            })
    }

    /// Names available to this consumer, in resolution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl fmt::Debug for FixtureArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureArgs")
            .field("requester", &self.requester)
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The handle through which a fixture body publishes its value.
///
/// `supply` sends the value to the consumer and suspends the body until the
/// owning scope tears down; code after the `supply(...).await` is the
/// teardown phase.
pub struct FixtureHandle {
    name: String,
    value_tx: Option<oneshot::Sender<FixtureValue>>,
    release: Arc<Notify>,
}

impl FixtureHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        value_tx: oneshot::Sender<FixtureValue>,
        release: Arc<Notify>,
    ) -> Self {
        Self {
            name: name.into(),
            value_tx: Some(value_tx),
            release,
        }
    }

    /// Publishes the fixture value and waits for the owning scope to end.
    pub async fn supply<T: Send + Sync + 'static>(&mut self, value: T) -> BodyResult {
        self.supply_value(Arc::new(value)).await
    }

    /// Like [`supply`](Self::supply), for an already type-erased value.
    pub async fn supply_value(&mut self, value: FixtureValue) -> BodyResult {
        let tx = self.value_tx.take().ok_or_else(|| {
            format!("fixture `{}` supplied a value twice", self.name)
        })?;
        if tx.send(value).is_err() {
            // The consumer is gone; proceed straight to teardown.
            return Ok(());
        }
        self.release.notified().await;
        Ok(())
    }
}

impl fmt::Debug for FixtureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureHandle")
            .field("name", &self.name)
            .field("supplied", &self.value_tx.is_none())
            .finish()
    }
}

/// A fixture body: async setup/yield/teardown.
pub trait FixtureBody: Send + Sync + 'static {
    /// Runs the body to completion (setup, supply, teardown).
    fn run(&self, args: FixtureArgs, handle: FixtureHandle) -> BoxFuture<'static, BodyResult>;
}

impl<F, Fut> FixtureBody for F
where
    F: Fn(FixtureArgs, FixtureHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BodyResult> + Send + 'static,
{
    fn run(&self, args: FixtureArgs, handle: FixtureHandle) -> BoxFuture<'static, BodyResult> {
        Box::pin(self(args, handle))
    }
}

#[derive(Clone)]
pub(crate) enum FixtureKind {
    /// A user-supplied body.
    Body(Arc<dyn FixtureBody>),
    /// A parameter: the value comes from configuration or the command line.
    Parameter {
        default: Option<serde_json::Value>,
    },
}

impl fmt::Debug for FixtureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(_) => write!(f, "Body(..)"),
            Self::Parameter { default } => {
                f.debug_struct("Parameter").field("default", default).finish()
            }
        }
    }
}

/// A single fixture definition: one layer of a name's override chain.
#[derive(Clone, Debug)]
pub struct FixtureDef {
    pub(crate) name: String,
    pub(crate) scope: FixtureScope,
    pub(crate) auto: bool,
    pub(crate) deps: Vec<String>,
    pub(crate) description: Option<String>,
    pub(crate) kind: FixtureKind,
    pub(crate) registered_at: SourceLocation,
}

impl FixtureDef {
    /// Creates a definition with the given body.
    #[track_caller]
    pub fn new(
        name: impl Into<String>,
        scope: FixtureScope,
        body: impl FixtureBody,
    ) -> Self {
        Self {
            name: name.into(),
            scope,
            auto: false,
            deps: Vec::new(),
            description: None,
            kind: FixtureKind::Body(Arc::new(body)),
            registered_at: SourceLocation::caller(),
        }
    }

    /// Creates a parameter definition. Parameters are worker-scoped fixtures
    /// whose value is supplied by the configuration or the command line.
    #[track_caller]
    pub fn parameter(
        name: impl Into<String>,
        description: impl Into<String>,
        default: Option<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            scope: FixtureScope::Worker,
            auto: false,
            deps: Vec::new(),
            description: Some(description.into()),
            kind: FixtureKind::Parameter { default },
            registered_at: SourceLocation::caller(),
        }
    }

    /// Declares the fixture names this body consumes.
    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Marks the fixture automatic: it joins the dependency closure of every
    /// test (test scope) or every worker (worker scope) without being named.
    pub fn automatic(mut self) -> Self {
        self.auto = true;
        self
    }

    /// Attaches a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The fixture name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fixture scope.
    pub fn scope(&self) -> FixtureScope {
        self.scope
    }

    /// True for parameter definitions.
    pub fn is_parameter(&self) -> bool {
        matches!(self.kind, FixtureKind::Parameter { .. })
    }

    pub(crate) fn default_value(&self) -> Option<&serde_json::Value> {
        match &self.kind {
            FixtureKind::Parameter { default } => default.as_ref(),
            FixtureKind::Body(_) => None,
        }
    }
}

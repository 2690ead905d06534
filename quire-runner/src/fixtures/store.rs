// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    def::{FixtureArgs, FixtureHandle, FixtureKind, FixtureScope, FixtureValue},
    graph::{FixtureKey, FixtureRegistry},
};
use crate::{
    errors::{BodyResult, ErrorList, FixtureError},
    helpers::panic_message,
};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::{
    sync::{Notify, oneshot},
    task::JoinHandle,
};
use tracing::debug;

/// Lifecycle of a single fixture instance.
///
/// `Pending` is the implicit state of a definition with no instance yet; an
/// instance enters the store in `SettingUp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InstanceState {
    SettingUp,
    Active,
    TearingDown,
    Done,
    Errored,
}

pub(crate) struct FixtureInstance {
    name: String,
    state: InstanceState,
    value: Option<FixtureValue>,
    release: Arc<Notify>,
    task: Option<JoinHandle<BodyResult>>,
}

/// Live fixture values for one scope.
///
/// Creation is lazy and driven by the worker runtime; instances are kept in
/// creation order and torn down in reverse.
pub(crate) struct FixtureStore {
    scope: FixtureScope,
    instances: IndexMap<FixtureKey, FixtureInstance>,
}

impl FixtureStore {
    pub(crate) fn new(scope: FixtureScope) -> Self {
        Self {
            scope,
            instances: IndexMap::new(),
        }
    }

    pub(crate) fn scope(&self) -> FixtureScope {
        self.scope
    }

    pub(crate) fn contains(&self, key: &FixtureKey) -> bool {
        self.instances.contains_key(key)
    }

    /// The value of an active instance.
    pub(crate) fn value(&self, key: &FixtureKey) -> Option<FixtureValue> {
        let instance = self.instances.get(key)?;
        match instance.state {
            InstanceState::Active => instance.value.clone(),
            _ => None,
        }
    }

    /// Instantiates one fixture. Dependency values must already be resolved;
    /// `param_value` carries the configured value for parameter fixtures.
    ///
    /// On success the instance is `Active` and its value is available. On
    /// failure an `Errored` record remains in the store so that teardown
    /// accounting stays consistent.
    pub(crate) async fn setup(
        &mut self,
        registry: &FixtureRegistry,
        key: &FixtureKey,
        dep_values: IndexMap<String, FixtureValue>,
        param_value: Option<serde_json::Value>,
    ) -> Result<(), FixtureError> {
        debug_assert!(!self.contains(key), "fixture instantiated twice");
        let def = registry.def(key);
        debug_assert_eq!(def.scope, self.scope, "fixture set up in the wrong store");
        let name = def.name.clone();
        debug!(fixture = %name, layer = key.layer, scope = %self.scope, "setting up fixture");

        match &def.kind {
            FixtureKind::Parameter { default } => {
                let value = match param_value.or_else(|| default.clone()) {
                    Some(value) => value,
                    None => {
                        return Err(FixtureError::MissingParameterValue { name });
                    }
                };
                self.instances.insert(
                    key.clone(),
                    FixtureInstance {
                        name,
                        state: InstanceState::Active,
                        value: Some(Arc::new(value) as FixtureValue),
                        release: Arc::new(Notify::new()),
                        task: None,
                    },
                );
                Ok(())
            }
            FixtureKind::Body(body) => {
                let (value_tx, value_rx) = oneshot::channel();
                let release = Arc::new(Notify::new());
                let handle = FixtureHandle::new(name.clone(), value_tx, release.clone());
                let args = FixtureArgs::new(
                    dep_values,
                    format!("fixture `{name}`"),
                    def.registered_at.clone(),
                );
                let task = tokio::spawn(body.run(args, handle));

                self.instances.insert(
                    key.clone(),
                    FixtureInstance {
                        name: name.clone(),
                        state: InstanceState::SettingUp,
                        value: None,
                        release,
                        task: Some(task),
                    },
                );
                let instance = &mut self.instances[key];

                match value_rx.await {
                    Ok(value) => {
                        instance.value = Some(value);
                        instance.state = InstanceState::Active;
                        Ok(())
                    }
                    Err(_) => {
                        // The body finished without supplying a value. Join
                        // the task to find out why.
                        instance.state = InstanceState::Errored;
                        let task = instance.task.take().expect("task set at creation");
                        match task.await {
                            Ok(Ok(())) => Err(FixtureError::NeverSupplied { name }),
                            Ok(Err(source)) => Err(FixtureError::SetupFailed { name, source }),
                            Err(join_error) if join_error.is_panic() => {
                                let payload = join_error.into_panic();
                                Err(FixtureError::Panicked {
                                    name,
                                    message: panic_message(payload.as_ref()),
                                })
                            }
                            Err(join_error) => Err(FixtureError::SetupFailed {
                                name,
                                source: Box::new(join_error),
                            }),
                        }
                    }
                }
            }
        }
    }

    /// Tears down every instance in reverse creation order. A failing
    /// teardown is recorded and does not stop the teardown of siblings.
    pub(crate) async fn teardown(&mut self) -> ErrorList {
        let mut errors = ErrorList::new();
        while let Some((key, mut instance)) = self.instances.pop() {
            match instance.state {
                InstanceState::Active => {}
                // Errored setups already reported; nothing is running.
                _ => continue,
            }
            debug!(fixture = %instance.name, layer = key.layer, "tearing down fixture");
            instance.state = InstanceState::TearingDown;
            // Drop our copy of the value first so teardown observes the
            // consumer side released.
            instance.value = None;
            instance.release.notify_one();
            let Some(task) = instance.task.take() else {
                // Parameters have no body.
                continue;
            };
            match task.await {
                Ok(Ok(())) => {
                    instance.state = InstanceState::Done;
                }
                Ok(Err(error)) => {
                    instance.state = InstanceState::Errored;
                    errors.push(
                        format!("teardown of fixture `{}` failed: {error}", instance.name).into(),
                    );
                }
                Err(join_error) => {
                    instance.state = InstanceState::Errored;
                    let message = if join_error.is_panic() {
                        panic_message(join_error.into_panic().as_ref())
                    } else {
                        join_error.to_string()
                    };
                    errors.push(
                        format!("teardown of fixture `{}` panicked: {message}", instance.name)
                            .into(),
                    );
                }
            }
        }
        errors
    }

    /// Number of live instances.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{AutoFixtures, FixtureDef, FixtureSet};
    use crate::helpers::SourceLocation;
    use std::sync::Mutex;

    fn registry_of(defs: Vec<FixtureDef>) -> FixtureRegistry {
        let mut set = FixtureSet::new();
        for def in defs {
            set.extend(def).unwrap();
        }
        FixtureRegistry::build(set).unwrap()
    }

    /// Drives setup for the closure of `roots` against a single store,
    /// mirroring what the worker runtime does with two scopes.
    async fn setup_all(
        registry: &FixtureRegistry,
        store: &mut FixtureStore,
        roots: &[String],
    ) -> Result<(), FixtureError> {
        let keys = registry
            .closure(roots, AutoFixtures::All, "test", &SourceLocation::default())
            .unwrap();
        for key in keys {
            if store.contains(&key) {
                continue;
            }
            let mut dep_values = IndexMap::new();
            for dep_key in registry.dep_keys(&key) {
                let value = store.value(&dep_key).expect("deps set up first");
                dep_values.insert(dep_key.name.clone(), value);
            }
            store.setup(registry, &key, dep_values, None).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn setup_supply_teardown_round_trip() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let log_for_def = log.clone();
        let registry = registry_of(vec![FixtureDef::new(
            "value",
            FixtureScope::Test,
            move |_args, mut handle: FixtureHandle| {
                let log = log_for_def.clone();
                async move {
                    log.lock().unwrap().push("setup".to_owned());
                    handle.supply(42u32).await?;
                    log.lock().unwrap().push("teardown".to_owned());
                    Ok(())
                }
            },
        )]);

        let mut store = FixtureStore::new(FixtureScope::Test);
        setup_all(&registry, &mut store, &["value".to_owned()])
            .await
            .unwrap();

        let key = registry.top_key("value");
        let value = store.value(&key).unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 42);
        assert_eq!(log.lock().unwrap().as_slice(), ["setup"]);

        let errors = store.teardown().await;
        assert!(errors.is_empty(), "unexpected teardown errors: {errors}");
        assert_eq!(log.lock().unwrap().as_slice(), ["setup", "teardown"]);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn override_sees_previous_binding() {
        let mut set = FixtureSet::new();
        set.extend(FixtureDef::new(
            "f",
            FixtureScope::Test,
            |_args, mut handle: FixtureHandle| async move {
                handle.supply("base".to_owned()).await
            },
        ))
        .unwrap();
        for suffix in ["-1", "-2"] {
            set.override_with(
                FixtureDef::new(
                    "f",
                    FixtureScope::Test,
                    move |args: FixtureArgs, mut handle: FixtureHandle| async move {
                        let prev = args.get::<String>("f")?;
                        handle.supply(format!("{prev}{suffix}")).await
                    },
                )
                .with_deps(&["f"]),
            )
            .unwrap();
        }
        let registry = FixtureRegistry::build(set).unwrap();

        let mut store = FixtureStore::new(FixtureScope::Test);
        setup_all(&registry, &mut store, &["f".to_owned()])
            .await
            .unwrap();

        let value = store
            .value(&registry.top_key("f"))
            .unwrap()
            .downcast::<String>()
            .unwrap();
        assert_eq!(*value, "base-1-2");
        store.teardown().await;
    }

    #[tokio::test]
    async fn setup_failure_is_reported_and_siblings_torn_down() {
        let torn_down = Arc::new(Mutex::new(false));
        let torn_down_in_def = torn_down.clone();
        let registry = registry_of(vec![
            FixtureDef::new("ok", FixtureScope::Test, move |_args, mut handle: FixtureHandle| {
                let torn_down = torn_down_in_def.clone();
                async move {
                    handle.supply(()).await?;
                    *torn_down.lock().unwrap() = true;
                    Ok(())
                }
            }),
            FixtureDef::new("bad", FixtureScope::Test, |_args, _handle| async move {
                Err("setup exploded".into())
            })
            .with_deps(&["ok"]),
        ]);

        let mut store = FixtureStore::new(FixtureScope::Test);
        let err = setup_all(
            &registry,
            &mut store,
            &["bad".to_owned()],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FixtureError::SetupFailed { name, .. } if name == "bad"));

        // The sibling that reached Active still gets torn down.
        let errors = store.teardown().await;
        assert!(errors.is_empty());
        assert!(*torn_down.lock().unwrap());
    }

    #[tokio::test]
    async fn body_without_supply_is_diagnosed() {
        let registry = registry_of(vec![FixtureDef::new(
            "lazy",
            FixtureScope::Test,
            |_args, _handle| async move { Ok(()) },
        )]);
        let mut store = FixtureStore::new(FixtureScope::Test);
        let err = setup_all(&registry, &mut store, &["lazy".to_owned()])
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::NeverSupplied { name } if name == "lazy"));
    }

    #[tokio::test]
    async fn teardown_error_does_not_abort_siblings() {
        let second_done = Arc::new(Mutex::new(false));
        let second_done_in_def = second_done.clone();
        let registry = registry_of(vec![
            FixtureDef::new("first", FixtureScope::Test, move |_args, mut handle: FixtureHandle| {
                let done = second_done_in_def.clone();
                async move {
                    handle.supply(()).await?;
                    *done.lock().unwrap() = true;
                    Ok(())
                }
            }),
            FixtureDef::new("second", FixtureScope::Test, |_args, mut handle: FixtureHandle| async move {
                handle.supply(()).await?;
                Err("teardown exploded".into())
            }),
        ]);

        let mut store = FixtureStore::new(FixtureScope::Test);
        setup_all(
            &registry,
            &mut store,
            &["first".to_owned(), "second".to_owned()],
        )
        .await
        .unwrap();

        let errors = store.teardown().await;
        assert_eq!(errors.len(), 1);
        assert!(*second_done.lock().unwrap());
    }
}

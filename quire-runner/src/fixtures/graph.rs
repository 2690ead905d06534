// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    def::{FixtureDef, FixtureScope},
    set::FixtureSet,
};
use crate::{errors::FixtureError, helpers::SourceLocation};
use indexmap::{IndexMap, IndexSet};

/// Identifies one layer of one fixture's override chain.
///
/// Layer 0 is the base definition; higher layers are overrides in
/// registration order. An override depending on its own name resolves to the
/// layer below it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FixtureKey {
    pub(crate) name: String,
    pub(crate) layer: usize,
}

impl FixtureKey {
    fn new(name: impl Into<String>, layer: usize) -> Self {
        Self {
            name: name.into(),
            layer,
        }
    }
}

/// Which automatic fixtures to pull into a closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AutoFixtures {
    /// Worker-scoped automatics only (building a worker scope).
    WorkerOnly,
    /// All automatics (building a test scope).
    All,
}

/// A validated fixture graph.
///
/// Construction checks for missing bases, scope-changing overrides, unknown
/// dependencies, worker-on-test dependencies, and cycles. After that,
/// resolution can no longer fail structurally.
#[derive(Clone, Debug, Default)]
pub struct FixtureRegistry {
    /// name -> override chain, base first. Chains are non-empty.
    fixtures: IndexMap<String, Vec<FixtureDef>>,
}

impl FixtureRegistry {
    /// Validates a fixture set into a registry.
    pub fn build(set: FixtureSet) -> Result<Self, FixtureError> {
        let mut fixtures = IndexMap::with_capacity(set.entries.len());
        for (name, chain) in set.entries {
            let Some(base) = chain.base else {
                let location = chain
                    .overrides
                    .first()
                    .map(|def| def.registered_at.clone())
                    .unwrap_or_default();
                return Err(FixtureError::OverrideWithoutBase { name, location });
            };
            let scope = base.scope;
            let mut layers = vec![base];
            for def in chain.overrides {
                if def.scope != scope {
                    return Err(FixtureError::ScopeMismatchOnOverride {
                        name,
                        base_scope: scope,
                        override_scope: def.scope,
                    });
                }
                layers.push(def);
            }
            fixtures.insert(name, layers);
        }

        let registry = Self { fixtures };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), FixtureError> {
        // Dependency existence and the scope rule.
        for layers in self.fixtures.values() {
            for (layer, def) in layers.iter().enumerate() {
                for dep in &def.deps {
                    if dep == &def.name {
                        if layer == 0 {
                            return Err(FixtureError::DependencyCycle {
                                path: vec![def.name.clone(), def.name.clone()],
                            });
                        }
                        continue;
                    }
                    let Some(dep_layers) = self.fixtures.get(dep) else {
                        return Err(FixtureError::UnknownFixture {
                            name: dep.clone(),
                            requester: format!("fixture `{}`", def.name),
                            location: def.registered_at.clone(),
                        });
                    };
                    let dep_scope = dep_layers[0].scope;
                    if def.scope == FixtureScope::Worker && dep_scope == FixtureScope::Test {
                        return Err(FixtureError::WorkerOnTestDep {
                            worker_fixture: def.name.clone(),
                            test_fixture: dep.clone(),
                        });
                    }
                }
            }
        }

        // Cycle detection over keys. Self-references are resolved layer-wise
        // above, so a cycle here always involves at least two names.
        let mut done = IndexSet::new();
        for name in self.fixtures.keys() {
            let mut on_stack = IndexSet::new();
            self.cycle_check(&self.top_key(name), &mut on_stack, &mut done)?;
        }
        Ok(())
    }

    fn cycle_check(
        &self,
        key: &FixtureKey,
        on_stack: &mut IndexSet<FixtureKey>,
        done: &mut IndexSet<FixtureKey>,
    ) -> Result<(), FixtureError> {
        if done.contains(key) {
            return Ok(());
        }
        if !on_stack.insert(key.clone()) {
            let mut path: Vec<String> = on_stack
                .iter()
                .skip_while(|k| *k != key)
                .map(|k| k.name.clone())
                .collect();
            path.push(key.name.clone());
            return Err(FixtureError::DependencyCycle { path });
        }
        for dep in self.dep_keys(key) {
            self.cycle_check(&dep, on_stack, done)?;
        }
        on_stack.shift_remove(key);
        done.insert(key.clone());
        Ok(())
    }

    /// The topmost (effective) key for a name.
    pub(crate) fn top_key(&self, name: &str) -> FixtureKey {
        let layers = &self.fixtures[name];
        FixtureKey::new(name, layers.len() - 1)
    }

    /// The definition for a key.
    pub(crate) fn def(&self, key: &FixtureKey) -> &FixtureDef {
        &self.fixtures[&key.name][key.layer]
    }

    /// The effective definition for a name.
    pub fn effective(&self, name: &str) -> Option<&FixtureDef> {
        self.fixtures.get(name).map(|layers| {
            layers
                .last()
                .expect("chains are non-empty by construction")
        })
    }

    /// The scope of a name, if defined.
    pub fn scope_of(&self, name: &str) -> Option<FixtureScope> {
        self.fixtures.get(name).map(|layers| layers[0].scope)
    }

    /// True if `name` is defined.
    pub fn contains(&self, name: &str) -> bool {
        self.fixtures.contains_key(name)
    }

    /// Names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fixtures.keys().map(String::as_str)
    }

    /// Base definitions of all parameters, in insertion order.
    pub fn parameters(&self) -> impl Iterator<Item = &FixtureDef> {
        self.fixtures
            .values()
            .map(|layers| &layers[0])
            .filter(|def| def.is_parameter())
    }

    /// Dependency keys of a key, in declaration order.
    pub(crate) fn dep_keys(&self, key: &FixtureKey) -> Vec<FixtureKey> {
        self.def(key)
            .deps
            .iter()
            .map(|dep| {
                if dep == &key.name {
                    FixtureKey::new(dep.clone(), key.layer - 1)
                } else {
                    self.top_key(dep)
                }
            })
            .collect()
    }

    /// Computes the setup order for the given root names plus automatics:
    /// a topological order with dependencies first, stable under the
    /// insertion order of definitions.
    ///
    /// Unknown root names are diagnosed with the consumer's identity.
    pub(crate) fn closure(
        &self,
        roots: &[String],
        auto: AutoFixtures,
        requester: &str,
        location: &SourceLocation,
    ) -> Result<Vec<FixtureKey>, FixtureError> {
        let mut order = Vec::new();
        let mut visited = IndexSet::new();

        for def in self.fixtures.values().map(|layers| &layers[0]) {
            let include = def.auto
                && match auto {
                    AutoFixtures::WorkerOnly => def.scope == FixtureScope::Worker,
                    AutoFixtures::All => true,
                };
            if include {
                self.visit(&self.top_key(&def.name), &mut visited, &mut order);
            }
        }

        for root in roots {
            if !self.fixtures.contains_key(root) {
                return Err(FixtureError::UnknownFixture {
                    name: root.clone(),
                    requester: requester.to_owned(),
                    location: location.clone(),
                });
            }
            self.visit(&self.top_key(root), &mut visited, &mut order);
        }
        Ok(order)
    }

    /// The set of names in the closure of `roots` plus automatics. Used at
    /// list-build time to decide which parameters apply to a test.
    pub(crate) fn closure_names(
        &self,
        roots: &[String],
        auto: AutoFixtures,
        requester: &str,
        location: &SourceLocation,
    ) -> Result<IndexSet<String>, FixtureError> {
        Ok(self
            .closure(roots, auto, requester, location)?
            .into_iter()
            .map(|key| key.name)
            .collect())
    }

    fn visit(&self, key: &FixtureKey, visited: &mut IndexSet<FixtureKey>, order: &mut Vec<FixtureKey>) {
        if visited.contains(key) {
            return;
        }
        visited.insert(key.clone());
        for dep in self.dep_keys(key) {
            self.visit(&dep, visited, order);
        }
        order.push(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureArgs, FixtureHandle};

    fn def(name: &str, scope: FixtureScope, deps: &[&str]) -> FixtureDef {
        FixtureDef::new(name, scope, |_args: FixtureArgs, mut handle: FixtureHandle| {
            async move { handle.supply(()).await }
        })
        .with_deps(deps)
    }

    fn registry(defs: Vec<FixtureDef>) -> Result<FixtureRegistry, FixtureError> {
        let mut set = FixtureSet::new();
        for d in defs {
            set.extend(d)?;
        }
        FixtureRegistry::build(set)
    }

    #[test]
    fn topological_order_is_deps_first_and_stable() {
        let registry = registry(vec![
            def("c", FixtureScope::Test, &["a", "b"]),
            def("a", FixtureScope::Test, &[]),
            def("b", FixtureScope::Test, &["a"]),
        ])
        .unwrap();

        let order = registry
            .closure(
                &["c".to_owned()],
                AutoFixtures::All,
                "test",
                &SourceLocation::default(),
            )
            .unwrap();
        let names: Vec<_> = order.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = registry(vec![
            def("a", FixtureScope::Test, &["b"]),
            def("b", FixtureScope::Test, &["a"]),
        ])
        .unwrap_err();
        match err {
            FixtureError::DependencyCycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 3);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn base_self_dependency_is_a_cycle() {
        let err = registry(vec![def("a", FixtureScope::Test, &["a"])]).unwrap_err();
        assert!(matches!(err, FixtureError::DependencyCycle { .. }));
    }

    #[test]
    fn worker_fixture_cannot_depend_on_test_fixture() {
        let err = registry(vec![
            def("w", FixtureScope::Worker, &["t"]),
            def("t", FixtureScope::Test, &[]),
        ])
        .unwrap_err();
        assert!(matches!(err, FixtureError::WorkerOnTestDep { .. }));
    }

    #[test]
    fn test_fixture_may_depend_on_worker_fixture() {
        let registry = registry(vec![
            def("w", FixtureScope::Worker, &[]),
            def("t", FixtureScope::Test, &["w"]),
        ])
        .unwrap();
        assert_eq!(registry.scope_of("t"), Some(FixtureScope::Test));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = registry(vec![def("a", FixtureScope::Test, &["ghost"])]).unwrap_err();
        assert!(matches!(err, FixtureError::UnknownFixture { name, .. } if name == "ghost"));
    }

    #[test]
    fn override_chain_resolves_to_previous_layer() {
        let mut set = FixtureSet::new();
        set.extend(def("f", FixtureScope::Test, &[])).unwrap();
        set.override_with(def("f", FixtureScope::Test, &["f"])).unwrap();
        set.override_with(def("f", FixtureScope::Test, &["f"])).unwrap();
        let registry = FixtureRegistry::build(set).unwrap();

        let order = registry
            .closure(
                &["f".to_owned()],
                AutoFixtures::All,
                "test",
                &SourceLocation::default(),
            )
            .unwrap();
        let layers: Vec<_> = order.iter().map(|k| (k.name.as_str(), k.layer)).collect();
        assert_eq!(layers, [("f", 0), ("f", 1), ("f", 2)]);
    }

    #[test]
    fn automatic_fixtures_join_the_closure() {
        let mut set = FixtureSet::new();
        set.extend(def("logs", FixtureScope::Test, &[]).automatic())
            .unwrap();
        set.extend(def("w", FixtureScope::Worker, &[]).automatic())
            .unwrap();
        set.extend(def("plain", FixtureScope::Test, &[])).unwrap();
        let registry = FixtureRegistry::build(set).unwrap();

        let all = registry
            .closure(&[], AutoFixtures::All, "test", &SourceLocation::default())
            .unwrap();
        let names: Vec<_> = all.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["logs", "w"]);

        let worker_only = registry
            .closure(&[], AutoFixtures::WorkerOnly, "worker", &SourceLocation::default())
            .unwrap();
        let names: Vec<_> = worker_only.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["w"]);
    }
}

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::def::FixtureDef;
use crate::errors::FixtureError;
use indexmap::IndexMap;

/// A layered collection of fixture definitions.
///
/// Each name holds at most one base definition (`extend`) plus any number of
/// overrides (`override_with`). An override's body can consume the binding
/// it replaces by naming its own fixture in its dependency list.
///
/// Sets combine with [`FixtureSet::union`]: later bindings shadow earlier
/// ones, but overrides from both sides are preserved in order. Two base
/// definitions of the same name in independent sets are rejected.
#[derive(Clone, Debug, Default)]
pub struct FixtureSet {
    pub(crate) entries: IndexMap<String, FixtureChain>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct FixtureChain {
    pub(crate) base: Option<FixtureDef>,
    pub(crate) overrides: Vec<FixtureDef>,
}

impl FixtureSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a base definition. Rejects a second definition of the same name.
    pub fn extend(&mut self, def: FixtureDef) -> Result<&mut Self, FixtureError> {
        let chain = self.entries.entry(def.name.clone()).or_default();
        if let Some(existing) = &chain.base {
            return Err(FixtureError::DuplicateFixture {
                name: def.name,
                first: existing.registered_at.clone(),
                second: def.registered_at,
            });
        }
        chain.base = Some(def);
        Ok(self)
    }

    /// Adds an override layer for `def.name`.
    ///
    /// The base does not have to live in this set: a project's fixture set
    /// may override session fixtures it only meets at `union` time. A base
    /// missing after all unions is rejected when the registry is built.
    pub fn override_with(&mut self, def: FixtureDef) -> Result<&mut Self, FixtureError> {
        let chain = self.entries.entry(def.name.clone()).or_default();
        if let Some(base) = &chain.base {
            if base.scope != def.scope {
                return Err(FixtureError::ScopeMismatchOnOverride {
                    name: def.name,
                    base_scope: base.scope,
                    override_scope: def.scope,
                });
            }
        }
        chain.overrides.push(def);
        Ok(self)
    }

    /// Combines two sets. `b`'s bindings shadow `a`'s, except that `a`'s
    /// overrides are preserved: for a name present in both, the chain is
    /// `base` + `a`'s overrides + `b`'s overrides. Two independent base
    /// definitions of one name are rejected.
    pub fn union(a: &FixtureSet, b: &FixtureSet) -> Result<FixtureSet, FixtureError> {
        let mut result = a.clone();
        for (name, chain) in &b.entries {
            let merged = result.entries.entry(name.clone()).or_default();
            match (&merged.base, &chain.base) {
                (Some(first), Some(second)) => {
                    return Err(FixtureError::DuplicateFixture {
                        name: name.clone(),
                        first: first.registered_at.clone(),
                        second: second.registered_at.clone(),
                    });
                }
                (None, Some(base)) => merged.base = Some(base.clone()),
                _ => {}
            }
            merged.overrides.extend(chain.overrides.iter().cloned());
        }
        Ok(result)
    }

    /// True if no definitions have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names defined in this set, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureArgs, FixtureHandle, FixtureScope};

    fn noop_def(name: &str, scope: FixtureScope) -> FixtureDef {
        FixtureDef::new(name, scope, |_args: FixtureArgs, mut handle: FixtureHandle| {
            async move { handle.supply(()).await }
        })
    }

    #[test]
    fn duplicate_base_rejected() {
        let mut set = FixtureSet::new();
        set.extend(noop_def("db", FixtureScope::Worker)).unwrap();
        let err = set.extend(noop_def("db", FixtureScope::Worker)).unwrap_err();
        assert!(matches!(err, FixtureError::DuplicateFixture { name, .. } if name == "db"));
    }

    #[test]
    fn override_scope_must_match_local_base() {
        let mut set = FixtureSet::new();
        set.extend(noop_def("db", FixtureScope::Worker)).unwrap();
        let err = set
            .override_with(noop_def("db", FixtureScope::Test))
            .unwrap_err();
        assert!(matches!(err, FixtureError::ScopeMismatchOnOverride { .. }));
    }

    #[test]
    fn union_preserves_overrides_from_both_sides() {
        let mut a = FixtureSet::new();
        a.extend(noop_def("f", FixtureScope::Test)).unwrap();
        a.override_with(noop_def("f", FixtureScope::Test)).unwrap();

        let mut b = FixtureSet::new();
        b.override_with(noop_def("f", FixtureScope::Test)).unwrap();

        let merged = FixtureSet::union(&a, &b).unwrap();
        let chain = &merged.entries["f"];
        assert!(chain.base.is_some());
        assert_eq!(chain.overrides.len(), 2);
    }

    #[test]
    fn union_rejects_independent_bases() {
        let mut a = FixtureSet::new();
        a.extend(noop_def("f", FixtureScope::Test)).unwrap();
        let mut b = FixtureSet::new();
        b.extend(noop_def("f", FixtureScope::Test)).unwrap();

        let err = FixtureSet::union(&a, &b).unwrap_err();
        assert!(matches!(err, FixtureError::DuplicateFixture { .. }));
    }
}

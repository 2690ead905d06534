// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::FixtureSet;
use indexmap::IndexMap;
use std::{fmt, time::Duration};

/// Options passed to `ConfigBuilder::run_with`.
#[derive(Clone, Debug, Default)]
pub struct ProjectOptions {
    /// Project name; appears in reports and test IDs. Defaults to the tag,
    /// or `"default"` when neither is given.
    pub name: String,
    /// Tag contributed to output and snapshot path segments.
    pub tag: Option<String>,
    /// Per-test timeout override.
    pub timeout: Option<Duration>,
    /// Retry count override.
    pub retries: Option<usize>,
    /// Fixed parameter values for this project.
    pub params: IndexMap<String, serde_json::Value>,
    /// Extra tags applied to every test in the project.
    pub tags: Vec<String>,
}

impl ProjectOptions {
    /// Creates options with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the timeout override.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retries override.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Fixes a parameter value for this project.
    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// A resolved project: one named execution target. Each project yields a
/// full, independent expansion of the test registry.
#[derive(Clone)]
pub struct Project {
    /// Project name, unique across the run.
    pub name: String,
    /// Tag contributed to output-directory and snapshot-path segments.
    pub tag: Option<String>,
    /// Effective per-test timeout (config-level value unless overridden).
    pub timeout: Duration,
    /// Effective retries.
    pub retries: usize,
    /// Fixture overrides layered over the session set for this project.
    pub fixtures: FixtureSet,
    /// Fixed parameter values.
    pub params: IndexMap<String, serde_json::Value>,
    /// Tags applied to every test.
    pub tags: Vec<String>,
}

impl Project {
    pub(crate) fn new(
        options: ProjectOptions,
        fixtures: FixtureSet,
        default_timeout: Duration,
        default_retries: usize,
    ) -> Self {
        let name = if options.name.is_empty() {
            options
                .tag
                .clone()
                .unwrap_or_else(|| "default".to_owned())
        } else {
            options.name
        };
        Self {
            name,
            tag: options.tag,
            timeout: options.timeout.unwrap_or(default_timeout),
            retries: options.retries.unwrap_or(default_retries),
            fixtures,
            params: options.params,
            tags: options.tags,
        }
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_falls_back_to_tag_then_default() {
        let project = Project::new(
            ProjectOptions::default().with_tag("chrome"),
            FixtureSet::new(),
            Duration::from_secs(30),
            0,
        );
        assert_eq!(project.name, "chrome");

        let project = Project::new(
            ProjectOptions::default(),
            FixtureSet::new(),
            Duration::from_secs(30),
            0,
        );
        assert_eq!(project.name, "default");
    }

    #[test]
    fn overrides_beat_config_defaults() {
        let project = Project::new(
            ProjectOptions::named("slowpoke").with_timeout(Duration::from_secs(90)),
            FixtureSet::new(),
            Duration::from_secs(30),
            2,
        );
        assert_eq!(project.timeout, Duration::from_secs(90));
        assert_eq!(project.retries, 2);
    }
}

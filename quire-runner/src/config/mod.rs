// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for quire.
//!
//! Configuration has two halves. Data-only settings (timeouts, retries,
//! directories, reporters, projects, parameter values) live in `quire.toml`,
//! found by searching upward from the working directory or named explicitly
//! with `--config`. Code-valued settings (fixture sets for projects, global
//! setup/teardown) are registered on the [`ConfigBuilder`] in the user's
//! binary. Command-line flags override both.

mod config_impl;
mod projects;

pub use config_impl::*;
pub use projects::*;

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Documented, serializable formats for quire's machine-readable output.
//!
//! The types in this crate describe the JSON report produced by `quire run
//! --reporter=json`, along with the exit codes the runner may return. Tools
//! that consume quire output should depend on this crate rather than parsing
//! the JSON by hand.

mod exit_codes;
mod report;

pub use exit_codes::*;
pub use report::*;

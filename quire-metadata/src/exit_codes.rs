// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `quire` runs.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum QuireExitCode {}

impl QuireExitCode {
    /// Every test reached its expected status and quire exited normally.
    pub const OK: i32 = 0;

    /// One or more tests failed, timed out, or a worker reported an error;
    /// also returned when `--max-failures` stopped the run early.
    pub const TEST_RUN_FAILED: i32 = 1;

    /// The command line or the config file could not be understood. This
    /// includes unknown parameters, cyclic project definitions, and
    /// `--forbid-only` finding a surviving `only` marker.
    pub const SETUP_ERROR: i32 = 2;
}

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]: it owns the tokio
//! runtime, expands the test list, schedules instances across worker
//! processes grouped by worker hash, and forwards lifecycle events to the
//! reporter callback.

mod dispatcher;
mod imp;
mod pool;

use dispatcher::*;
pub use imp::*;
pub use pool::WORKER_SUBCOMMAND;
use pool::*;

// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The quire command-line front-end.
//!
//! Quire test binaries embed this crate: `main` builds a
//! [`Session`](quire_runner::session::Session) (fixtures, test files,
//! config) and hands it to [`exec`], which parses the command line and
//! either runs the controller or, for the hidden worker subcommand,
//! switches into worker mode:
//!
//! ```ignore
//! fn main() {
//!     let mut session = Session::new();
//!     session.test_file("tests/auth.rs", register_auth_tests);
//!     std::process::exit(quire_cli::exec(session));
//! }
//! ```

mod dispatch;

pub use dispatch::*;

use clap::Parser;
use quire_runner::session::Session;

/// Parses `std::env::args` and executes the appropriate mode. Returns the
/// process exit code.
pub fn exec(session: Session) -> i32 {
    let app = QuireApp::parse();
    app.exec(session)
}

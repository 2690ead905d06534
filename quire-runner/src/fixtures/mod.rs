// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fixture dependency graph.
//!
//! Fixtures are named values produced by user-supplied setup/teardown bodies
//! and consumed by tests, hooks, and other fixtures. A [`FixtureSet`] holds
//! layered definitions (bases and overrides); a [`FixtureRegistry`] is the
//! validated graph with a stable resolution order; a `FixtureStore` holds
//! live values for one scope at run time.
//!
//! A body is a single async function that sets up, publishes its value with
//! [`FixtureHandle::supply`], stays suspended there while consumers run, and
//! resumes for teardown when the owning scope ends:
//!
//! ```ignore
//! FixtureDef::new("server", FixtureScope::Worker, |args, mut handle| async move {
//!     let port: Arc<u16> = args.get("port")?;
//!     let server = Server::bind(*port).await?;
//!     handle.supply(server.url()).await?;
//!     server.shutdown().await?;
//!     Ok(())
//! })
//! .with_deps(&["port"])
//! ```

mod def;
mod graph;
mod set;
mod store;

pub use def::*;
pub use graph::*;
pub use set::*;
pub(crate) use store::*;

//! Throwaway PostgreSQL clusters for integration tests.
//!
//! A [`Harness`] hands out [`Node`]s, each with its own port and directory,
//! and drives the external PostgreSQL tools to initialize, start, stop,
//! back up and replicate them.
//!
//! ```ignore
//! let harness = Harness::from_env()?;
//! let mut node = harness.node().build()?;
//! node.initialize().await?;
//! node.start().await?;
//! let rows = node.execute("postgres", "select 1", &[]).await?;
//! node.destroy().await;
//! ```

mod allocator;
mod backup;
mod benchmark;
mod client;
mod config;
mod connection;
mod errors;
mod harness;
pub mod materializer;
mod node;
mod process;
pub mod utils;

pub use allocator::*;
pub use backup::*;
pub use benchmark::*;
pub use client::*;
pub use config::*;
pub use connection::*;
pub use errors::*;
pub use harness::*;
pub use materializer::StandbyMarker;
pub use materializer::Upstream;
pub use node::*;
pub use process::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;

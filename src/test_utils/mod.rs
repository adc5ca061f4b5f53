//! Shared helpers for unit tests: logger setup, mock client backends and a
//! toolbox of fake PostgreSQL binaries.
mod common;
mod fake_tools;

pub use common::*;
pub use fake_tools::*;

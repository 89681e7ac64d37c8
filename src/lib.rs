//! Repobox job runner.
//!
//! Pulls change requests off a Redis stream, runs a coding agent against a
//! fresh clone, and pushes the result to a `repobox/<id>` branch.

pub mod agent;
pub mod cleaner;
pub mod config;
pub mod consumer;
pub mod crypto;
pub mod deadline;
pub mod errors;
pub mod git;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod shutdown;
pub mod sink;
pub mod store;
pub mod workdir;

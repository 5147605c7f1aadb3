//! Policy-gated gateway for running the Claude Code CLI.
//!
//! The [`Gateway`] holds the active [`SecurityPolicy`] and the pool of
//! concurrency slots. Callers hand it an [`ExecutionRequest`]; it checks the
//! mode against the blocklist, confines the working directory to the
//! allowlist, clamps the timeout, and only then spawns the process.

pub mod config;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod runner;
pub mod sandbox;
pub mod skills;

pub use error::GatewayError;
pub use gateway::{ExecutionRequest, Gateway};
pub use policy::{PolicyStore, PolicyUpdate, SecurityPolicy};
pub use runner::{BinaryLocator, ExecutionOutcome, RunSpec};

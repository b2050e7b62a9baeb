//! Covenant: a contract-governed orchestration engine for multi-agent
//! software delivery.
//!
//! A validated contract fixes the roles, phases, approval gates, and
//! budgets of a job before it starts. The engine then drives autonomous
//! agent sessions against a shared repository: scope policy bounds what
//! each session may touch, an append-only ledger records every mutation,
//! and approval gates with content-addressed dedup put a human in the
//! loop exactly where the contract says so.

pub mod cli;
pub mod config;
pub mod contract;
pub mod error;
pub mod evidence;
pub mod gate;
pub mod git;
pub mod job;
pub mod ledger;
pub mod policy;
pub mod session;

pub use config::EngineConfig;
pub use contract::Contract;
pub use error::{CovenantError, Result};
pub use job::{CancelToken, JobManager, JobOutcome, JobStatus};

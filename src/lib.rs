//! Catalog-driven phase orchestrator for validating a scenario.
//!
//! A run resolves an [`workspace::Environment`], selects phases from a
//! [`catalog::Catalog`], and hands each one to [`executor::execute`] under its
//! own [`context::RunContext`]. Every phase leaves a pointer under
//! `coverage/phase-results/` and a log under `coverage/logs/`.
pub mod adapter;
pub mod artifacts;
pub mod bas;
pub mod catalog;
pub mod command;
pub mod config;
pub mod context;
pub mod env_scope;
pub mod executor;
pub mod isolation;
pub mod observe;
pub mod phases;
pub mod toolbox;
pub mod vrooli;
pub mod workspace;

pub use catalog::{default_catalog, Catalog, PhaseRunner, Spec};
pub use context::RunContext;
pub use executor::{execute, ExecutionPlan, ExecutionSummary};
pub use observe::{FailureClass, Observation, RunReport};
pub use toolbox::Toolbox;
pub use workspace::Environment;

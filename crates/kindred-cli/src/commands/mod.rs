//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod account;
pub mod capacity;
pub mod charge;
pub mod payment;
pub mod plan;

use crate::output::OutputFormat;
use kindred_billing::Database;

/// Shared context for all commands
pub struct Context {
    pub db: Database,
    pub format: OutputFormat,
    pub quiet: bool,
}

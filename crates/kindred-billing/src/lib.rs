//! # kindred-billing
//!
//! Credit ledger and feature gating for Kindred - shared between the API
//! service and the CLI.
//!
//! This crate provides:
//! - Database operations (`db` module)
//! - Data models (`models` module)
//! - Billing services (`services` module): ledger, quota, charges,
//!   capacity, waitlist, payment events
//! - Unified error handling (`error` module)

pub mod db;
pub mod error;
pub mod models;
pub mod services;

// Re-exports for convenience
pub use db::Database;
pub use error::{Error, Result};

// Re-export commonly used types from models
pub use models::{
    CapacityPool, ChargeResult, ClaimResult, CreditBalance, CreditTransaction, Feature,
    PaymentOutcome, QuotaDecision, SlotAssignment, TransactionReason, UsageCounter,
    WaitlistEntry, WaitlistEntryStatus,
};

// Re-export commonly used types from services
pub use services::{
    all_packs, all_plans, current_period, pack_by_sku, period_for, plan_by_code, price_per_unit,
    CapacityAllocator, ChargeCoordinator, CreditPack, GrantOutcome, Ledger, LogNotifier,
    Notifier, PaymentEvent, PaymentEventKind, PaymentProcessor, PendingCharge,
    PendingChargeState, Plan, QuotaEngine, ReservationOutcome, SweepResult, WaitlistProcessor,
    WaitlistStatus, DEFAULT_PLAN_CODE, UNLIMITED,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}

//! Services module

pub mod capacity;
pub mod catalog;
pub mod charge;
pub mod ledger;
pub mod payments;
pub mod quota;
pub mod waitlist;

pub use capacity::CapacityAllocator;
pub use catalog::{
    all_packs, all_plans, pack_by_sku, plan_by_code, price_per_unit, CreditPack, Plan,
    DEFAULT_PLAN_CODE, UNLIMITED,
};
pub use charge::{
    ChargeCoordinator, PendingCharge, PendingChargeState, ReservationOutcome,
};
pub use ledger::{GrantOutcome, Ledger, StoredTransaction};
pub use payments::{PaymentEvent, PaymentEventKind, PaymentProcessor};
pub use quota::{current_period, period_for, QuotaEngine};
pub use waitlist::{
    LogNotifier, Notifier, SweepResult, WaitlistProcessor, WaitlistStatus,
};

//! Data models for the billing core
//!
//! Entities mirror the durable schema (`db` module); operation outcomes are
//! typed enums because denials and idempotency hits are expected, frequent
//! results - not errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Metered Features
// ============================================================================

/// A metered, chargeable feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// One conversational turn with a profile
    ChatMessage,
    /// Speech synthesis, metered per second of generated audio
    SpeechSynthesis,
    /// Voice demo playback, metered per second
    VoiceDemo,
}

impl Feature {
    /// All metered features, for iteration in reports
    pub const ALL: [Feature; 3] = [
        Feature::ChatMessage,
        Feature::SpeechSynthesis,
        Feature::VoiceDemo,
    ];

    /// Human-readable unit for one metered unit of this feature
    pub fn unit(&self) -> &'static str {
        match self {
            Feature::ChatMessage => "message",
            Feature::SpeechSynthesis => "second",
            Feature::VoiceDemo => "second",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feature::ChatMessage => write!(f, "chat_message"),
            Feature::SpeechSynthesis => write!(f, "speech_synthesis"),
            Feature::VoiceDemo => write!(f, "voice_demo"),
        }
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat_message" | "message" | "chat" => Ok(Feature::ChatMessage),
            "speech_synthesis" | "speech" | "tts" => Ok(Feature::SpeechSynthesis),
            "voice_demo" | "demo" => Ok(Feature::VoiceDemo),
            _ => Err(format!("Unknown feature: {}", s)),
        }
    }
}

// ============================================================================
// Ledger Types
// ============================================================================

/// Why a credit transaction was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionReason {
    PackPurchase,
    SubscriptionMonthlyGrant,
    UsageCharge,
    Refund,
    PromoGrant,
    AdminAdjust,
}

impl std::fmt::Display for TransactionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionReason::PackPurchase => write!(f, "pack_purchase"),
            TransactionReason::SubscriptionMonthlyGrant => write!(f, "subscription_monthly_grant"),
            TransactionReason::UsageCharge => write!(f, "usage_charge"),
            TransactionReason::Refund => write!(f, "refund"),
            TransactionReason::PromoGrant => write!(f, "promo_grant"),
            TransactionReason::AdminAdjust => write!(f, "admin_adjust"),
        }
    }
}

impl std::str::FromStr for TransactionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pack_purchase" => Ok(TransactionReason::PackPurchase),
            "subscription_monthly_grant" => Ok(TransactionReason::SubscriptionMonthlyGrant),
            "usage_charge" => Ok(TransactionReason::UsageCharge),
            "refund" => Ok(TransactionReason::Refund),
            "promo_grant" => Ok(TransactionReason::PromoGrant),
            "admin_adjust" => Ok(TransactionReason::AdminAdjust),
            _ => Err(format!("Unknown transaction reason: {}", s)),
        }
    }
}

/// Materialized credit balance for one account
///
/// A cache of the transaction fold: `credits_available + credits_reserved`
/// must always equal the sum of the account's transaction deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub account_id: String,
    pub credits_available: i64,
    pub credits_reserved: i64,
    pub lifetime_spent: i64,
    /// Writes are halted while frozen (set on detected ledger inconsistency)
    pub frozen: bool,
    pub last_updated: DateTime<Utc>,
}

impl CreditBalance {
    /// An empty balance for an account with no ledger activity yet
    pub fn empty(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            credits_available: 0,
            credits_reserved: 0,
            lifetime_spent: 0,
            frozen: false,
            last_updated: Utc::now(),
        }
    }

    /// Total credits the ledger fold must account for
    pub fn ledger_total(&self) -> i64 {
        self.credits_available + self.credits_reserved
    }
}

/// One append-only, balance-changing ledger event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Monotonic insertion-order sequence (audit replay order)
    pub seq: i64,
    pub id: String,
    pub account_id: String,
    /// Signed credit delta; negative for charges
    pub delta: i64,
    pub reason: TransactionReason,
    pub reference_sku: Option<String>,
    /// Caller- or provider-supplied exactly-once token
    pub idempotency_ref: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Usage Counters
// ============================================================================

/// Metered usage of one feature by one account in one billing period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    pub account_id: String,
    /// Billing period in `YYYY-MM` form
    pub period: String,
    pub feature: Feature,
    pub used_units: i64,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Capacity Pool
// ============================================================================

/// The singleton voice-personalization capacity pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapacityPool {
    pub max_slots: i64,
    /// Slots held back from allocation
    pub buffer_slots: i64,
    pub active_slots: i64,
}

impl CapacityPool {
    /// Slots that can still be granted; never negative
    pub fn slots_available(&self) -> i64 {
        (self.max_slots - self.buffer_slots - self.active_slots).max(0)
    }
}

/// An active or historical slot grant
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlotAssignment {
    pub id: String,
    pub account_id: String,
    /// "claim" for direct grants, "waitlist" for promotions
    pub source: String,
    pub assigned_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Waitlist
// ============================================================================

/// Waitlist entry lifecycle; transitions are forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitlistEntryStatus {
    /// Waiting for a free slot
    Queued,
    /// Picked up by a sweep; also the retry parking state after a failed
    /// notification
    Processing,
    /// Slot granted and account notified
    Notified,
    /// Account observed its promoted slot
    Fulfilled,
}

impl WaitlistEntryStatus {
    /// Whether the forward-only lifecycle permits moving to `next`
    pub fn can_transition_to(&self, next: WaitlistEntryStatus) -> bool {
        use WaitlistEntryStatus::*;
        matches!(
            (self, next),
            (Queued, Processing) | (Processing, Notified) | (Notified, Fulfilled)
        )
    }

    /// Whether this entry still needs a slot
    pub fn is_pending(&self) -> bool {
        matches!(self, WaitlistEntryStatus::Queued | WaitlistEntryStatus::Processing)
    }
}

impl std::fmt::Display for WaitlistEntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitlistEntryStatus::Queued => write!(f, "queued"),
            WaitlistEntryStatus::Processing => write!(f, "processing"),
            WaitlistEntryStatus::Notified => write!(f, "notified"),
            WaitlistEntryStatus::Fulfilled => write!(f, "fulfilled"),
        }
    }
}

impl std::str::FromStr for WaitlistEntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(WaitlistEntryStatus::Queued),
            "processing" => Ok(WaitlistEntryStatus::Processing),
            "notified" => Ok(WaitlistEntryStatus::Notified),
            "fulfilled" => Ok(WaitlistEntryStatus::Fulfilled),
            _ => Err(format!("Unknown waitlist status: {}", s)),
        }
    }
}

/// A pending or completed claim waiting on pool capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: String,
    pub account_id: String,
    pub requested_at: DateTime<Utc>,
    pub status: WaitlistEntryStatus,
    pub interest_tag: Option<String>,
    pub notified_at: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Operation Outcomes
// ============================================================================

/// Result of a quota pre-check (pure read, no side effects)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    Allowed,
    Denied {
        feature: Feature,
        used: i64,
        requested: i64,
        limit: i64,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }
}

/// Result of an atomic charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChargeResult {
    /// Credits debited; one transaction written
    Success {
        transaction_id: String,
        new_balance: i64,
    },
    /// Nothing written, nothing mutated
    InsufficientCredits { required: i64, available: i64 },
    /// Idempotency hit: this reference was already charged
    AlreadyCharged { transaction_id: String },
}

impl ChargeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ChargeResult::Success { .. })
    }

    /// Treats an idempotency hit as settled, per the charge contract
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ChargeResult::Success { .. } | ChargeResult::AlreadyCharged { .. }
        )
    }
}

/// Result of a slot claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClaimResult {
    /// A free slot was granted
    Granted { slot_ref: String },
    /// The account already holds an active slot
    AlreadyHeld { slot_ref: String },
    /// No slot free; durably enqueued at the given 1-based position
    Queued { entry_id: String, position: i64 },
}

impl ClaimResult {
    /// Whether the account holds a slot after this call
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            ClaimResult::Granted { .. } | ClaimResult::AlreadyHeld { .. }
        )
    }
}

/// Result of applying an external payment event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Grant applied; one transaction written
    Applied {
        transaction_id: String,
        credits_granted: i64,
        new_balance: i64,
    },
    /// This provider event id was already applied
    Duplicate,
}

// ============================================================================
// Tests
// ============================================================================

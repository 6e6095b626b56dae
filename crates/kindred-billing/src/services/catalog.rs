//! Plan and pricing catalog
//!
//! Immutable reference data: subscription plans, per-feature credit prices,
//! and purchasable credit packs. Looked up, never mutated, by the billing
//! services. Account-to-plan mapping is durable (`account_plans` table); the
//! plans themselves live here.

use serde::{Deserialize, Serialize};

use crate::models::Feature;

/// Quota limit value meaning "unlimited"
pub const UNLIMITED: i64 = -1;

/// Plan code accounts fall back to when they have no explicit plan row
pub const DEFAULT_PLAN_CODE: &str = "free";

/// A subscription plan: monthly credit grant plus per-feature quota ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub code: &'static str,
    pub name: &'static str,
    /// Credits granted on each subscription renewal
    pub monthly_credit_grant: i64,
    /// Monthly price in cents (0 for free)
    pub price_cents: i64,
    pub chat_message_limit: i64,
    pub speech_seconds_limit: i64,
    pub demo_seconds_limit: i64,
}

impl Plan {
    /// Monthly quota ceiling for a feature; `UNLIMITED` (-1) means no ceiling
    pub fn limit_for(&self, feature: Feature) -> i64 {
        match feature {
            Feature::ChatMessage => self.chat_message_limit,
            Feature::SpeechSynthesis => self.speech_seconds_limit,
            Feature::VoiceDemo => self.demo_seconds_limit,
        }
    }
}

const PLANS: &[Plan] = &[
    Plan {
        code: "free",
        name: "Free",
        monthly_credit_grant: 30,
        price_cents: 0,
        chat_message_limit: 30,
        speech_seconds_limit: 60,
        demo_seconds_limit: 30,
    },
    Plan {
        code: "keepsake",
        name: "Keepsake",
        monthly_credit_grant: 500,
        price_cents: 990,
        chat_message_limit: 500,
        speech_seconds_limit: 600,
        demo_seconds_limit: 120,
    },
    Plan {
        code: "family",
        name: "Family",
        monthly_credit_grant: 2000,
        price_cents: 2490,
        chat_message_limit: UNLIMITED,
        speech_seconds_limit: 3600,
        demo_seconds_limit: UNLIMITED,
    },
];

/// Look up a plan by code
pub fn plan_by_code(code: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|p| p.code == code)
}

/// All known plans
pub fn all_plans() -> &'static [Plan] {
    PLANS
}

/// Credit price per metered unit of a feature.
///
/// Every metered feature has a positive price so each consumed unit leaves a
/// ledger row.
pub fn price_per_unit(feature: Feature) -> i64 {
    match feature {
        Feature::ChatMessage => 1,
        Feature::SpeechSynthesis => 2,
        Feature::VoiceDemo => 1,
    }
}

/// A purchasable one-off credit pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditPack {
    pub sku: &'static str,
    pub credits: i64,
    pub price_cents: i64,
}

const CREDIT_PACKS: &[CreditPack] = &[
    CreditPack { sku: "pack_small", credits: 100, price_cents: 299 },
    CreditPack { sku: "pack_medium", credits: 550, price_cents: 1299 },
    CreditPack { sku: "pack_large", credits: 1200, price_cents: 2499 },
];

/// Look up a credit pack by SKU
pub fn pack_by_sku(sku: &str) -> Option<&'static CreditPack> {
    CREDIT_PACKS.iter().find(|p| p.sku == sku)
}

/// All purchasable credit packs
pub fn all_packs() -> &'static [CreditPack] {
    CREDIT_PACKS
}

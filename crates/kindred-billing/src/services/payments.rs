//! Payment event handling
//!
//! Entry point for provider webhooks (pack purchases, subscription
//! renewals). Providers redeliver events, so every grant is keyed on the
//! provider's event id; a redelivered event reports `Duplicate` and changes
//! nothing.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{Error, Result};
use crate::models::{PaymentOutcome, TransactionReason};
use crate::services::catalog;
use crate::services::ledger::{GrantOutcome, Ledger};
use crate::services::quota::QuotaEngine;

/// What the provider is telling us happened
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentEventKind {
    /// One-off credit pack purchase
    PackPurchase { sku: String },
    /// Monthly subscription renewal; grants the plan's monthly credits and
    /// (re)assigns the plan
    SubscriptionRenewal { plan_code: String },
}

/// A verified payment event, post provider signature check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Provider's event id, used as the idempotency key
    pub event_id: String,
    pub account_id: String,
    #[serde(flatten)]
    pub kind: PaymentEventKind,
}

/// Translates payment events into ledger grants
pub struct PaymentProcessor {
    ledger: Ledger,
    quota: QuotaEngine,
}

impl PaymentProcessor {
    /// Create a new PaymentProcessor with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            ledger: Ledger::new(pool.clone()),
            quota: QuotaEngine::new(pool),
        }
    }

    /// Apply a payment event to the account's ledger.
    ///
    /// Idempotent on `event_id`: a redelivered event returns `Duplicate`
    /// without touching the balance or the plan.
    pub async fn apply_payment_event(&self, event: &PaymentEvent) -> Result<PaymentOutcome> {
        if event.event_id.trim().is_empty() {
            return Err(Error::validation("payment event id cannot be empty"));
        }
        if event.account_id.trim().is_empty() {
            return Err(Error::validation("account id cannot be empty"));
        }

        let (credits, reason, sku) = match &event.kind {
            PaymentEventKind::PackPurchase { sku } => {
                let pack = catalog::pack_by_sku(sku)
                    .ok_or_else(|| Error::validation(format!("Unknown credit pack sku: {}", sku)))?;
                (pack.credits, TransactionReason::PackPurchase, Some(pack.sku))
            }
            PaymentEventKind::SubscriptionRenewal { plan_code } => {
                let plan = catalog::plan_by_code(plan_code).ok_or_else(|| {
                    Error::validation(format!("Unknown plan code: {}", plan_code))
                })?;
                (plan.monthly_credit_grant, TransactionReason::SubscriptionMonthlyGrant, Some(plan.code))
            }
        };

        let outcome = self
            .ledger
            .grant(&event.account_id, credits, reason, sku, Some(&event.event_id), None)
            .await?;

        match outcome {
            GrantOutcome::Applied { transaction_id, new_balance } => {
                // Plan assignment follows the grant; re-running it on a
                // duplicate would be harmless but is skipped with the grant.
                if let PaymentEventKind::SubscriptionRenewal { plan_code } = &event.kind {
                    self.quota.set_plan(&event.account_id, plan_code).await?;
                }

                log::info!(
                    "[payments] Event {} granted {} credits to {}",
                    event.event_id,
                    credits,
                    event.account_id
                );

                Ok(PaymentOutcome::Applied {
                    transaction_id,
                    credits_granted: credits,
                    new_balance,
                })
            }
            GrantOutcome::Duplicate { .. } => {
                log::info!(
                    "[payments] Event {} already applied to {}; skipping",
                    event.event_id,
                    event.account_id
                );
                Ok(PaymentOutcome::Duplicate)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    async fn test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::open(temp_dir.path().join("test.db"))
            .await
            .expect("Failed to create test database");
        (db, temp_dir)
    }

    fn pack_event(event_id: &str, account_id: &str, sku: &str) -> PaymentEvent {
        PaymentEvent {
            event_id: event_id.to_string(),
            account_id: account_id.to_string(),
            kind: PaymentEventKind::PackPurchase { sku: sku.to_string() },
        }
    }

    #[tokio::test]
    async fn test_pack_purchase_grants_credits() {
        let (db, _tmp) = test_db().await;
        let payments = PaymentProcessor::new(db.pool.clone());
        let ledger = Ledger::new(db.pool.clone());

        let outcome = payments
            .apply_payment_event(&pack_event("evt-1", "acct-1", "pack_small"))
            .await
            .unwrap();

        match outcome {
            PaymentOutcome::Applied { credits_granted, new_balance, .. } => {
                assert_eq!(credits_granted, 100);
                assert_eq!(new_balance, 100);
            }
            other => panic!("expected Applied, got {:?}", other),
        }

        let balance = ledger.get_balance("acct-1").await.unwrap();
        assert_eq!(balance.credits_available, 100);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_duplicate() {
        let (db, _tmp) = test_db().await;
        let payments = PaymentProcessor::new(db.pool.clone());
        let ledger = Ledger::new(db.pool.clone());

        let event = pack_event("evt-1", "acct-1", "pack_medium");
        payments.apply_payment_event(&event).await.unwrap();

        let outcome = payments.apply_payment_event(&event).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Duplicate));

        // Exactly one grant landed
        let balance = ledger.get_balance("acct-1").await.unwrap();
        assert_eq!(balance.credits_available, 550);
        let transactions = ledger.list_transactions("acct-1", 10).await.unwrap();
        assert_eq!(transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_grants_and_assigns_plan() {
        let (db, _tmp) = test_db().await;
        let payments = PaymentProcessor::new(db.pool.clone());
        let quota = QuotaEngine::new(db.pool.clone());
        let ledger = Ledger::new(db.pool.clone());

        let event = PaymentEvent {
            event_id: "evt-renewal-1".to_string(),
            account_id: "acct-1".to_string(),
            kind: PaymentEventKind::SubscriptionRenewal { plan_code: "keepsake".to_string() },
        };

        let outcome = payments.apply_payment_event(&event).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Applied { credits_granted: 500, .. }));

        assert_eq!(quota.plan_for_account("acct-1").await.unwrap().code, "keepsake");
        let balance = ledger.get_balance("acct-1").await.unwrap();
        assert_eq!(balance.credits_available, 500);
    }

    #[tokio::test]
    async fn test_unknown_sku_rejected() {
        let (db, _tmp) = test_db().await;
        let payments = PaymentProcessor::new(db.pool.clone());

        let err = payments
            .apply_payment_event(&pack_event("evt-1", "acct-1", "pack_bogus"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = payments
            .apply_payment_event(&pack_event("", "acct-1", "pack_small"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_event_serde_round_trip() {
        let json = r#"{
            "event_id": "evt-9",
            "account_id": "acct-1",
            "kind": "subscription_renewal",
            "plan_code": "family"
        }"#;

        let event: PaymentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_id, "evt-9");
        assert!(matches!(
            event.kind,
            PaymentEventKind::SubscriptionRenewal { ref plan_code } if plan_code == "family"
        ));
    }
}

//! Integration tests for kindred-billing
//!
//! Exercises the billing services together against one database: the ledger
//! fold invariant across mixed flows, double-spend protection under real
//! concurrency, capacity allocation under contention, and FIFO waitlist
//! promotion.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use kindred_billing::{
    CapacityAllocator, ChargeCoordinator, ChargeResult, ClaimResult, Database, Error, Feature,
    Ledger, PaymentEvent, PaymentEventKind, PaymentOutcome, PaymentProcessor, QuotaEngine,
    ReservationOutcome, TransactionReason, WaitlistProcessor,
};

async fn test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(temp_dir.path().join("test.db"))
        .await
        .expect("Failed to create test database");
    (db, temp_dir)
}

async fn fund(db: &Database, account_id: &str, credits: i64) {
    Ledger::new(db.pool.clone())
        .grant(account_id, credits, TransactionReason::PackPurchase, None, None, None)
        .await
        .unwrap();
}

// =============================================================================
// Ledger fold invariant
// =============================================================================

#[tokio::test]
async fn test_fold_invariant_survives_mixed_flows() {
    let (db, _tmp) = test_db().await;
    let ledger = Ledger::new(db.pool.clone());
    let charges = ChargeCoordinator::new(db.pool.clone());

    fund(&db, "acct-1", 200).await;

    charges.charge("acct-1", Feature::ChatMessage, 10, "msg-1").await.unwrap();
    charges.reserve("acct-1", Feature::SpeechSynthesis, 20, "tts-1").await.unwrap();
    charges.reserve("acct-1", Feature::SpeechSynthesis, 5, "tts-2").await.unwrap();
    charges.settle("tts-1").await.unwrap();
    charges.release("tts-2").await.unwrap();
    charges.refund("acct-1", 10, Some("msg-1"), Some("refund:msg-1")).await.unwrap();

    // 200 - 10 - 40 + 10, with the released hold back in available
    let balance = ledger.get_balance("acct-1").await.unwrap();
    assert_eq!(balance.credits_available, 160);
    assert_eq!(balance.credits_reserved, 0);
    assert_eq!(balance.lifetime_spent, 50);

    // The transaction log folds to exactly available + reserved
    let fold = ledger.verify_account("acct-1").await.unwrap();
    assert_eq!(fold, 160);
    assert!(!ledger.get_balance("acct-1").await.unwrap().frozen);
}

// =============================================================================
// Double-spend protection
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_charges_never_double_spend() {
    let (db, _tmp) = test_db().await;

    // Exactly enough credits for one of the competing charges
    fund(&db, "acct-1", 10).await;

    let charges = Arc::new(ChargeCoordinator::new(db.pool.clone()));
    let mut handles = Vec::new();
    for i in 0..8 {
        let charges = Arc::clone(&charges);
        handles.push(tokio::spawn(async move {
            charges
                .charge("acct-1", Feature::ChatMessage, 10, &format!("msg-{}", i))
                .await
        }));
    }

    let mut successes = 0;
    let mut denials = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ChargeResult::Success { .. } => successes += 1,
            ChargeResult::InsufficientCredits { required, .. } => {
                assert_eq!(required, 10);
                denials += 1;
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(denials, 7);

    let ledger = Ledger::new(db.pool.clone());
    let balance = ledger.get_balance("acct-1").await.unwrap();
    assert_eq!(balance.credits_available, 0);
    assert_eq!(ledger.verify_account("acct-1").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_with_same_reference_charge_once() {
    let (db, _tmp) = test_db().await;
    fund(&db, "acct-1", 100).await;

    let charges = Arc::new(ChargeCoordinator::new(db.pool.clone()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let charges = Arc::clone(&charges);
        handles.push(tokio::spawn(async move {
            charges.charge("acct-1", Feature::VoiceDemo, 5, "demo-1").await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ChargeResult::Success { .. } => successes += 1,
            ChargeResult::AlreadyCharged { .. } => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
    assert_eq!(successes, 1);

    let ledger = Ledger::new(db.pool.clone());
    assert_eq!(ledger.get_balance("acct-1").await.unwrap().credits_available, 95);
    assert_eq!(ledger.list_transactions("acct-1", 10).await.unwrap().len(), 2);
}

// =============================================================================
// Quota + charge scenario
// =============================================================================

#[tokio::test]
async fn test_speech_budget_runs_out_mid_session() {
    let (db, _tmp) = test_db().await;
    let charges = ChargeCoordinator::new(db.pool.clone());
    let quota = QuotaEngine::new(db.pool.clone());

    quota.set_plan("acct-1", "keepsake").await.unwrap();
    fund(&db, "acct-1", 100).await;

    // 45 seconds of speech at 2 credits/second leaves 10 credits
    let result = charges
        .charge("acct-1", Feature::SpeechSynthesis, 45, "tts-1")
        .await
        .unwrap();
    assert!(matches!(result, ChargeResult::Success { new_balance: 10, .. }));

    // The next 10 seconds would cost 20; the denial names both numbers
    let result = charges
        .charge("acct-1", Feature::SpeechSynthesis, 10, "tts-2")
        .await
        .unwrap();
    assert_eq!(
        result,
        ChargeResult::InsufficientCredits { required: 20, available: 10 }
    );

    // The denial left no trace: balance is still 10
    let ledger = Ledger::new(db.pool.clone());
    assert_eq!(ledger.get_balance("acct-1").await.unwrap().credits_available, 10);
}

// =============================================================================
// Capacity under contention
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_over_allocate() {
    let (db, _tmp) = test_db().await;
    let capacity = Arc::new(CapacityAllocator::new(db.pool.clone()));

    // 3 grantable slots
    capacity.configure_pool(4, 1).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let capacity = Arc::clone(&capacity);
        handles.push(tokio::spawn(async move {
            capacity.claim_slot(&format!("acct-{}", i), None).await
        }));
    }

    let mut granted = 0;
    let mut queued = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ClaimResult::Granted { .. } => granted += 1,
            ClaimResult::Queued { .. } => queued += 1,
            other => panic!("unexpected result: {:?}", other),
        }
    }

    assert_eq!(granted, 3);
    assert_eq!(queued, 5);

    let pool = capacity.pool_status().await.unwrap();
    assert_eq!(pool.active_slots, 3);
    assert_eq!(pool.slots_available(), 0);
}

#[tokio::test]
async fn test_release_then_sweep_promotes_in_arrival_order() {
    let (db, _tmp) = test_db().await;
    let capacity = CapacityAllocator::new(db.pool.clone());
    let processor = WaitlistProcessor::new(db.pool.clone());

    capacity.configure_pool(1, 0).await.unwrap();
    capacity.claim_slot("holder", None).await.unwrap();

    // Sequential claims give strictly increasing requested_at
    for account in ["first", "second", "third"] {
        let result = capacity.claim_slot(account, None).await.unwrap();
        assert!(matches!(result, ClaimResult::Queued { .. }));
    }

    capacity.release_slot("holder").await.unwrap();
    let sweep = processor.process_next(10).await.unwrap();
    assert_eq!(sweep.promoted, 1);

    assert!(capacity.active_assignment("first").await.unwrap().is_some());
    assert!(capacity.active_assignment("second").await.unwrap().is_none());

    // The remaining entries moved up one place each
    let status = processor.status("second").await.unwrap().unwrap();
    assert_eq!(status.position, Some(1));
    let status = processor.status("third").await.unwrap().unwrap();
    assert_eq!(status.position, Some(2));

    // Promoted account completes the lifecycle on its next claim
    let result = capacity.claim_slot("first", None).await.unwrap();
    assert!(result.holds_slot());
}

// =============================================================================
// Reconciliation and recovery
// =============================================================================

#[tokio::test]
async fn test_stale_holds_are_reconciled_and_fold_survives() {
    let (db, _tmp) = test_db().await;
    let charges = ChargeCoordinator::new(db.pool.clone());
    let ledger = Ledger::new(db.pool.clone());
    fund(&db, "acct-1", 100).await;

    charges.reserve("acct-1", Feature::ChatMessage, 30, "crashed-call").await.unwrap();
    sqlx::query("UPDATE pending_charges SET created_at = ? WHERE idempotency_ref = 'crashed-call'")
        .bind(Utc::now() - Duration::hours(3))
        .execute(&db.pool)
        .await
        .unwrap();

    let released = charges.reconcile_stale(Duration::hours(1)).await.unwrap();
    assert_eq!(released, 1);

    let balance = ledger.get_balance("acct-1").await.unwrap();
    assert_eq!(balance.credits_available, 100);
    assert_eq!(balance.credits_reserved, 0);
    assert_eq!(ledger.verify_account("acct-1").await.unwrap(), 100);

    // A reconciled hold cannot settle later
    let outcome = charges
        .reserve("acct-1", Feature::ChatMessage, 30, "crashed-call")
        .await
        .unwrap();
    assert_eq!(outcome, ReservationOutcome::Duplicate);
    assert!(charges.settle("crashed-call").await.is_err());
}

#[tokio::test]
async fn test_frozen_account_blocks_writes_until_rebuilt() {
    let (db, _tmp) = test_db().await;
    let charges = ChargeCoordinator::new(db.pool.clone());
    let ledger = Ledger::new(db.pool.clone());
    fund(&db, "acct-1", 50).await;

    // Corrupt the balance cache; verification freezes the account
    sqlx::query("UPDATE credit_balances SET credits_available = 500 WHERE account_id = 'acct-1'")
        .execute(&db.pool)
        .await
        .unwrap();
    let err = ledger.verify_account("acct-1").await.unwrap_err();
    assert!(matches!(err, Error::LedgerInconsistency { .. }));

    let err = charges
        .charge("acct-1", Feature::ChatMessage, 1, "msg-1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccountFrozen(_)));

    // Rebuild from the log, then normal operation resumes
    let rebuilt = ledger.rebuild_balance("acct-1").await.unwrap();
    assert_eq!(rebuilt.credits_available, 50);
    let result = charges
        .charge("acct-1", Feature::ChatMessage, 1, "msg-1")
        .await
        .unwrap();
    assert!(matches!(result, ChargeResult::Success { new_balance: 49, .. }));
}

// =============================================================================
// Payment events
// =============================================================================

#[tokio::test]
async fn test_redelivered_webhook_grants_once() {
    let (db, _tmp) = test_db().await;
    let payments = PaymentProcessor::new(db.pool.clone());
    let ledger = Ledger::new(db.pool.clone());

    let event = PaymentEvent {
        event_id: "evt_1GqIC8".to_string(),
        account_id: "acct-1".to_string(),
        kind: PaymentEventKind::PackPurchase { sku: "pack_large".to_string() },
    };

    let first = payments.apply_payment_event(&event).await.unwrap();
    assert!(matches!(first, PaymentOutcome::Applied { credits_granted: 1200, .. }));

    // Provider redelivery: same event id, no second grant
    let second = payments.apply_payment_event(&event).await.unwrap();
    assert!(matches!(second, PaymentOutcome::Duplicate));

    assert_eq!(ledger.get_balance("acct-1").await.unwrap().credits_available, 1200);
    assert_eq!(ledger.verify_account("acct-1").await.unwrap(), 1200);
}

#[tokio::test]
async fn test_renewal_grant_and_quota_reset_by_period() {
    let (db, _tmp) = test_db().await;
    let payments = PaymentProcessor::new(db.pool.clone());
    let quota = QuotaEngine::new(db.pool.clone());
    let charges = ChargeCoordinator::new(db.pool.clone());

    let event = PaymentEvent {
        event_id: "evt-renewal-1".to_string(),
        account_id: "acct-1".to_string(),
        kind: PaymentEventKind::SubscriptionRenewal { plan_code: "keepsake".to_string() },
    };
    payments.apply_payment_event(&event).await.unwrap();

    charges
        .charge("acct-1", Feature::ChatMessage, 20, "msg-1")
        .await
        .unwrap();

    // Usage counts against the current period only; last month reads zero
    let this_period = kindred_billing::current_period();
    assert_eq!(
        quota.used_units("acct-1", &this_period, Feature::ChatMessage).await.unwrap(),
        20
    );
    assert_eq!(
        quota.used_units("acct-1", "2020-01", Feature::ChatMessage).await.unwrap(),
        0
    );
}

//! Charge coordinator
//!
//! Debits credits exactly once per completed unit of work. Two flows:
//!
//! - `charge`: single-call atomic debit. The conditional balance update is
//!   the first statement of one database transaction, so concurrent charges
//!   against the same balance serialize at the store and can never
//!   double-spend.
//! - `reserve` / `settle` / `release`: two-phase flow wrapping an external
//!   provider call. Credits move into `credits_reserved` while the provider
//!   runs; `settle` converts the hold into a usage-charge transaction,
//!   `release` returns it. `reconcile_stale` sweeps holds that were never
//!   resolved (crashed provider calls) so credits are not stuck in limbo.
//!
//! Both flows are idempotent per caller-supplied reference, not per call:
//! the UNIQUE index on `idempotency_ref` is the backstop for races the
//! pre-checks miss.

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{ChargeResult, Feature, TransactionReason};
use crate::services::catalog;
use crate::services::ledger::{
    append_transaction_row, fold_check, is_unique_violation, GrantOutcome, Ledger,
};
use crate::services::quota::{bump_usage_counter, current_period};

// ============================================================================
// Pending Charges (reservations)
// ============================================================================

/// Lifecycle of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChargeState {
    /// Credits held, provider call in flight
    Held,
    /// Converted into a usage-charge transaction
    Settled,
    /// Hold returned to available credit (cancel or timeout)
    Released,
}

impl std::fmt::Display for PendingChargeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingChargeState::Held => write!(f, "held"),
            PendingChargeState::Settled => write!(f, "settled"),
            PendingChargeState::Released => write!(f, "released"),
        }
    }
}

impl std::str::FromStr for PendingChargeState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "held" => Ok(PendingChargeState::Held),
            "settled" => Ok(PendingChargeState::Settled),
            "released" => Ok(PendingChargeState::Released),
            _ => Err(format!("Unknown pending charge state: {}", s)),
        }
    }
}

/// Database row for a reservation
#[derive(Debug, Clone, FromRow)]
pub struct PendingCharge {
    pub idempotency_ref: String,
    pub account_id: String,
    pub feature: String,
    pub quantity: i64,
    pub amount: i64,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Result of taking a reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// Credits moved into `credits_reserved`
    Held { amount: i64 },
    /// Nothing held, nothing mutated
    InsufficientCredits { required: i64, available: i64 },
    /// This reference already has a reservation (any state)
    Duplicate,
}

// ============================================================================
// ChargeCoordinator
// ============================================================================

/// Atomic debit and reserve/settle protocol against the ledger store
pub struct ChargeCoordinator {
    pool: SqlitePool,
    ledger: Ledger,
}

impl ChargeCoordinator {
    /// Create a new ChargeCoordinator with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        let ledger = Ledger::new(pool.clone());
        Self { pool, ledger }
    }

    /// Credits required to charge `quantity` units of a feature
    pub fn required_credits(feature: Feature, quantity: i64) -> i64 {
        quantity * catalog::price_per_unit(feature)
    }

    /// Atomically debit credits for consumed units.
    ///
    /// Exactly one transaction row per `idempotency_ref`; the usage counter
    /// for the current period moves in the same database transaction as the
    /// debit. On insufficient credit nothing is written.
    pub async fn charge(
        &self,
        account_id: &str,
        feature: Feature,
        quantity: i64,
        idempotency_ref: &str,
    ) -> Result<ChargeResult> {
        if quantity <= 0 {
            return Err(Error::validation("charge quantity must be positive"));
        }
        if idempotency_ref.is_empty() {
            return Err(Error::validation("idempotency reference must not be empty"));
        }

        let required = Self::required_credits(feature, quantity);
        self.ledger.ensure_account(account_id).await?;

        // Cheap short-circuit for client retries; races fall through to the
        // UNIQUE index below.
        if let Some(existing) = self.ledger.find_by_idempotency_ref(idempotency_ref).await? {
            log::debug!(
                "[charge] Idempotency hit for ref {} (tx {})",
                idempotency_ref,
                existing.id
            );
            return Ok(ChargeResult::AlreadyCharged { transaction_id: existing.id });
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"UPDATE credit_balances
               SET credits_available = credits_available - ?,
                   lifetime_spent = lifetime_spent + ?,
                   last_updated = ?
               WHERE account_id = ? AND frozen = 0 AND credits_available >= ?"#,
        )
        .bind(required)
        .bind(required)
        .bind(now)
        .bind(account_id)
        .bind(required)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            let balance = self.ledger.get_balance(account_id).await?;
            if balance.frozen {
                return Err(Error::AccountFrozen(account_id.to_string()));
            }
            log::debug!(
                "[charge] Insufficient credits for {}: required {}, available {}",
                account_id,
                required,
                balance.credits_available
            );
            return Ok(ChargeResult::InsufficientCredits {
                required,
                available: balance.credits_available,
            });
        }

        let transaction_id = match append_transaction_row(
            &mut tx,
            account_id,
            -required,
            TransactionReason::UsageCharge,
            None,
            Some(idempotency_ref),
            Some(&charge_metadata(feature, quantity)),
            now,
        )
        .await
        {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                let existing = self
                    .ledger
                    .find_by_idempotency_ref(idempotency_ref)
                    .await?
                    .ok_or_else(|| Error::internal("duplicate charge ref vanished"))?;
                return Ok(ChargeResult::AlreadyCharged { transaction_id: existing.id });
            }
            Err(e) => return Err(e.into()),
        };

        bump_usage_counter(&mut tx, account_id, &current_period(), feature, quantity, now).await?;

        let (ledger_total, cached_total) = fold_check(&mut tx, account_id).await?;
        if ledger_total != cached_total {
            tx.rollback().await?;
            self.ledger.freeze_account(account_id).await?;
            return Err(Error::LedgerInconsistency {
                account_id: account_id.to_string(),
                ledger_total,
                cached_total,
            });
        }

        let (new_balance,): (i64,) =
            sqlx::query_as("SELECT credits_available FROM credit_balances WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        log::info!(
            "[charge] Charged {} x{} {} ({} credits), balance now {}",
            account_id,
            quantity,
            feature,
            required,
            new_balance
        );

        Ok(ChargeResult::Success { transaction_id, new_balance })
    }

    /// Refund credits against an earlier charge.
    ///
    /// Appends a positive-delta `refund` transaction; the original charge row
    /// is never mutated or deleted.
    pub async fn refund(
        &self,
        account_id: &str,
        credits: i64,
        original_ref: Option<&str>,
        idempotency_ref: Option<&str>,
    ) -> Result<GrantOutcome> {
        let metadata = original_ref
            .map(|r| serde_json::json!({ "refunds": r }).to_string());

        self.ledger
            .grant(
                account_id,
                credits,
                TransactionReason::Refund,
                None,
                idempotency_ref,
                metadata.as_deref(),
            )
            .await
    }

    // ------------------------------------------------------------------
    // Two-phase flow
    // ------------------------------------------------------------------

    /// Hold credits for an in-flight provider call.
    ///
    /// Moves `quantity x price` from available to reserved. No transaction
    /// row is written until `settle`; the fold invariant
    /// `sum(delta) == available + reserved` holds throughout.
    pub async fn reserve(
        &self,
        account_id: &str,
        feature: Feature,
        quantity: i64,
        idempotency_ref: &str,
    ) -> Result<ReservationOutcome> {
        if quantity <= 0 {
            return Err(Error::validation("reservation quantity must be positive"));
        }
        if idempotency_ref.is_empty() {
            return Err(Error::validation("idempotency reference must not be empty"));
        }

        let required = Self::required_credits(feature, quantity);
        self.ledger.ensure_account(account_id).await?;

        if self.get_pending(idempotency_ref).await?.is_some() {
            return Ok(ReservationOutcome::Duplicate);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"UPDATE credit_balances
               SET credits_available = credits_available - ?,
                   credits_reserved = credits_reserved + ?,
                   last_updated = ?
               WHERE account_id = ? AND frozen = 0 AND credits_available >= ?"#,
        )
        .bind(required)
        .bind(required)
        .bind(now)
        .bind(account_id)
        .bind(required)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            let balance = self.ledger.get_balance(account_id).await?;
            if balance.frozen {
                return Err(Error::AccountFrozen(account_id.to_string()));
            }
            return Ok(ReservationOutcome::InsufficientCredits {
                required,
                available: balance.credits_available,
            });
        }

        let inserted = sqlx::query(
            r#"INSERT INTO pending_charges
               (idempotency_ref, account_id, feature, quantity, amount, state, created_at)
               VALUES (?, ?, ?, ?, ?, 'held', ?)"#,
        )
        .bind(idempotency_ref)
        .bind(account_id)
        .bind(feature.to_string())
        .bind(quantity)
        .bind(required)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            tx.rollback().await?;
            if is_unique_violation(&e) {
                return Ok(ReservationOutcome::Duplicate);
            }
            return Err(e.into());
        }

        tx.commit().await?;

        log::info!(
            "[charge] Held {} credits for {} (ref {})",
            required,
            account_id,
            idempotency_ref
        );

        Ok(ReservationOutcome::Held { amount: required })
    }

    /// Convert a held reservation into a committed usage charge.
    ///
    /// Idempotent: settling an already-settled reference returns
    /// `AlreadyCharged`. A reservation that was released (timed out) can no
    /// longer settle.
    pub async fn settle(&self, idempotency_ref: &str) -> Result<ChargeResult> {
        let pending = self
            .get_pending(idempotency_ref)
            .await?
            .ok_or_else(|| Error::not_found(format!("No reservation for ref {}", idempotency_ref)))?;

        let feature: Feature = pending
            .feature
            .parse()
            .map_err(|e: String| Error::internal(e))?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE pending_charges SET state = 'settled', resolved_at = ? \
             WHERE idempotency_ref = ? AND state = 'held'",
        )
        .bind(now)
        .bind(idempotency_ref)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            // Another caller resolved it; report the committed outcome.
            let resolved = self
                .get_pending(idempotency_ref)
                .await?
                .ok_or_else(|| Error::internal("pending charge vanished"))?;
            return match resolved.state.parse::<PendingChargeState>() {
                Ok(PendingChargeState::Settled) => {
                    let existing = self
                        .ledger
                        .find_by_idempotency_ref(idempotency_ref)
                        .await?
                        .ok_or_else(|| Error::internal("settled charge has no transaction"))?;
                    Ok(ChargeResult::AlreadyCharged { transaction_id: existing.id })
                }
                _ => Err(Error::validation(format!(
                    "Reservation {} was released and can no longer settle",
                    idempotency_ref
                ))),
            };
        }

        let updated = sqlx::query(
            r#"UPDATE credit_balances
               SET credits_reserved = credits_reserved - ?,
                   lifetime_spent = lifetime_spent + ?,
                   last_updated = ?
               WHERE account_id = ? AND credits_reserved >= ?"#,
        )
        .bind(pending.amount)
        .bind(pending.amount)
        .bind(now)
        .bind(&pending.account_id)
        .bind(pending.amount)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            self.ledger.freeze_account(&pending.account_id).await?;
            return Err(Error::internal(format!(
                "Reservation {} exceeds reserved credits for {}",
                idempotency_ref, pending.account_id
            )));
        }

        let transaction_id = append_transaction_row(
            &mut tx,
            &pending.account_id,
            -pending.amount,
            TransactionReason::UsageCharge,
            None,
            Some(idempotency_ref),
            Some(&charge_metadata(feature, pending.quantity)),
            now,
        )
        .await?;

        bump_usage_counter(
            &mut tx,
            &pending.account_id,
            &current_period(),
            feature,
            pending.quantity,
            now,
        )
        .await?;

        let (ledger_total, cached_total) = fold_check(&mut tx, &pending.account_id).await?;
        if ledger_total != cached_total {
            tx.rollback().await?;
            self.ledger.freeze_account(&pending.account_id).await?;
            return Err(Error::LedgerInconsistency {
                account_id: pending.account_id,
                ledger_total,
                cached_total,
            });
        }

        let (new_balance,): (i64,) =
            sqlx::query_as("SELECT credits_available FROM credit_balances WHERE account_id = ?")
                .bind(&pending.account_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        log::info!(
            "[charge] Settled reservation {} for {} ({} credits)",
            idempotency_ref,
            pending.account_id,
            pending.amount
        );

        Ok(ChargeResult::Success { transaction_id, new_balance })
    }

    /// Return a held reservation to available credit.
    ///
    /// Returns `false` if the reservation was already resolved.
    pub async fn release(&self, idempotency_ref: &str) -> Result<bool> {
        let pending = self
            .get_pending(idempotency_ref)
            .await?
            .ok_or_else(|| Error::not_found(format!("No reservation for ref {}", idempotency_ref)))?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE pending_charges SET state = 'released', resolved_at = ? \
             WHERE idempotency_ref = ? AND state = 'held'",
        )
        .bind(now)
        .bind(idempotency_ref)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"UPDATE credit_balances
               SET credits_reserved = credits_reserved - ?,
                   credits_available = credits_available + ?,
                   last_updated = ?
               WHERE account_id = ? AND credits_reserved >= ?"#,
        )
        .bind(pending.amount)
        .bind(pending.amount)
        .bind(now)
        .bind(&pending.account_id)
        .bind(pending.amount)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            self.ledger.freeze_account(&pending.account_id).await?;
            return Err(Error::internal(format!(
                "Reservation {} exceeds reserved credits for {}",
                idempotency_ref, pending.account_id
            )));
        }

        tx.commit().await?;

        log::info!(
            "[charge] Released reservation {} for {} ({} credits)",
            idempotency_ref,
            pending.account_id,
            pending.amount
        );

        Ok(true)
    }

    /// Release every held reservation older than `max_age`.
    ///
    /// Bounded-time reconciliation for provider calls that crashed mid-flight
    /// and will never settle. Returns the number of reservations released.
    pub async fn reconcile_stale(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;

        let stale: Vec<(String,)> = sqlx::query_as(
            "SELECT idempotency_ref FROM pending_charges \
             WHERE state = 'held' AND created_at < ? \
             ORDER BY created_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut released = 0u64;
        for (ref_token,) in stale {
            log::warn!("[charge] Auto-releasing stale reservation {}", ref_token);
            if self.release(&ref_token).await? {
                released += 1;
            }
        }

        if released > 0 {
            log::info!("[charge] Reconciled {} stale reservations", released);
        }

        Ok(released)
    }

    /// Look up a reservation by reference
    pub async fn get_pending(&self, idempotency_ref: &str) -> Result<Option<PendingCharge>> {
        let row: Option<PendingCharge> = sqlx::query_as(
            r#"SELECT idempotency_ref, account_id, feature, quantity, amount, state,
                      created_at, resolved_at
               FROM pending_charges WHERE idempotency_ref = ?"#,
        )
        .bind(idempotency_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

fn charge_metadata(feature: Feature, quantity: i64) -> String {
    serde_json::json!({ "feature": feature.to_string(), "quantity": quantity }).to_string()
}

// ============================================================================
// Tests
// ============================================================================

//! Ledger store
//!
//! The append-only `credit_transactions` log is the source of truth; the
//! `credit_balances` row is a materialized fold cache. Every write verifies
//! the fold before committing, and a detected drift freezes the account
//! instead of "correcting" the log.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{CreditBalance, CreditTransaction, TransactionReason};

// ============================================================================
// Database Row Types
// ============================================================================

/// Database row for a credit transaction
#[derive(Debug, Clone, FromRow)]
pub struct StoredTransaction {
    pub seq: i64,
    pub id: String,
    pub account_id: String,
    pub delta: i64,
    pub reason: String,
    pub reference_sku: Option<String>,
    pub idempotency_ref: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredTransaction {
    /// Convert database row to a domain transaction
    ///
    /// Returns `None` if the stored reason is not a known enum value.
    pub fn to_transaction(&self) -> Option<CreditTransaction> {
        let reason = self.reason.parse::<TransactionReason>().ok()?;
        Some(CreditTransaction {
            seq: self.seq,
            id: self.id.clone(),
            account_id: self.account_id.clone(),
            delta: self.delta,
            reason,
            reference_sku: self.reference_sku.clone(),
            idempotency_ref: self.idempotency_ref.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct StoredBalance {
    account_id: String,
    credits_available: i64,
    credits_reserved: i64,
    lifetime_spent: i64,
    frozen: bool,
    last_updated: DateTime<Utc>,
}

impl StoredBalance {
    fn into_balance(self) -> CreditBalance {
        CreditBalance {
            account_id: self.account_id,
            credits_available: self.credits_available,
            credits_reserved: self.credits_reserved,
            lifetime_spent: self.lifetime_spent,
            frozen: self.frozen,
            last_updated: self.last_updated,
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of a grant (positive-delta ledger write)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// One transaction written
    Applied {
        transaction_id: String,
        new_balance: i64,
    },
    /// The idempotency token was already applied
    Duplicate { transaction_id: String },
}

// ============================================================================
// Shared write helpers (used by the charge coordinator as well)
// ============================================================================

/// Whether an sqlx error is a UNIQUE constraint violation
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Append one transaction row inside an open transaction.
///
/// Returns the new transaction id. A UNIQUE violation on `idempotency_ref`
/// propagates to the caller, which rolls back and reports the duplicate.
pub(crate) async fn append_transaction_row(
    conn: &mut SqliteConnection,
    account_id: &str,
    delta: i64,
    reason: TransactionReason,
    reference_sku: Option<&str>,
    idempotency_ref: Option<&str>,
    metadata: Option<&str>,
    now: DateTime<Utc>,
) -> std::result::Result<String, sqlx::Error> {
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"INSERT INTO credit_transactions
           (id, account_id, delta, reason, reference_sku, idempotency_ref, metadata, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(account_id)
    .bind(delta)
    .bind(reason.to_string())
    .bind(reference_sku)
    .bind(idempotency_ref)
    .bind(metadata)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

/// Verify the fold invariant inside an open transaction:
/// `SUM(delta) == credits_available + credits_reserved`.
///
/// Returns `(ledger_total, cached_total)`; the caller decides whether a
/// mismatch rolls back and freezes the account.
pub(crate) async fn fold_check(
    conn: &mut SqliteConnection,
    account_id: &str,
) -> std::result::Result<(i64, i64), sqlx::Error> {
    let (ledger_total,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(delta), 0) FROM credit_transactions WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_one(&mut *conn)
    .await?;

    let (cached_total,): (i64,) = sqlx::query_as(
        "SELECT credits_available + credits_reserved FROM credit_balances WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok((ledger_total, cached_total))
}

// ============================================================================
// Ledger
// ============================================================================

/// Storage layer for credit balances and the transaction log
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Create a new Ledger with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensure the balance cache row exists for an account
    pub(crate) async fn ensure_account(&self, account_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO credit_balances (account_id, last_updated) VALUES (?, ?)",
        )
        .bind(account_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the current balance for an account.
    ///
    /// Accounts with no ledger activity yet read as an empty balance.
    pub async fn get_balance(&self, account_id: &str) -> Result<CreditBalance> {
        let row: Option<StoredBalance> = sqlx::query_as(
            r#"SELECT account_id, credits_available, credits_reserved, lifetime_spent,
                      frozen, last_updated
               FROM credit_balances WHERE account_id = ?"#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(StoredBalance::into_balance)
            .unwrap_or_else(|| CreditBalance::empty(account_id)))
    }

    /// List transactions for an account, newest first.
    ///
    /// Ordering is by the monotonic `seq`, so replaying the result in reverse
    /// reproduces the account's exact insertion order.
    pub async fn list_transactions(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>> {
        let rows: Vec<StoredTransaction> = sqlx::query_as(
            r#"SELECT seq, id, account_id, delta, reason, reference_sku,
                      idempotency_ref, metadata, created_at
               FROM credit_transactions
               WHERE account_id = ?
               ORDER BY seq DESC
               LIMIT ?"#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(StoredTransaction::to_transaction).collect())
    }

    /// Grant credits to an account (pack purchase, renewal grant, promo,
    /// admin adjustment).
    ///
    /// Atomic: balance increment, transaction append, and fold check commit
    /// together. When `idempotency_ref` was already applied the call is a
    /// no-op returning `GrantOutcome::Duplicate`.
    pub async fn grant(
        &self,
        account_id: &str,
        credits: i64,
        reason: TransactionReason,
        reference_sku: Option<&str>,
        idempotency_ref: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<GrantOutcome> {
        if credits <= 0 {
            return Err(Error::validation("grant amount must be positive"));
        }

        self.ensure_account(account_id).await?;

        // Cheap short-circuit; the UNIQUE index is the real backstop below.
        if let Some(ref_token) = idempotency_ref {
            if let Some(existing) = self.find_by_idempotency_ref(ref_token).await? {
                log::debug!(
                    "[ledger] Grant idempotency hit for ref {} (tx {})",
                    ref_token,
                    existing.id
                );
                return Ok(GrantOutcome::Duplicate { transaction_id: existing.id });
            }
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // First statement is a write so the SQLite write lock is taken here
        // and concurrent grants queue behind the busy timeout.
        let updated = sqlx::query(
            r#"UPDATE credit_balances
               SET credits_available = credits_available + ?, last_updated = ?
               WHERE account_id = ? AND frozen = 0"#,
        )
        .bind(credits)
        .bind(now)
        .bind(account_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(Error::AccountFrozen(account_id.to_string()));
        }

        let transaction_id = match append_transaction_row(
            &mut tx,
            account_id,
            credits,
            reason,
            reference_sku,
            idempotency_ref,
            metadata,
            now,
        )
        .await
        {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                let existing = self
                    .find_by_idempotency_ref(idempotency_ref.unwrap_or_default())
                    .await?
                    .ok_or_else(|| Error::internal("duplicate grant ref vanished"))?;
                return Ok(GrantOutcome::Duplicate { transaction_id: existing.id });
            }
            Err(e) => return Err(e.into()),
        };

        let (ledger_total, cached_total) = fold_check(&mut tx, account_id).await?;
        if ledger_total != cached_total {
            tx.rollback().await?;
            self.freeze_account(account_id).await?;
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
            "[ledger] Granted {} credits to {} ({}), balance now {}",
            credits,
            account_id,
            reason,
            new_balance
        );

        Ok(GrantOutcome::Applied { transaction_id, new_balance })
    }

    /// Find a transaction by its idempotency token
    pub async fn find_by_idempotency_ref(
        &self,
        idempotency_ref: &str,
    ) -> Result<Option<CreditTransaction>> {
        let row: Option<StoredTransaction> = sqlx::query_as(
            r#"SELECT seq, id, account_id, delta, reason, reference_sku,
                      idempotency_ref, metadata, created_at
               FROM credit_transactions
               WHERE idempotency_ref = ?"#,
        )
        .bind(idempotency_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| r.to_transaction()))
    }

    /// Verify the fold invariant for an account.
    ///
    /// Returns the fold total on success; a drift freezes the account and
    /// returns `Error::LedgerInconsistency`.
    pub async fn verify_account(&self, account_id: &str) -> Result<i64> {
        self.ensure_account(account_id).await?;

        let mut conn = self.pool.acquire().await?;
        let (ledger_total, cached_total) = fold_check(&mut conn, account_id).await?;
        drop(conn);

        if ledger_total != cached_total {
            log::error!(
                "[ledger] Fold mismatch for {}: log says {}, cache says {}; freezing account",
                account_id,
                ledger_total,
                cached_total
            );
            self.freeze_account(account_id).await?;
            return Err(Error::LedgerInconsistency {
                account_id: account_id.to_string(),
                ledger_total,
                cached_total,
            });
        }

        Ok(ledger_total)
    }

    /// Halt all ledger writes for an account
    pub async fn freeze_account(&self, account_id: &str) -> Result<()> {
        sqlx::query("UPDATE credit_balances SET frozen = 1, last_updated = ? WHERE account_id = ?")
            .bind(Utc::now())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        log::warn!("[ledger] Account {} frozen", account_id);
        Ok(())
    }

    /// Rebuild the balance cache from the transaction log and unfreeze.
    ///
    /// Recovery path: available credit is the fold minus whatever is held in
    /// live reservations; lifetime spend is the sum of usage-charge debits.
    /// The log itself is never touched.
    pub async fn rebuild_balance(&self, account_id: &str) -> Result<CreditBalance> {
        self.ensure_account(account_id).await?;

        let mut tx = self.pool.begin().await?;

        // Take the write lock first so the rebuild sees a stable log.
        sqlx::query("UPDATE credit_balances SET last_updated = ? WHERE account_id = ?")
            .bind(Utc::now())
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        let (fold,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(delta), 0) FROM credit_transactions WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        let (reserved,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0) FROM pending_charges \
             WHERE account_id = ? AND state = 'held'",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        let (spent,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(-delta), 0) FROM credit_transactions \
             WHERE account_id = ? AND reason = 'usage_charge'",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        let available = fold - reserved;
        if available < 0 {
            tx.rollback().await?;
            return Err(Error::LedgerInconsistency {
                account_id: account_id.to_string(),
                ledger_total: fold,
                cached_total: reserved,
            });
        }

        sqlx::query(
            r#"UPDATE credit_balances
               SET credits_available = ?, credits_reserved = ?, lifetime_spent = ?,
                   frozen = 0, last_updated = ?
               WHERE account_id = ?"#,
        )
        .bind(available)
        .bind(reserved)
        .bind(spent)
        .bind(Utc::now())
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        log::info!(
            "[ledger] Rebuilt balance for {}: available={}, reserved={}, spent={}",
            account_id,
            available,
            reserved,
            spent
        );

        self.get_balance(account_id).await
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

    #[tokio::test]
    async fn test_empty_balance() {
        let (db, _tmp) = test_db().await;
        let ledger = Ledger::new(db.pool.clone());

        let balance = ledger.get_balance("acct-1").await.unwrap();
        assert_eq!(balance.credits_available, 0);
        assert_eq!(balance.credits_reserved, 0);
        assert!(!balance.frozen);
    }

    #[tokio::test]
    async fn test_grant_applies_and_writes_transaction() {
        let (db, _tmp) = test_db().await;
        let ledger = Ledger::new(db.pool.clone());

        let outcome = ledger
            .grant("acct-1", 100, TransactionReason::PackPurchase, Some("pack_small"), Some("evt-1"), None)
            .await
            .unwrap();

        match outcome {
            GrantOutcome::Applied { new_balance, .. } => assert_eq!(new_balance, 100),
            other => panic!("expected Applied, got {:?}", other),
        }

        let txs = ledger.list_transactions("acct-1", 10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].delta, 100);
        assert_eq!(txs[0].reason, TransactionReason::PackPurchase);
        assert_eq!(txs[0].reference_sku.as_deref(), Some("pack_small"));
    }

    #[tokio::test]
    async fn test_grant_duplicate_is_noop() {
        let (db, _tmp) = test_db().await;
        let ledger = Ledger::new(db.pool.clone());

        let first = ledger
            .grant("acct-1", 100, TransactionReason::PackPurchase, None, Some("evt-1"), None)
            .await
            .unwrap();
        let second = ledger
            .grant("acct-1", 100, TransactionReason::PackPurchase, None, Some("evt-1"), None)
            .await
            .unwrap();

        let first_id = match first {
            GrantOutcome::Applied { transaction_id, .. } => transaction_id,
            _ => panic!("first grant should apply"),
        };
        match second {
            GrantOutcome::Duplicate { transaction_id } => assert_eq!(transaction_id, first_id),
            other => panic!("expected Duplicate, got {:?}", other),
        }

        let balance = ledger.get_balance("acct-1").await.unwrap();
        assert_eq!(balance.credits_available, 100);
        assert_eq!(ledger.list_transactions("acct-1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_grant_rejects_non_positive() {
        let (db, _tmp) = test_db().await;
        let ledger = Ledger::new(db.pool.clone());

        let err = ledger
            .grant("acct-1", 0, TransactionReason::PromoGrant, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_transactions_newest_first() {
        let (db, _tmp) = test_db().await;
        let ledger = Ledger::new(db.pool.clone());

        for i in 1..=3 {
            ledger
                .grant("acct-1", i * 10, TransactionReason::PromoGrant, None, None, None)
                .await
                .unwrap();
        }

        let txs = ledger.list_transactions("acct-1", 10).await.unwrap();
        assert_eq!(txs.len(), 3);
        assert_eq!(txs[0].delta, 30);
        assert_eq!(txs[2].delta, 10);
        assert!(txs[0].seq > txs[1].seq && txs[1].seq > txs[2].seq);
    }

    #[tokio::test]
    async fn test_verify_detects_drift_and_freezes() {
        let (db, _tmp) = test_db().await;
        let ledger = Ledger::new(db.pool.clone());

        ledger
            .grant("acct-1", 100, TransactionReason::PackPurchase, None, None, None)
            .await
            .unwrap();

        // Corrupt the cache directly (no accompanying transaction row)
        sqlx::query("UPDATE credit_balances SET credits_available = 150 WHERE account_id = 'acct-1'")
            .execute(&db.pool)
            .await
            .unwrap();

        let err = ledger.verify_account("acct-1").await.unwrap_err();
        assert!(matches!(err, Error::LedgerInconsistency { .. }));

        let balance = ledger.get_balance("acct-1").await.unwrap();
        assert!(balance.frozen);

        // Frozen account refuses further writes
        let err = ledger
            .grant("acct-1", 10, TransactionReason::PromoGrant, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountFrozen(_)));
    }

    #[tokio::test]
    async fn test_rebuild_balance_recovers_from_drift() {
        let (db, _tmp) = test_db().await;
        let ledger = Ledger::new(db.pool.clone());

        ledger
            .grant("acct-1", 100, TransactionReason::PackPurchase, None, None, None)
            .await
            .unwrap();

        sqlx::query("UPDATE credit_balances SET credits_available = 999, frozen = 1 WHERE account_id = 'acct-1'")
            .execute(&db.pool)
            .await
            .unwrap();

        let rebuilt = ledger.rebuild_balance("acct-1").await.unwrap();
        assert_eq!(rebuilt.credits_available, 100);
        assert!(!rebuilt.frozen);
        assert_eq!(ledger.verify_account("acct-1").await.unwrap(), 100);
    }
}

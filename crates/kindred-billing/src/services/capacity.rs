//! Capacity allocator
//!
//! Arbitrates the fixed pool of voice-personalization slots. The pool row is
//! the one globally shared mutable resource in the system, so every grant
//! goes through a single conditional update - compare-and-swap against the
//! store - and two concurrent claims can never both take the last free slot.
//! When no slot is free the claim is durably enqueued instead of rejected.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{CapacityPool, ClaimResult, SlotAssignment, WaitlistEntryStatus};
use crate::services::ledger::is_unique_violation;

/// Slot pool state and assignment operations
pub struct CapacityAllocator {
    pool: SqlitePool,
}

impl CapacityAllocator {
    /// Create a new CapacityAllocator with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current pool counters
    pub async fn pool_status(&self) -> Result<CapacityPool> {
        let (max_slots, buffer_slots, active_slots): (i64, i64, i64) = sqlx::query_as(
            "SELECT max_slots, buffer_slots, active_slots FROM capacity_pool WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CapacityPool { max_slots, buffer_slots, active_slots })
    }

    /// Resize the pool (admin operation).
    ///
    /// Shrinking below the current active count is allowed; availability
    /// clamps at zero and frees up again as slots are released.
    pub async fn configure_pool(&self, max_slots: i64, buffer_slots: i64) -> Result<CapacityPool> {
        if max_slots < 0 || buffer_slots < 0 {
            return Err(Error::validation("pool sizes must be non-negative"));
        }
        if buffer_slots > max_slots {
            return Err(Error::validation("buffer cannot exceed max slots"));
        }

        sqlx::query("UPDATE capacity_pool SET max_slots = ?, buffer_slots = ? WHERE id = 1")
            .bind(max_slots)
            .bind(buffer_slots)
            .execute(&self.pool)
            .await?;

        log::info!("[capacity] Pool configured: max={}, buffer={}", max_slots, buffer_slots);
        self.pool_status().await
    }

    /// The account's active slot assignment, if any
    pub async fn active_assignment(&self, account_id: &str) -> Result<Option<SlotAssignment>> {
        let row: Option<SlotAssignment> = sqlx::query_as(
            r#"SELECT id, account_id, source, assigned_at, released_at
               FROM slot_assignments
               WHERE account_id = ? AND released_at IS NULL"#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Claim a personalization slot.
    ///
    /// Idempotent for holders; queues instead of failing when the pool is
    /// exhausted. The returned queue position is 1-based.
    pub async fn claim_slot(
        &self,
        account_id: &str,
        interest_tag: Option<&str>,
    ) -> Result<ClaimResult> {
        if let Some(existing) = self.active_assignment(account_id).await? {
            // A promoted account observing its held slot completes the
            // waitlist lifecycle.
            self.mark_fulfilled(account_id).await?;
            return Ok(ClaimResult::AlreadyHeld { slot_ref: existing.id });
        }

        match self.try_grant(account_id, "claim").await? {
            Some(slot_ref) => Ok(ClaimResult::Granted { slot_ref }),
            None => self.enqueue(account_id, interest_tag).await,
        }
    }

    /// Atomic test-and-decrement grant path, shared with waitlist promotion.
    ///
    /// Returns `None` when the pool has no free slot. An account that
    /// already holds a slot gets its existing assignment back.
    pub(crate) async fn try_grant(
        &self,
        account_id: &str,
        source: &str,
    ) -> Result<Option<String>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // The CAS: take the last free slot or nothing, never both.
        let granted = sqlx::query(
            r#"UPDATE capacity_pool
               SET active_slots = active_slots + 1
               WHERE id = 1 AND (max_slots - buffer_slots - active_slots) > 0"#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if granted == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let slot_ref = Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            r#"INSERT INTO slot_assignments (id, account_id, source, assigned_at)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(&slot_ref)
        .bind(account_id)
        .bind(source)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            // Concurrent claim by the same account won the active-assignment
            // index; this grant (including the pool increment) rolls back.
            tx.rollback().await?;
            if is_unique_violation(&e) {
                let existing = self
                    .active_assignment(account_id)
                    .await?
                    .ok_or_else(|| Error::internal("active assignment vanished"))?;
                return Ok(Some(existing.id));
            }
            return Err(e.into());
        }

        tx.commit().await?;

        log::info!("[capacity] Granted slot {} to {} ({})", slot_ref, account_id, source);
        Ok(Some(slot_ref))
    }

    /// Durably enqueue a claim that found no free slot
    async fn enqueue(&self, account_id: &str, interest_tag: Option<&str>) -> Result<ClaimResult> {
        // Collapse onto an existing pending entry
        if let Some((entry_id, requested_at)) = self.pending_entry(account_id).await? {
            let position = self.queued_position(&requested_at, &entry_id).await?;
            return Ok(ClaimResult::Queued { entry_id, position });
        }

        let entry_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"INSERT INTO waitlist_entries (id, account_id, requested_at, status, interest_tag)
               VALUES (?, ?, ?, 'queued', ?)"#,
        )
        .bind(&entry_id)
        .bind(account_id)
        .bind(now)
        .bind(interest_tag)
        .execute(&self.pool)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                // Lost the race to another claim by the same account
                let (entry_id, requested_at) = self
                    .pending_entry(account_id)
                    .await?
                    .ok_or_else(|| Error::internal("pending waitlist entry vanished"))?;
                let position = self.queued_position(&requested_at, &entry_id).await?;
                return Ok(ClaimResult::Queued { entry_id, position });
            }
            return Err(e.into());
        }

        // Compare against the stored string form so ordering matches SQLite's
        let (stored_requested_at,): (String,) =
            sqlx::query_as("SELECT requested_at FROM waitlist_entries WHERE id = ?")
                .bind(&entry_id)
                .fetch_one(&self.pool)
                .await?;
        let position = self.queued_position(&stored_requested_at, &entry_id).await?;

        log::info!(
            "[capacity] No slot free; queued {} at position {}",
            account_id,
            position
        );

        Ok(ClaimResult::Queued { entry_id, position })
    }

    /// The account's pending (queued or processing) waitlist entry
    async fn pending_entry(&self, account_id: &str) -> Result<Option<(String, String)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT id, requested_at FROM waitlist_entries
               WHERE account_id = ? AND status IN ('queued', 'processing')"#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// 1-based FIFO position: earlier queued entries + 1.
    ///
    /// Accepts `requested_at` in its stored string form so the comparison
    /// matches SQLite's ordering exactly; ties break on id.
    pub(crate) async fn queued_position(&self, requested_at: &str, entry_id: &str) -> Result<i64> {
        let (earlier,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM waitlist_entries
               WHERE status = 'queued'
                 AND (requested_at < ? OR (requested_at = ? AND id < ?))"#,
        )
        .bind(requested_at)
        .bind(requested_at)
        .bind(entry_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(earlier + 1)
    }

    /// Release the account's active slot back to the pool.
    ///
    /// Returns `false` if the account holds no slot. Freed capacity is handed
    /// out by the next waitlist sweep, not here.
    pub async fn release_slot(&self, account_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let released = sqlx::query(
            "UPDATE slot_assignments SET released_at = ? \
             WHERE account_id = ? AND released_at IS NULL",
        )
        .bind(now)
        .bind(account_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if released == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let decremented = sqlx::query(
            "UPDATE capacity_pool SET active_slots = active_slots - 1 \
             WHERE id = 1 AND active_slots > 0",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if decremented == 0 {
            // An assignment existed but the pool counter was already zero
            tx.rollback().await?;
            return Err(Error::internal(
                "capacity pool counter disagrees with slot assignments",
            ));
        }

        tx.commit().await?;

        log::info!("[capacity] Released slot held by {}", account_id);
        Ok(true)
    }

    /// Complete the lifecycle of a notified entry once the account observes
    /// its promoted slot
    async fn mark_fulfilled(&self, account_id: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE waitlist_entries SET status = ?, fulfilled_at = ? \
             WHERE account_id = ? AND status = ?",
        )
        .bind(WaitlistEntryStatus::Fulfilled.to_string())
        .bind(Utc::now())
        .bind(account_id)
        .bind(WaitlistEntryStatus::Notified.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            log::debug!("[capacity] Waitlist entry for {} fulfilled", account_id);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Waitlist processor
//!
//! Promotes queued claims as slots free up. Runs out-of-band (timer-driven
//! or on slot release), never on the request path. Promotion is strict FIFO
//! on `(requested_at, id)` and goes through the allocator's atomic grant
//! path, so a sweep can race user claims without over-allocating.
//!
//! Each entry moves `queued -> processing -> notified`; a failed
//! notification leaves the entry `processing` for the next sweep and never
//! blocks the entries behind it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{WaitlistEntry, WaitlistEntryStatus};
use crate::services::capacity::CapacityAllocator;

// ============================================================================
// Notification seam
// ============================================================================

/// Channel used to tell an account its slot is ready.
///
/// The real implementation lives outside this crate (email/push); the
/// default just logs, which is enough for local and test runs.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn slot_available(&self, account_id: &str, entry_id: &str) -> Result<()>;
}

/// Default notifier: log and succeed
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn slot_available(&self, account_id: &str, entry_id: &str) -> Result<()> {
        log::info!(
            "[waitlist] Slot ready for {} (entry {})",
            account_id,
            entry_id
        );
        Ok(())
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, Clone, FromRow)]
struct StoredWaitlistEntry {
    id: String,
    account_id: String,
    requested_at: DateTime<Utc>,
    status: String,
    interest_tag: Option<String>,
    notified_at: Option<DateTime<Utc>>,
    fulfilled_at: Option<DateTime<Utc>>,
}

impl StoredWaitlistEntry {
    fn to_entry(&self) -> Option<WaitlistEntry> {
        let status = self.status.parse::<WaitlistEntryStatus>().ok()?;
        Some(WaitlistEntry {
            id: self.id.clone(),
            account_id: self.account_id.clone(),
            requested_at: self.requested_at,
            status,
            interest_tag: self.interest_tag.clone(),
            notified_at: self.notified_at,
            fulfilled_at: self.fulfilled_at,
        })
    }
}

// ============================================================================
// Results
// ============================================================================

/// Summary of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepResult {
    /// Entries granted a slot this sweep
    pub promoted: usize,
    /// Entries whose notification went out (this sweep's promotions plus
    /// retries of earlier failures)
    pub notified: usize,
    /// Entries left in `processing` after a failed notification
    pub notify_failures: usize,
    /// Orphaned `processing` entries returned to the queue
    pub requeued: usize,
}

/// An account's view of its place in line
#[derive(Debug, Clone, Serialize)]
pub struct WaitlistStatus {
    pub entry_id: String,
    pub status: WaitlistEntryStatus,
    /// 1-based FIFO position; only present while queued
    pub position: Option<i64>,
    pub requested_at: DateTime<Utc>,
}

// ============================================================================
// WaitlistProcessor
// ============================================================================

/// FIFO promotion of pending claims
pub struct WaitlistProcessor {
    pool: SqlitePool,
    capacity: CapacityAllocator,
    notifier: Arc<dyn Notifier>,
}

impl WaitlistProcessor {
    /// Create a processor with the default log-only notifier
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_notifier(pool, Arc::new(LogNotifier))
    }

    /// Create a processor with a custom notification channel
    pub fn with_notifier(pool: SqlitePool, notifier: Arc<dyn Notifier>) -> Self {
        let capacity = CapacityAllocator::new(pool.clone());
        Self { pool, capacity, notifier }
    }

    /// Promote up to `n` entries.
    ///
    /// Idempotent: entries already past `queued` are not picked up again, so
    /// re-running a sweep is a no-op. One entry failing to notify does not
    /// stop the sweep.
    pub async fn process_next(&self, n: usize) -> Result<SweepResult> {
        let mut result = SweepResult::default();

        self.retry_processing(&mut result).await?;

        for _ in 0..n {
            if self.capacity.pool_status().await?.slots_available() == 0 {
                break;
            }

            let Some((entry_id, account_id)) = self.oldest_queued().await? else {
                break;
            };

            // CAS queued -> processing; a concurrent sweep may have won
            if !self
                .transition(&entry_id, WaitlistEntryStatus::Queued, WaitlistEntryStatus::Processing)
                .await?
            {
                continue;
            }

            match self.capacity.try_grant(&account_id, "waitlist").await? {
                Some(_slot_ref) => {
                    result.promoted += 1;
                    self.notify(&entry_id, &account_id, &mut result).await?;
                }
                None => {
                    // Slot taken between the availability check and the
                    // grant; put the entry back (requested_at is unchanged,
                    // so its FIFO position is preserved) and stop.
                    self.requeue(&entry_id).await?;
                    break;
                }
            }
        }

        if result.promoted > 0 || result.notify_failures > 0 || result.requeued > 0 {
            log::info!(
                "[waitlist] Sweep: {} promoted, {} notified, {} failed, {} requeued",
                result.promoted,
                result.notified,
                result.notify_failures,
                result.requeued
            );
        }

        Ok(result)
    }

    /// Recover entries parked in `processing` by an earlier sweep.
    ///
    /// An entry whose account holds a slot only needs its notification
    /// retried; an entry whose grant never happened (crash between the state
    /// transition and the grant) goes back to the queue.
    async fn retry_processing(&self, result: &mut SweepResult) -> Result<()> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"SELECT id, account_id FROM waitlist_entries
               WHERE status = 'processing'
               ORDER BY requested_at, id"#,
        )
        .fetch_all(&self.pool)
        .await?;

        for (entry_id, account_id) in rows {
            if self.capacity.active_assignment(&account_id).await?.is_some() {
                self.notify(&entry_id, &account_id, result).await?;
            } else if self.requeue(&entry_id).await? {
                result.requeued += 1;
            }
        }

        Ok(())
    }

    /// Send the notification and advance to `notified`; on failure the entry
    /// stays `processing` for the next sweep.
    async fn notify(
        &self,
        entry_id: &str,
        account_id: &str,
        result: &mut SweepResult,
    ) -> Result<()> {
        match self.notifier.slot_available(account_id, entry_id).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE waitlist_entries SET status = 'notified', notified_at = ? \
                     WHERE id = ? AND status = 'processing'",
                )
                .bind(Utc::now())
                .bind(entry_id)
                .execute(&self.pool)
                .await?;
                result.notified += 1;
            }
            Err(e) => {
                log::warn!(
                    "[waitlist] Notification failed for {} (entry {}): {}; will retry",
                    account_id,
                    entry_id,
                    e
                );
                result.notify_failures += 1;
            }
        }
        Ok(())
    }

    async fn requeue(&self, entry_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE waitlist_entries SET status = 'queued' \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn transition(
        &self,
        entry_id: &str,
        from: WaitlistEntryStatus,
        to: WaitlistEntryStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::internal(format!(
                "illegal waitlist transition {} -> {}",
                from, to
            )));
        }

        let updated = sqlx::query("UPDATE waitlist_entries SET status = ? WHERE id = ? AND status = ?")
            .bind(to.to_string())
            .bind(entry_id)
            .bind(from.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(updated > 0)
    }

    /// Oldest queued entry, strict FIFO
    async fn oldest_queued(&self) -> Result<Option<(String, String)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT id, account_id FROM waitlist_entries
               WHERE status = 'queued'
               ORDER BY requested_at, id
               LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// The account's most recent waitlist entry, with its position while
    /// still queued
    pub async fn status(&self, account_id: &str) -> Result<Option<WaitlistStatus>> {
        let row: Option<StoredWaitlistEntry> = sqlx::query_as(
            r#"SELECT id, account_id, requested_at, status, interest_tag,
                      notified_at, fulfilled_at
               FROM waitlist_entries
               WHERE account_id = ?
               ORDER BY requested_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(stored) = row else {
            return Ok(None);
        };
        let entry = stored
            .to_entry()
            .ok_or_else(|| Error::internal(format!("unknown waitlist status: {}", stored.status)))?;

        let position = if entry.status == WaitlistEntryStatus::Queued {
            // Recompute against the stored string form for exact ordering
            let (requested_at,): (String,) =
                sqlx::query_as("SELECT requested_at FROM waitlist_entries WHERE id = ?")
                    .bind(&entry.id)
                    .fetch_one(&self.pool)
                    .await?;
            Some(self.capacity.queued_position(&requested_at, &entry.id).await?)
        } else {
            None
        };

        Ok(Some(WaitlistStatus {
            entry_id: entry.id,
            status: entry.status,
            position,
            requested_at: entry.requested_at,
        }))
    }

    /// Recent entries across all accounts, oldest pending first (ops view)
    pub async fn list_entries(&self, limit: i64) -> Result<Vec<WaitlistEntry>> {
        let rows: Vec<StoredWaitlistEntry> = sqlx::query_as(
            r#"SELECT id, account_id, requested_at, status, interest_tag,
                      notified_at, fulfilled_at
               FROM waitlist_entries
               ORDER BY requested_at, id
               LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(StoredWaitlistEntry::to_entry).collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

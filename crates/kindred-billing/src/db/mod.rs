//! Database module - SQLx with SQLite
//!
//! The billing subsystem is written to by concurrent workers (user actions,
//! payment webhooks, waitlist sweeps), so the pool is opened with WAL journal
//! mode and a busy timeout. Invariants are enforced with conditional updates
//! and single transactions, never in-process locks.

use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;

/// Database state
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default path
    pub async fn new() -> Result<Self> {
        let db_path = get_db_path()?;
        Self::open(db_path).await
    }

    /// Create a new database connection with a specific path
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::info!("Connecting to database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        log::info!("Running database migrations...");

        // Materialized fold of credit_transactions, one row per account.
        // Invariant: credits_available >= 0 and
        // SUM(credit_transactions.delta) == credits_available + credits_reserved.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_balances (
                account_id TEXT PRIMARY KEY,
                credits_available INTEGER NOT NULL DEFAULT 0 CHECK (credits_available >= 0),
                credits_reserved INTEGER NOT NULL DEFAULT 0 CHECK (credits_reserved >= 0),
                lifetime_spent INTEGER NOT NULL DEFAULT 0 CHECK (lifetime_spent >= 0),
                frozen BOOLEAN NOT NULL DEFAULT 0,
                last_updated DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only source of truth. Never updated or deleted; `seq`
        // preserves per-account insertion order for audit replay.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_transactions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                delta INTEGER NOT NULL,
                reason TEXT NOT NULL,
                reference_sku TEXT,
                idempotency_ref TEXT,
                metadata TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_tx_idempotency \
             ON credit_transactions(idempotency_ref) WHERE idempotency_ref IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_credit_tx_account \
             ON credit_transactions(account_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        // Per-account, per-period metered usage. Created lazily on first use
        // in a period; never deleted.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_counters (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                period TEXT NOT NULL,
                feature TEXT NOT NULL,
                used_units INTEGER NOT NULL DEFAULT 0 CHECK (used_units >= 0),
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(account_id, period, feature)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Account -> plan mapping. Plans themselves are in-code reference
        // data (services::catalog); accounts without a row are on the free plan.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_plans (
                account_id TEXT PRIMARY KEY,
                plan_code TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Two-phase charges: credits held in credits_reserved until settled
        // or released. A held row older than the reconciliation window is
        // auto-released.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_charges (
                idempotency_ref TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                feature TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'held',
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                resolved_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_charges_state \
             ON pending_charges(state, created_at)",
        )
        .execute(&self.pool)
        .await?;

        // Singleton personalization capacity pool. Every mutation goes
        // through the allocator's conditional update.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS capacity_pool (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                max_slots INTEGER NOT NULL CHECK (max_slots >= 0),
                buffer_slots INTEGER NOT NULL CHECK (buffer_slots >= 0),
                active_slots INTEGER NOT NULL DEFAULT 0 CHECK (active_slots >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO capacity_pool (id, max_slots, buffer_slots, active_slots) \
             VALUES (1, ?, ?, 0)",
        )
        .bind(DEFAULT_MAX_SLOTS)
        .bind(DEFAULT_BUFFER_SLOTS)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS slot_assignments (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'claim',
                assigned_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                released_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one active assignment per account; the allocator relies on
        // this as the backstop for concurrent claims by the same account.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_slot_assignments_active \
             ON slot_assignments(account_id) WHERE released_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS waitlist_entries (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                requested_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                status TEXT NOT NULL DEFAULT 'queued',
                interest_tag TEXT,
                notified_at DATETIME,
                fulfilled_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_waitlist_status \
             ON waitlist_entries(status, requested_at, id)",
        )
        .execute(&self.pool)
        .await?;
        // At most one pending entry per account; concurrent claims by the
        // same account collapse onto it.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_waitlist_pending \
             ON waitlist_entries(account_id) WHERE status IN ('queued', 'processing')",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_waitlist_account \
             ON waitlist_entries(account_id, requested_at)",
        )
        .execute(&self.pool)
        .await?;

        log::info!("Database migrations completed");
        Ok(())
    }
}

/// Default personalization pool size when the pool row is first created
pub const DEFAULT_MAX_SLOTS: i64 = 50;

/// Default slots held back from allocation
pub const DEFAULT_BUFFER_SLOTS: i64 = 2;

/// Get database file path
/// Priority: KINDRED_DB_PATH env var > default app data directory
pub fn get_db_path() -> Result<PathBuf> {
    // Check for environment variable override
    if let Ok(path) = std::env::var("KINDRED_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    // Default: use app data directory
    let dirs = directories::ProjectDirs::from("com", "kindred", "Kindred")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.data_dir().join("kindred.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_get_db_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        // Without env var, should return default path
        std::env::remove_var("KINDRED_DB_PATH");
        let path = get_db_path().unwrap();
        assert!(path.to_string_lossy().contains("kindred.db"));
    }

    #[test]
    fn test_get_db_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let test_path = "/tmp/test_kindred.db";
        std::env::set_var("KINDRED_DB_PATH", test_path);
        let path = get_db_path().unwrap();
        assert_eq!(path.to_string_lossy(), test_path);
        std::env::remove_var("KINDRED_DB_PATH");
    }

    #[tokio::test]
    async fn test_open_seeds_capacity_pool() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("test.db")).await.unwrap();

        let (max_slots, buffer_slots, active_slots): (i64, i64, i64) =
            sqlx::query_as("SELECT max_slots, buffer_slots, active_slots FROM capacity_pool WHERE id = 1")
                .fetch_one(&db.pool)
                .await
                .unwrap();

        assert_eq!(max_slots, DEFAULT_MAX_SLOTS);
        assert_eq!(buffer_slots, DEFAULT_BUFFER_SLOTS);
        assert_eq!(active_slots, 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");

        let db = Database::open(path.clone()).await.unwrap();
        drop(db);

        // Re-opening runs migrations again; must not fail or reset the pool
        let db = Database::open(path).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM capacity_pool")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }
}

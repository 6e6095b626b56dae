//! Quota engine
//!
//! Cheap, pure-read pre-check run before any provider call: resolves the
//! account's plan, compares requested units against the current-period usage
//! counter. Counters are created lazily by the charge coordinator; a missing
//! row reads as zero usage.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Feature, QuotaDecision, UsageCounter};
use crate::services::catalog::{self, Plan, DEFAULT_PLAN_CODE, UNLIMITED};

/// Current billing period in `YYYY-MM` form
pub fn current_period() -> String {
    period_for(Utc::now())
}

/// Billing period containing the given instant
pub fn period_for(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Increment a usage counter inside an open transaction.
///
/// Creates the period row on first use. Called by the charge coordinator so
/// the counter moves in the same transaction as the debit.
pub(crate) async fn bump_usage_counter(
    conn: &mut SqliteConnection,
    account_id: &str,
    period: &str,
    feature: Feature,
    units: i64,
    now: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO usage_counters (id, account_id, period, feature, used_units, updated_at)
           VALUES (?, ?, ?, ?, ?, ?)
           ON CONFLICT(account_id, period, feature)
           DO UPDATE SET used_units = used_units + excluded.used_units, updated_at = excluded.updated_at"#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(account_id)
    .bind(period)
    .bind(feature.to_string())
    .bind(units)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Plan-limit and usage-counter reads
pub struct QuotaEngine {
    pool: SqlitePool,
}

impl QuotaEngine {
    /// Create a new QuotaEngine with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve the account's plan; accounts with no plan row are on the
    /// default (free) plan.
    pub async fn plan_for_account(&self, account_id: &str) -> Result<&'static Plan> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT plan_code FROM account_plans WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        let code = row.map(|(c,)| c).unwrap_or_else(|| DEFAULT_PLAN_CODE.to_string());

        catalog::plan_by_code(&code).ok_or_else(|| {
            Error::config(format!("Account {} references unknown plan {}", account_id, code))
        })
    }

    /// Assign a plan to an account
    pub async fn set_plan(&self, account_id: &str, plan_code: &str) -> Result<()> {
        if catalog::plan_by_code(plan_code).is_none() {
            return Err(Error::validation(format!("Unknown plan code: {}", plan_code)));
        }

        sqlx::query(
            r#"INSERT INTO account_plans (account_id, plan_code, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT(account_id)
               DO UPDATE SET plan_code = excluded.plan_code, updated_at = excluded.updated_at"#,
        )
        .bind(account_id)
        .bind(plan_code)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        log::info!("[quota] Account {} now on plan {}", account_id, plan_code);
        Ok(())
    }

    /// Units of a feature the account has consumed in a period.
    ///
    /// First use in a new period has no counter row; that reads as zero.
    pub async fn used_units(
        &self,
        account_id: &str,
        period: &str,
        feature: Feature,
    ) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT used_units FROM usage_counters \
             WHERE account_id = ? AND period = ? AND feature = ?",
        )
        .bind(account_id)
        .bind(period)
        .bind(feature.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(u,)| u).unwrap_or(0))
    }

    /// Decide whether a metered action may proceed. Pure read, no side
    /// effects; designed to run before the provider is invoked.
    pub async fn check_quota(
        &self,
        account_id: &str,
        feature: Feature,
        requested_units: i64,
    ) -> Result<QuotaDecision> {
        if requested_units <= 0 {
            return Err(Error::validation("requested units must be positive"));
        }

        let plan = self.plan_for_account(account_id).await?;
        let limit = plan.limit_for(feature);

        if limit == UNLIMITED {
            return Ok(QuotaDecision::Allowed);
        }

        let period = current_period();
        let used = self.used_units(account_id, &period, feature).await?;

        if used + requested_units > limit {
            log::debug!(
                "[quota] Denied {} x{} for {} (used {} of {})",
                feature,
                requested_units,
                account_id,
                used,
                limit
            );
            return Ok(QuotaDecision::Denied {
                feature,
                used,
                requested: requested_units,
                limit,
            });
        }

        Ok(QuotaDecision::Allowed)
    }

    /// All usage counters for an account in a period
    pub async fn usage_for_period(
        &self,
        account_id: &str,
        period: &str,
    ) -> Result<Vec<UsageCounter>> {
        let rows: Vec<(String, String, String, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"SELECT account_id, period, feature, used_units, updated_at
               FROM usage_counters
               WHERE account_id = ? AND period = ?
               ORDER BY feature"#,
        )
        .bind(account_id)
        .bind(period)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(account_id, period, feature, used_units, updated_at)| {
                let feature = feature.parse::<Feature>().ok()?;
                Some(UsageCounter { account_id, period, feature, used_units, updated_at })
            })
            .collect())
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

    async fn seed_usage(pool: &SqlitePool, account_id: &str, feature: Feature, units: i64) {
        let mut conn = pool.acquire().await.unwrap();
        bump_usage_counter(&mut conn, account_id, &current_period(), feature, units, Utc::now())
            .await
            .unwrap();
    }

    #[test]
    fn test_period_format() {
        let at = DateTime::parse_from_rfc3339("2025-03-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(period_for(at), "2025-03");
    }

    #[tokio::test]
    async fn test_default_plan_is_free() {
        let (db, _tmp) = test_db().await;
        let quota = QuotaEngine::new(db.pool.clone());

        let plan = quota.plan_for_account("acct-1").await.unwrap();
        assert_eq!(plan.code, "free");
    }

    #[tokio::test]
    async fn test_set_plan() {
        let (db, _tmp) = test_db().await;
        let quota = QuotaEngine::new(db.pool.clone());

        quota.set_plan("acct-1", "family").await.unwrap();
        assert_eq!(quota.plan_for_account("acct-1").await.unwrap().code, "family");

        let err = quota.set_plan("acct-1", "bogus").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_first_use_in_period_reads_zero() {
        let (db, _tmp) = test_db().await;
        let quota = QuotaEngine::new(db.pool.clone());

        let used = quota
            .used_units("acct-1", &current_period(), Feature::ChatMessage)
            .await
            .unwrap();
        assert_eq!(used, 0);

        let decision = quota.check_quota("acct-1", Feature::ChatMessage, 1).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_quota_boundary() {
        let (db, _tmp) = test_db().await;
        let quota = QuotaEngine::new(db.pool.clone());

        // Free plan: 30 chat messages per month. 29 used + 1 == limit -> allowed.
        seed_usage(&db.pool, "acct-1", Feature::ChatMessage, 29).await;
        let decision = quota.check_quota("acct-1", Feature::ChatMessage, 1).await.unwrap();
        assert!(decision.is_allowed());

        // 30 used + 1 == limit + 1 -> denied.
        seed_usage(&db.pool, "acct-1", Feature::ChatMessage, 1).await;
        let decision = quota.check_quota("acct-1", Feature::ChatMessage, 1).await.unwrap();
        match decision {
            QuotaDecision::Denied { used, limit, .. } => {
                assert_eq!(used, 30);
                assert_eq!(limit, 30);
            }
            other => panic!("expected Denied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unlimited_always_allowed() {
        let (db, _tmp) = test_db().await;
        let quota = QuotaEngine::new(db.pool.clone());

        quota.set_plan("acct-1", "family").await.unwrap();
        seed_usage(&db.pool, "acct-1", Feature::ChatMessage, 1_000_000).await;

        let decision = quota
            .check_quota("acct-1", Feature::ChatMessage, 1_000_000)
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_check_quota_rejects_non_positive_units() {
        let (db, _tmp) = test_db().await;
        let quota = QuotaEngine::new(db.pool.clone());

        let err = quota.check_quota("acct-1", Feature::ChatMessage, 0).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_usage_for_period_lists_counters() {
        let (db, _tmp) = test_db().await;
        let quota = QuotaEngine::new(db.pool.clone());

        seed_usage(&db.pool, "acct-1", Feature::ChatMessage, 5).await;
        seed_usage(&db.pool, "acct-1", Feature::SpeechSynthesis, 12).await;

        let counters = quota.usage_for_period("acct-1", &current_period()).await.unwrap();
        assert_eq!(counters.len(), 2);
        assert!(counters
            .iter()
            .any(|c| c.feature == Feature::SpeechSynthesis && c.used_units == 12));
    }
}

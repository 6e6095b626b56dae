//! Account commands
//!
//! Balance, transaction history, plan assignment, per-period usage, and
//! ledger maintenance (verify/rebuild) for a single account.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use kindred_billing::{current_period, GrantOutcome, Ledger, QuotaEngine, TransactionReason};

use crate::commands::Context;
use crate::output::{print_output, print_single, print_success, print_warning};

#[derive(Subcommand)]
pub enum AccountAction {
    /// Show an account's credit balance
    Balance {
        /// Account ID
        account: String,
    },

    /// List an account's ledger transactions, newest first
    History {
        /// Account ID
        account: String,

        /// Maximum number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show metered usage for a billing period
    Usage {
        /// Account ID
        account: String,

        /// Billing period (YYYY-MM), defaults to the current period
        #[arg(short, long)]
        period: Option<String>,
    },

    /// Grant credits to an account (promo or admin adjustment)
    Grant {
        /// Account ID
        account: String,

        /// Credits to grant
        credits: i64,

        /// Mark the grant as an admin adjustment instead of a promo
        #[arg(long)]
        admin: bool,

        /// Idempotency reference (a duplicate reference is a no-op)
        #[arg(short, long)]
        reference: Option<String>,
    },

    /// Assign a subscription plan to an account
    SetPlan {
        /// Account ID
        account: String,

        /// Plan code (free, keepsake, family)
        plan: String,
    },

    /// Verify the ledger fold invariant for an account
    Verify {
        /// Account ID
        account: String,
    },

    /// Rebuild the balance cache from the transaction log and unfreeze
    Rebuild {
        /// Account ID
        account: String,
    },
}

/// Balance row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct BalanceRow {
    #[tabled(rename = "Account")]
    pub account: String,
    #[tabled(rename = "Available")]
    pub available: i64,
    #[tabled(rename = "Reserved")]
    pub reserved: i64,
    #[tabled(rename = "Lifetime Spent")]
    pub lifetime_spent: i64,
    #[tabled(rename = "Frozen")]
    pub frozen: String,
}

/// Transaction row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct TransactionRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Delta")]
    pub delta: String,
    #[tabled(rename = "Reason")]
    pub reason: String,
    #[tabled(rename = "SKU")]
    pub sku: String,
    #[tabled(rename = "Created")]
    pub created_at: String,
}

/// Usage counter row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct UsageRow {
    #[tabled(rename = "Feature")]
    pub feature: String,
    #[tabled(rename = "Used")]
    pub used: i64,
    #[tabled(rename = "Period")]
    pub period: String,
}

pub async fn execute(ctx: &Context, action: AccountAction) -> Result<()> {
    let ledger = Ledger::new(ctx.db.pool.clone());
    let quota = QuotaEngine::new(ctx.db.pool.clone());

    match action {
        AccountAction::Balance { account } => {
            let balance = ledger.get_balance(&account).await?;
            let row = BalanceRow {
                account: balance.account_id,
                available: balance.credits_available,
                reserved: balance.credits_reserved,
                lifetime_spent: balance.lifetime_spent,
                frozen: if balance.frozen { "yes".to_string() } else { "no".to_string() },
            };
            print_single(&row, ctx.format)?;
        }

        AccountAction::History { account, limit } => {
            let transactions = ledger.list_transactions(&account, limit).await?;
            let rows: Vec<TransactionRow> = transactions
                .into_iter()
                .map(|tx| TransactionRow {
                    id: tx.id[..8].to_string(), // Short ID
                    delta: format!("{:+}", tx.delta),
                    reason: tx.reason.to_string(),
                    sku: tx.reference_sku.unwrap_or_else(|| "-".to_string()),
                    created_at: tx.created_at.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();
            print_output(&rows, ctx.format)?;
        }

        AccountAction::Usage { account, period } => {
            let period = period.unwrap_or_else(current_period);
            let counters = quota.usage_for_period(&account, &period).await?;
            let rows: Vec<UsageRow> = counters
                .into_iter()
                .map(|c| UsageRow {
                    feature: c.feature.to_string(),
                    used: c.used_units,
                    period: c.period,
                })
                .collect();
            print_output(&rows, ctx.format)?;
        }

        AccountAction::Grant { account, credits, admin, reference } => {
            let reason = if admin {
                TransactionReason::AdminAdjust
            } else {
                TransactionReason::PromoGrant
            };
            let outcome = ledger
                .grant(&account, credits, reason, None, reference.as_deref(), None)
                .await?;
            match outcome {
                GrantOutcome::Applied { new_balance, .. } => {
                    print_success(
                        &format!("Granted {} credits; balance is now {}", credits, new_balance),
                        ctx.quiet,
                    );
                }
                GrantOutcome::Duplicate { transaction_id } => {
                    print_warning(
                        &format!("Reference already applied (transaction {})", transaction_id),
                        ctx.quiet,
                    );
                }
            }
        }

        AccountAction::SetPlan { account, plan } => {
            quota.set_plan(&account, &plan).await?;
            print_success(&format!("Account {} is now on plan {}", account, plan), ctx.quiet);
        }

        AccountAction::Verify { account } => {
            let fold = ledger.verify_account(&account).await?;
            print_success(
                &format!("Ledger verified: log folds to {} credits", fold),
                ctx.quiet,
            );
        }

        AccountAction::Rebuild { account } => {
            let balance = ledger.rebuild_balance(&account).await?;
            print_success(
                &format!(
                    "Rebuilt balance for {}: available={}, reserved={}",
                    account, balance.credits_available, balance.credits_reserved
                ),
                ctx.quiet,
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_row_serialization() {
        let row = BalanceRow {
            account: "acct-1".to_string(),
            available: 100,
            reserved: 20,
            lifetime_spent: 30,
            frozen: "no".to_string(),
        };

        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("acct-1"));
        assert!(json.contains("100"));
    }

    #[test]
    fn test_transaction_row_delta_sign() {
        assert_eq!(format!("{:+}", 10i64), "+10");
        assert_eq!(format!("{:+}", -10i64), "-10");
    }
}

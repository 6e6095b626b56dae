//! Charge commands
//!
//! Quota checks, atomic usage charges, refunds, and the two-phase
//! reserve/settle/release flow with stale-hold reconciliation.

use anyhow::{anyhow, Result};
use chrono::Duration;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;
use uuid::Uuid;

use kindred_billing::{
    ChargeCoordinator, ChargeResult, Feature, QuotaDecision, QuotaEngine, ReservationOutcome,
};

use crate::commands::Context;
use crate::output::{print_single, print_success, print_warning};

#[derive(Subcommand)]
pub enum ChargeAction {
    /// Check whether a metered action is within the account's plan quota
    Check {
        /// Account ID
        account: String,

        /// Feature (chat_message, speech_synthesis, voice_demo)
        feature: String,

        /// Units requested
        #[arg(short, long, default_value = "1")]
        units: i64,
    },

    /// Atomically charge credits for consumed units
    Charge {
        /// Account ID
        account: String,

        /// Feature (chat_message, speech_synthesis, voice_demo)
        feature: String,

        /// Units consumed
        #[arg(long, default_value = "1")]
        quantity: i64,

        /// Idempotency reference; generated when omitted
        #[arg(short, long)]
        reference: Option<String>,
    },

    /// Refund credits against an earlier charge
    Refund {
        /// Account ID
        account: String,

        /// Credits to refund
        credits: i64,

        /// Reference of the original charge
        #[arg(long)]
        original: Option<String>,

        /// Idempotency reference for the refund itself
        #[arg(short, long)]
        reference: Option<String>,
    },

    /// Hold credits for an in-flight provider call
    Reserve {
        /// Account ID
        account: String,

        /// Feature (chat_message, speech_synthesis, voice_demo)
        feature: String,

        /// Units to hold
        #[arg(long, default_value = "1")]
        quantity: i64,

        /// Idempotency reference; generated when omitted
        #[arg(short, long)]
        reference: Option<String>,
    },

    /// Convert a held reservation into a committed charge
    Settle {
        /// Reservation reference
        reference: String,
    },

    /// Return a held reservation to available credit
    Release {
        /// Reservation reference
        reference: String,
    },

    /// Release all holds older than the given age
    Reconcile {
        /// Maximum hold age in minutes
        #[arg(long, default_value = "60")]
        max_age: i64,
    },

    /// Show a reservation by reference
    Pending {
        /// Reservation reference
        reference: String,
    },
}

/// Pending charge row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct PendingRow {
    #[tabled(rename = "Reference")]
    pub reference: String,
    #[tabled(rename = "Account")]
    pub account: String,
    #[tabled(rename = "Feature")]
    pub feature: String,
    #[tabled(rename = "Amount")]
    pub amount: i64,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Created")]
    pub created_at: String,
}

fn parse_feature(s: &str) -> Result<Feature> {
    s.parse::<Feature>().map_err(|e: String| anyhow!(e))
}

fn or_generated(reference: Option<String>) -> String {
    reference.unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub async fn execute(ctx: &Context, action: ChargeAction) -> Result<()> {
    let charges = ChargeCoordinator::new(ctx.db.pool.clone());

    match action {
        ChargeAction::Check { account, feature, units } => {
            let feature = parse_feature(&feature)?;
            let quota = QuotaEngine::new(ctx.db.pool.clone());
            match quota.check_quota(&account, feature, units).await? {
                QuotaDecision::Allowed => {
                    print_success("Allowed", ctx.quiet);
                }
                QuotaDecision::Denied { feature, used, requested, limit } => {
                    print_warning(
                        &format!(
                            "Denied: {} of {} {}s used this period, {} more requested",
                            used,
                            limit,
                            feature.unit(),
                            requested
                        ),
                        ctx.quiet,
                    );
                }
            }
        }

        ChargeAction::Charge { account, feature, quantity, reference } => {
            let feature = parse_feature(&feature)?;
            let reference = or_generated(reference);
            match charges.charge(&account, feature, quantity, &reference).await? {
                ChargeResult::Success { new_balance, .. } => {
                    print_success(
                        &format!("Charged (ref {}); balance is now {}", reference, new_balance),
                        ctx.quiet,
                    );
                }
                ChargeResult::InsufficientCredits { required, available } => {
                    print_warning(
                        &format!(
                            "Insufficient credits: {} required, {} available",
                            required, available
                        ),
                        ctx.quiet,
                    );
                }
                ChargeResult::AlreadyCharged { transaction_id } => {
                    print_warning(
                        &format!("Reference already charged (transaction {})", transaction_id),
                        ctx.quiet,
                    );
                }
            }
        }

        ChargeAction::Refund { account, credits, original, reference } => {
            let reference = or_generated(reference);
            charges
                .refund(&account, credits, original.as_deref(), Some(&reference))
                .await?;
            print_success(&format!("Refunded {} credits to {}", credits, account), ctx.quiet);
        }

        ChargeAction::Reserve { account, feature, quantity, reference } => {
            let feature = parse_feature(&feature)?;
            let reference = or_generated(reference);
            match charges.reserve(&account, feature, quantity, &reference).await? {
                ReservationOutcome::Held { amount } => {
                    print_success(
                        &format!("Held {} credits (ref {})", amount, reference),
                        ctx.quiet,
                    );
                }
                ReservationOutcome::InsufficientCredits { required, available } => {
                    print_warning(
                        &format!(
                            "Insufficient credits: {} required, {} available",
                            required, available
                        ),
                        ctx.quiet,
                    );
                }
                ReservationOutcome::Duplicate => {
                    print_warning(
                        &format!("Reference {} already has a reservation", reference),
                        ctx.quiet,
                    );
                }
            }
        }

        ChargeAction::Settle { reference } => {
            match charges.settle(&reference).await? {
                ChargeResult::Success { new_balance, .. } => {
                    print_success(&format!("Settled; balance is now {}", new_balance), ctx.quiet);
                }
                ChargeResult::AlreadyCharged { transaction_id } => {
                    print_warning(
                        &format!("Already settled (transaction {})", transaction_id),
                        ctx.quiet,
                    );
                }
                other => {
                    print_warning(&format!("Unexpected outcome: {:?}", other), ctx.quiet);
                }
            }
        }

        ChargeAction::Release { reference } => {
            if charges.release(&reference).await? {
                print_success("Reservation released", ctx.quiet);
            } else {
                print_warning("Reservation was already resolved", ctx.quiet);
            }
        }

        ChargeAction::Reconcile { max_age } => {
            let released = charges.reconcile_stale(Duration::minutes(max_age)).await?;
            print_success(&format!("Released {} stale reservations", released), ctx.quiet);
        }

        ChargeAction::Pending { reference } => {
            let pending = charges
                .get_pending(&reference)
                .await?
                .ok_or_else(|| anyhow!("No reservation for ref {}", reference))?;
            let row = PendingRow {
                reference: pending.idempotency_ref,
                account: pending.account_id,
                feature: pending.feature,
                amount: pending.amount,
                state: pending.state,
                created_at: pending.created_at.format("%Y-%m-%d %H:%M").to_string(),
            };
            print_single(&row, ctx.format)?;
        }
    }

    Ok(())
}

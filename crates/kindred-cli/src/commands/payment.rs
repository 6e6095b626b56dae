//! Payment commands
//!
//! Applies verified payment provider events to accounts. In production these
//! arrive as webhooks; the CLI entry point covers manual replay and local
//! testing.

use anyhow::Result;
use clap::Subcommand;

use kindred_billing::{PaymentEvent, PaymentEventKind, PaymentOutcome, PaymentProcessor};

use crate::commands::Context;
use crate::output::{print_success, print_warning};

#[derive(Subcommand)]
pub enum PaymentAction {
    /// Apply a credit pack purchase event
    Pack {
        /// Provider event ID (idempotency key)
        event_id: String,

        /// Account ID
        account: String,

        /// Credit pack SKU (pack_small, pack_medium, pack_large)
        sku: String,
    },

    /// Apply a subscription renewal event
    Renewal {
        /// Provider event ID (idempotency key)
        event_id: String,

        /// Account ID
        account: String,

        /// Plan code (free, keepsake, family)
        plan: String,
    },
}

pub async fn execute(ctx: &Context, action: PaymentAction) -> Result<()> {
    let payments = PaymentProcessor::new(ctx.db.pool.clone());

    let event = match action {
        PaymentAction::Pack { event_id, account, sku } => PaymentEvent {
            event_id,
            account_id: account,
            kind: PaymentEventKind::PackPurchase { sku },
        },
        PaymentAction::Renewal { event_id, account, plan } => PaymentEvent {
            event_id,
            account_id: account,
            kind: PaymentEventKind::SubscriptionRenewal { plan_code: plan },
        },
    };

    match payments.apply_payment_event(&event).await? {
        PaymentOutcome::Applied { credits_granted, new_balance, .. } => {
            print_success(
                &format!("Granted {} credits; balance is now {}", credits_granted, new_balance),
                ctx.quiet,
            );
        }
        PaymentOutcome::Duplicate => {
            print_warning("Event already applied; nothing changed", ctx.quiet);
        }
    }

    Ok(())
}

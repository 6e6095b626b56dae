//! Capacity commands
//!
//! Personalization slot pool operations: status, sizing, claims, releases,
//! and the waitlist sweep.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use kindred_billing::{CapacityAllocator, ClaimResult, WaitlistProcessor};

use crate::commands::Context;
use crate::output::{print_output, print_single, print_success, print_warning};

#[derive(Subcommand)]
pub enum CapacityAction {
    /// Show the slot pool counters
    Status,

    /// Resize the slot pool (admin operation)
    Configure {
        /// Maximum slots
        #[arg(long)]
        max: i64,

        /// Slots held back from allocation
        #[arg(long, default_value = "0")]
        buffer: i64,
    },

    /// Claim a personalization slot for an account
    Claim {
        /// Account ID
        account: String,

        /// Interest tag recorded if the claim is queued
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Release the account's active slot back to the pool
    Release {
        /// Account ID
        account: String,
    },

    /// Show an account's waitlist status
    Position {
        /// Account ID
        account: String,
    },

    /// List waitlist entries, oldest first
    Waitlist {
        /// Maximum number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Run a waitlist sweep, promoting queued entries into freed slots
    Process {
        /// Maximum entries to promote this sweep
        #[arg(short, long, default_value = "10")]
        count: usize,
    },
}

/// Pool status row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct PoolRow {
    #[tabled(rename = "Max")]
    pub max_slots: i64,
    #[tabled(rename = "Buffer")]
    pub buffer_slots: i64,
    #[tabled(rename = "Active")]
    pub active_slots: i64,
    #[tabled(rename = "Available")]
    pub available: i64,
}

/// Waitlist entry row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct WaitlistRow {
    #[tabled(rename = "Entry")]
    pub entry: String,
    #[tabled(rename = "Account")]
    pub account: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Requested")]
    pub requested_at: String,
}

pub async fn execute(ctx: &Context, action: CapacityAction) -> Result<()> {
    let capacity = CapacityAllocator::new(ctx.db.pool.clone());

    match action {
        CapacityAction::Status => {
            let pool = capacity.pool_status().await?;
            let row = PoolRow {
                max_slots: pool.max_slots,
                buffer_slots: pool.buffer_slots,
                active_slots: pool.active_slots,
                available: pool.slots_available(),
            };
            print_single(&row, ctx.format)?;
        }

        CapacityAction::Configure { max, buffer } => {
            let pool = capacity.configure_pool(max, buffer).await?;
            print_success(
                &format!(
                    "Pool configured: {} max, {} buffered, {} available",
                    pool.max_slots,
                    pool.buffer_slots,
                    pool.slots_available()
                ),
                ctx.quiet,
            );
        }

        CapacityAction::Claim { account, tag } => {
            match capacity.claim_slot(&account, tag.as_deref()).await? {
                ClaimResult::Granted { slot_ref } => {
                    print_success(&format!("Slot granted ({})", slot_ref), ctx.quiet);
                }
                ClaimResult::AlreadyHeld { slot_ref } => {
                    print_success(&format!("Account already holds slot {}", slot_ref), ctx.quiet);
                }
                ClaimResult::Queued { position, .. } => {
                    print_warning(
                        &format!("Pool is full; queued at position {}", position),
                        ctx.quiet,
                    );
                }
            }
        }

        CapacityAction::Release { account } => {
            if capacity.release_slot(&account).await? {
                print_success("Slot released", ctx.quiet);
            } else {
                print_warning("Account holds no active slot", ctx.quiet);
            }
        }

        CapacityAction::Position { account } => {
            let processor = WaitlistProcessor::new(ctx.db.pool.clone());
            match processor.status(&account).await? {
                Some(status) => {
                    let position = status
                        .position
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    print_single(
                        &WaitlistRow {
                            entry: status.entry_id[..8].to_string(),
                            account,
                            status: format!("{} (position {})", status.status, position),
                            requested_at: status.requested_at.format("%Y-%m-%d %H:%M").to_string(),
                        },
                        ctx.format,
                    )?;
                }
                None => {
                    print_warning("Account has no waitlist entry", ctx.quiet);
                }
            }
        }

        CapacityAction::Waitlist { limit } => {
            let processor = WaitlistProcessor::new(ctx.db.pool.clone());
            let entries = processor.list_entries(limit).await?;
            let rows: Vec<WaitlistRow> = entries
                .into_iter()
                .map(|e| WaitlistRow {
                    entry: e.id[..8].to_string(), // Short ID
                    account: e.account_id,
                    status: e.status.to_string(),
                    requested_at: e.requested_at.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();
            print_output(&rows, ctx.format)?;
        }

        CapacityAction::Process { count } => {
            let processor = WaitlistProcessor::new(ctx.db.pool.clone());
            let result = processor.process_next(count).await?;
            print_success(
                &format!(
                    "Sweep done: {} promoted, {} notified, {} pending retry",
                    result.promoted, result.notified, result.notify_failures
                ),
                ctx.quiet,
            );
        }
    }

    Ok(())
}

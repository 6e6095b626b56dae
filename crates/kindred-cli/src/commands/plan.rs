//! Plan catalog commands
//!
//! Read-only views of the in-code plan and credit pack catalog.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use kindred_billing::{all_packs, all_plans, UNLIMITED};

use crate::commands::Context;
use crate::output::print_output;

#[derive(Subcommand)]
pub enum PlanAction {
    /// List subscription plans
    List,

    /// List purchasable credit packs
    Packs,
}

/// Plan row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct PlanRow {
    #[tabled(rename = "Code")]
    pub code: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Price")]
    pub price: String,
    #[tabled(rename = "Monthly Credits")]
    pub monthly_credits: i64,
    #[tabled(rename = "Chat")]
    pub chat: String,
    #[tabled(rename = "Speech (s)")]
    pub speech: String,
    #[tabled(rename = "Demo (s)")]
    pub demo: String,
}

/// Credit pack row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct PackRow {
    #[tabled(rename = "SKU")]
    pub sku: String,
    #[tabled(rename = "Credits")]
    pub credits: i64,
    #[tabled(rename = "Price")]
    pub price: String,
}

fn format_limit(limit: i64) -> String {
    if limit == UNLIMITED {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}

fn format_cents(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

pub async fn execute(ctx: &Context, action: PlanAction) -> Result<()> {
    match action {
        PlanAction::List => {
            let rows: Vec<PlanRow> = all_plans()
                .iter()
                .map(|p| PlanRow {
                    code: p.code.to_string(),
                    name: p.name.to_string(),
                    price: format_cents(p.price_cents),
                    monthly_credits: p.monthly_credit_grant,
                    chat: format_limit(p.chat_message_limit),
                    speech: format_limit(p.speech_seconds_limit),
                    demo: format_limit(p.demo_seconds_limit),
                })
                .collect();
            print_output(&rows, ctx.format)?;
        }

        PlanAction::Packs => {
            let rows: Vec<PackRow> = all_packs()
                .iter()
                .map(|p| PackRow {
                    sku: p.sku.to_string(),
                    credits: p.credits,
                    price: format_cents(p.price_cents),
                })
                .collect();
            print_output(&rows, ctx.format)?;
        }
    }

    Ok(())
}

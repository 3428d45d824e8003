//! Billing data model: plans, subscriptions, usage summaries, invoices.
//!
//! All money is integer cents. The invoice calculator in [`invoice`] is
//! pure; persistence and Stripe interaction live behind capability traits.

use serde::{Deserialize, Serialize};

pub mod invoice;

/// Subscription plan tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Essentials,
    Business,
    Enterprise,
    MissionCritical,
}

impl Plan {
    /// Fixed monthly fee in cents. Enterprise tiers are invoiced under
    /// custom contracts, so no platform fee is computed here.
    pub fn monthly_fee_cents(&self) -> i64 {
        match self {
            Plan::Free => 0,
            Plan::Essentials => 10_000,
            Plan::Business => 50_000,
            Plan::Enterprise | Plan::MissionCritical => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Essentials => "essentials",
            Plan::Business => "business",
            Plan::Enterprise => "enterprise",
            Plan::MissionCritical => "mission_critical",
        }
    }
}

/// An organization's billing subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub organization_id: String,
    pub plan: Plan,
    /// Actions included in the monthly fee.
    pub actions_included: i64,
    /// Included active storage, in GB.
    pub active_storage_gb: i64,
    /// Included retained storage, in GB.
    pub retained_storage_gb: i64,
}

/// Metered usage for one organization over one billing period.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_actions: i64,
    /// Active storage in GB-hours.
    pub active_storage_gbh: f64,
    /// Retained storage in GB-hours.
    pub retained_storage_gbh: f64,
}

/// One invoice line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    pub unit_price_cents: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Paid,
    Overdue,
}

/// Invariant: `total = subtotal - credits + tax`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub organization_id: String,
    pub period_start_ms: u64,
    pub period_end_ms: u64,
    pub line_items: Vec<LineItem>,
    pub subtotal_cents: i64,
    pub credits_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub status: InvoiceStatus,
    /// Payment deadline: period end plus 30 days.
    pub due_at_ms: u64,
}

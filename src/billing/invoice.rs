//! Pure invoice calculator.
//!
//! Line items are computed from a subscription and a usage summary with
//! integer-cent truncation; no I/O happens here, which is what makes the
//! generate-invoice step safely retryable.

use super::{Invoice, InvoiceStatus, LineItem, Subscription, UsageSummary};

/// Hours in a 31-day month; storage allowances are quoted in GB and
/// converted to GB-hours against this.
pub const HOURS_PER_MONTH: i64 = 744;

/// Cents per 100 GB-hours of active storage overage.
pub const ACTIVE_STORAGE_RATE_CENTS: i64 = 4_200;

/// Cents per 100 GB-hours of retained storage overage.
pub const RETAINED_STORAGE_RATE_CENTS: i64 = 105;

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

/// Cents per million actions of overage, tiered by the overage volume.
pub fn action_overage_price_per_million(overage_actions: i64) -> i64 {
    match overage_actions / 1_000_000 {
        m if m < 5 => 5_000,
        m if m < 10 => 4_500,
        m if m < 20 => 4_000,
        m if m < 50 => 3_500,
        m if m < 100 => 3_000,
        _ => 2_500,
    }
}

/// Compute the period's line items: plan fee, action overage, and storage
/// overages. Zero-amount overage lines are omitted.
pub fn compute_line_items(subscription: &Subscription, usage: &UsageSummary) -> Vec<LineItem> {
    let mut items = Vec::new();

    let fee = subscription.plan.monthly_fee_cents();
    if fee > 0 {
        items.push(LineItem {
            description: format!("{} plan", subscription.plan.as_str()),
            quantity: 1.0,
            unit: "month".to_string(),
            unit_price_cents: fee,
            amount_cents: fee,
        });
    }

    let action_overage = usage.total_actions - subscription.actions_included;
    if action_overage > 0 {
        let price = action_overage_price_per_million(action_overage);
        // Integer truncation: partial-million overage is charged pro rata,
        // rounded down to the cent.
        let amount = action_overage * price / 1_000_000;
        items.push(LineItem {
            description: "actions overage".to_string(),
            quantity: action_overage as f64 / 1_000_000.0,
            unit: "million actions".to_string(),
            unit_price_cents: price,
            amount_cents: amount,
        });
    }

    let active_allowance_gbh = (subscription.active_storage_gb * HOURS_PER_MONTH) as f64;
    let active_overage = usage.active_storage_gbh - active_allowance_gbh;
    if active_overage > 0.0 {
        let amount = (active_overage * ACTIVE_STORAGE_RATE_CENTS as f64 / 100.0) as i64;
        if amount > 0 {
            items.push(LineItem {
                description: "active storage overage".to_string(),
                quantity: active_overage,
                unit: "GB-hours".to_string(),
                unit_price_cents: ACTIVE_STORAGE_RATE_CENTS,
                amount_cents: amount,
            });
        }
    }

    let retained_allowance_gbh = (subscription.retained_storage_gb * HOURS_PER_MONTH) as f64;
    let retained_overage = usage.retained_storage_gbh - retained_allowance_gbh;
    if retained_overage > 0.0 {
        let amount = (retained_overage * RETAINED_STORAGE_RATE_CENTS as f64 / 100.0) as i64;
        if amount > 0 {
            items.push(LineItem {
                description: "retained storage overage".to_string(),
                quantity: retained_overage,
                unit: "GB-hours".to_string(),
                unit_price_cents: RETAINED_STORAGE_RATE_CENTS,
                amount_cents: amount,
            });
        }
    }

    items
}

/// Build a draft invoice for the period. Credits and tax start at zero;
/// the payment processor applies both at finalization.
pub fn build_invoice(
    subscription: &Subscription,
    usage: &UsageSummary,
    period_start_ms: u64,
    period_end_ms: u64,
) -> Invoice {
    let line_items = compute_line_items(subscription, usage);
    let subtotal_cents: i64 = line_items.iter().map(|li| li.amount_cents).sum();
    let credits_cents = 0;
    let tax_cents = 0;
    Invoice {
        organization_id: subscription.organization_id.clone(),
        period_start_ms,
        period_end_ms,
        line_items,
        subtotal_cents,
        credits_cents,
        tax_cents,
        total_cents: subtotal_cents - credits_cents + tax_cents,
        status: InvoiceStatus::Draft,
        due_at_ms: period_end_ms + 30 * DAY_MS,
    }
}

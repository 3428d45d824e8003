//! Billing workflows: monthly cycle, dunning, usage aggregation.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    bulk_retry, short_retry, standard_retry, ActivityStep, EngineTimings, ExitCondition, FailureMode, StepDef,
    WorkflowDefinition,
};
use crate::WorkflowType;

/// Input for BillingCycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingCycleInput {
    pub organization_id: String,
    pub period_start_ms: u64,
    pub period_end_ms: u64,
}

/// Input for Dunning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningInput {
    pub organization_id: String,
    pub invoice_id: String,
}

/// Input for UsageAggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAggregationInput {
    /// "daily" or "monthly".
    pub period_type: String,
    pub period_date_ms: u64,
}

/// aggregate-usage -> generate-invoice -> report-stripe-usage (soft) ->
/// sleep(finalize) -> send-invoice-email (soft).
pub fn billing_cycle_definition(t: &EngineTimings) -> WorkflowDefinition {
    let policy = standard_retry(t);
    let timeout = t.activity_timeout_ms * 2;
    WorkflowDefinition {
        workflow_type: WorkflowType::BillingCycle,
        steps: vec![
            StepDef::Activity(ActivityStep::new("aggregate-usage", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new(
                "generate-invoice",
                FailureMode::HardStop,
                policy.clone(),
                timeout,
            )),
            // Stripe reporting is reconciled out of band; do not block the cycle.
            StepDef::Activity(ActivityStep::new(
                "report-stripe-usage",
                FailureMode::SoftContinue,
                policy.clone(),
                timeout,
            )),
            StepDef::Sleep {
                name: "finalize-wait",
                delay_ms: t.invoice_finalize_delay_ms,
            },
            StepDef::Activity(ActivityStep::new(
                "send-invoice-email",
                FailureMode::SoftContinue,
                policy,
                timeout,
            )),
        ],
    }
}

/// Three checkpoints (day 3/7/14): sleep -> send-reminder (soft) ->
/// check-paid (soft, early exit when true), then suspend-account.
///
/// The checkpoints are sequential timer+activity pairs; the engine never
/// arms more than one timer per execution. Each check-paid step carries a
/// typed exit condition, so payment at any checkpoint completes the
/// execution without running the remaining rounds or the suspension.
pub fn dunning_definition(t: &EngineTimings) -> WorkflowDefinition {
    let policy = short_retry(t);
    let timeout = t.activity_timeout_ms;
    let mut steps = Vec::new();
    let sleep_names: [&'static str; 3] = ["wait-checkpoint-1", "wait-checkpoint-2", "wait-checkpoint-3"];
    let reminder_names: [&'static str; 3] = ["send-reminder-1", "send-reminder-2", "send-reminder-3"];
    let check_names: [&'static str; 3] = ["check-paid-1", "check-paid-2", "check-paid-3"];
    for round in 0..3 {
        steps.push(StepDef::Sleep {
            name: sleep_names[round],
            delay_ms: t.dunning_schedule_ms[round],
        });
        steps.push(StepDef::Activity(
            ActivityStep::new(reminder_names[round], FailureMode::SoftContinue, policy.clone(), timeout)
                .with_activity("send-reminder")
                .with_params(json!({ "round": round + 1 })),
        ));
        steps.push(StepDef::Activity(
            ActivityStep::new(check_names[round], FailureMode::SoftContinue, policy.clone(), timeout)
                .with_activity("check-paid")
                .with_exit(ExitCondition::WhenTrue),
        ));
    }
    steps.push(StepDef::Activity(ActivityStep::new(
        "suspend-account",
        FailureMode::HardStop,
        policy,
        timeout,
    )));
    WorkflowDefinition {
        workflow_type: WorkflowType::Dunning,
        steps,
    }
}

/// list-active-orgs -> fan-out aggregate-org-usage per org.
pub fn usage_aggregation_definition(t: &EngineTimings) -> WorkflowDefinition {
    let policy = bulk_retry(t);
    let timeout = t.activity_timeout_ms * 6;
    WorkflowDefinition {
        workflow_type: WorkflowType::UsageAggregation,
        steps: vec![
            StepDef::Activity(ActivityStep::new(
                "list-active-orgs",
                FailureMode::HardStop,
                policy.clone(),
                timeout,
            )),
            StepDef::FanOut {
                name: "aggregate-org-usage",
                source_step: "list-active-orgs",
                item_activity: "aggregate-org-usage",
                policy,
                timeout_ms: timeout,
            },
        ],
    }
}

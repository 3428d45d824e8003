mod common;

use cloudplane::billing::InvoiceStatus;
use cloudplane::{ExecutionStatus, StepOutcome, WorkflowType};
use common::*;

#[tokio::test]
async fn billing_cycle_generates_invoice_and_emails_it() {
    let caps = MockCapabilities::new();
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::BillingCycle, billing_cycle_input(), "bill-org-1-2023-12")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("aggregate_usage"), 1);
    assert_eq!(caps.count("create_invoice"), 1);
    assert_eq!(caps.count("report_usage"), 1);
    assert_eq!(caps.count("send_invoice"), 1);

    // business plan fee plus 0.1M actions over the included 2.5M
    let invoices = caps.invoices();
    assert_eq!(invoices.len(), 1);
    let inv = &invoices[0];
    assert_eq!(inv.status, InvoiceStatus::Draft);
    assert_eq!(inv.subtotal_cents, 50_500);
    assert_eq!(inv.total_cents, 50_500);
    assert_eq!(inv.due_at_ms, 1_702_592_000_000u64 + 30 * 24 * 60 * 60 * 1_000);

    // the finalize wait ran as a durable sleep before the email step
    let names: Vec<&str> = execution.history.iter().map(|r| r.step_name.as_str()).collect();
    let wait_pos = names.iter().position(|n| *n == "finalize-wait").unwrap();
    let email_pos = names.iter().position(|n| *n == "send-invoice-email").unwrap();
    assert!(wait_pos < email_pos);
}

#[tokio::test]
async fn stripe_reporting_failure_does_not_block_the_cycle() {
    let caps = MockCapabilities::new();
    caps.fail_permanently("report_usage");
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::BillingCycle, billing_cycle_input(), "bill-org-1-soft")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    // reconciled out of band; invoice and email still happen
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("create_invoice"), 1);
    assert_eq!(caps.count("send_invoice"), 1);
    let record = execution
        .history
        .iter()
        .find(|r| r.step_name == "report-stripe-usage")
        .unwrap();
    assert_eq!(record.outcome, StepOutcome::FatalFailure);
}

#[tokio::test]
async fn usage_aggregation_failure_blocks_invoicing() {
    let caps = MockCapabilities::new();
    caps.fail_transient_times("aggregate_usage", 10);
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::BillingCycle, billing_cycle_input(), "bill-org-1-agg")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(caps.count("aggregate_usage"), 5);
    assert_eq!(caps.count("create_invoice"), 0);
}

fn aggregation_input() -> serde_json::Value {
    serde_json::json!({
        "period_type": "daily",
        "period_date_ms": 1_701_000_000_000u64,
    })
}

#[tokio::test]
async fn usage_aggregation_fans_out_per_org() {
    let caps = MockCapabilities::new();
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::UsageAggregation, aggregation_input(), "agg-daily-1")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("list_active_orgs"), 1);
    // one call per org from the source step's list
    assert_eq!(caps.count("aggregate_org_usage"), 3);
    let record = execution
        .history
        .iter()
        .find(|r| r.step_name == "aggregate-org-usage")
        .unwrap();
    assert_eq!(record.output.as_ref().unwrap()["processed"], 3);
}

#[tokio::test]
async fn fan_out_item_failure_is_isolated_from_siblings() {
    let caps = MockCapabilities::new();
    caps.fail_permanently("aggregate_org_usage:org-2");
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::UsageAggregation, aggregation_input(), "agg-daily-2")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    // one org failing never aborts the batch
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("aggregate_org_usage"), 3);
    let record = execution
        .history
        .iter()
        .find(|r| r.step_name == "aggregate-org-usage")
        .unwrap();
    let output = record.output.as_ref().unwrap();
    assert_eq!(output["processed"], 2);
    assert_eq!(output["failed"], serde_json::json!(["org-2"]));
}

#[tokio::test]
async fn fan_out_items_carry_distinct_idempotency_keys() {
    let caps = MockCapabilities::new();
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::UsageAggregation, aggregation_input(), "agg-daily-3")
        .await
        .unwrap();
    wait_for_terminal(&engine, &id, 5_000).await;

    let keys = caps.keys_for("aggregate_org_usage");
    let distinct: std::collections::HashSet<_> = keys.iter().collect();
    assert_eq!(distinct.len(), 3);
    assert!(keys.iter().any(|k| k.ends_with(":org-2")));
}

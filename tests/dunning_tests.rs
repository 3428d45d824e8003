mod common;

use cloudplane::{ExecutionStatus, WorkflowType};
use common::*;

#[tokio::test]
async fn payment_at_second_checkpoint_exits_early() {
    let caps = MockCapabilities::new();
    caps.set_paid_after(2);
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::Dunning, dunning_input(), "dun-inv-1")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    // two checkpoints ran, then the paid check ended the loop
    assert_eq!(caps.count("send_payment_reminder"), 2);
    assert_eq!(caps.count("invoice_paid"), 2);
    assert_eq!(caps.count("suspend"), 0);
    let names: Vec<&str> = execution.history.iter().map(|r| r.step_name.as_str()).collect();
    assert!(names.contains(&"check-paid-2"));
    assert!(!names.contains(&"wait-checkpoint-3"));
}

#[tokio::test]
async fn payment_before_first_checkpoint_sends_one_reminder() {
    let caps = MockCapabilities::new();
    caps.set_paid_after(1);
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::Dunning, dunning_input(), "dun-inv-2")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("send_payment_reminder"), 1);
    assert_eq!(caps.count("invoice_paid"), 1);
    assert_eq!(caps.count("suspend"), 0);
}

#[tokio::test]
async fn unpaid_after_all_checkpoints_suspends_the_account() {
    let caps = MockCapabilities::new();
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::Dunning, dunning_input(), "dun-inv-3")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("send_payment_reminder"), 3);
    assert_eq!(caps.count("invoice_paid"), 3);
    assert_eq!(caps.count("suspend"), 1);
}

#[tokio::test]
async fn reminder_failures_never_block_the_schedule() {
    let caps = MockCapabilities::new();
    caps.fail_permanently("send_payment_reminder");
    caps.set_paid_after(3);
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::Dunning, dunning_input(), "dun-inv-4")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    // email trouble must not stall dunning; checks keep running on schedule
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("invoice_paid"), 3);
    assert_eq!(caps.count("suspend"), 0);
}

#[tokio::test]
async fn paid_check_failure_falls_through_to_the_next_round() {
    let caps = MockCapabilities::new();
    // every check errors; the workflow must still reach suspension rather
    // than hang or fail
    caps.fail_permanently("invoice_paid");
    let (engine, _store) = start_engine(&caps).await;

    let id = engine
        .submit(WorkflowType::Dunning, dunning_input(), "dun-inv-5")
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, &id, 5_000).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(caps.count("suspend"), 1);
}

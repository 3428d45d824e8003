//! Namespace lifecycle workflows: provision, update, delete, failover.

use serde::{Deserialize, Serialize};

use super::{
    failover_retry, short_retry, standard_retry, ActivityStep, EngineTimings, FailureMode, StepDef, StepGuard,
    WorkflowDefinition,
};
use crate::WorkflowType;

/// Input for NamespaceProvision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionInput {
    pub namespace_id: String,
    pub organization_id: String,
    pub name: String,
    pub region: String,
    pub retention_days: u32,
    pub ha_enabled: bool,
    #[serde(default)]
    pub standby_region: Option<String>,
}

/// Input for NamespaceUpdate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInput {
    pub namespace_id: String,
    pub organization_id: String,
    pub retention_days: u32,
    pub region: String,
}

/// Input for NamespaceDelete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInput {
    pub namespace_id: String,
    pub organization_id: String,
}

/// Input for NamespaceFailover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverInput {
    pub namespace_id: String,
    pub target_region: String,
}

/// select-cluster -> gen-certs -> register-namespace -> create-dns ->
/// set-state-active -> [if HA] setup-standby (soft).
pub fn provision_definition(t: &EngineTimings) -> WorkflowDefinition {
    let policy = standard_retry(t);
    let timeout = t.activity_timeout_ms;
    WorkflowDefinition {
        workflow_type: WorkflowType::NamespaceProvision,
        steps: vec![
            StepDef::Activity(ActivityStep::new("select-cluster", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new("gen-certs", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new(
                "register-namespace",
                FailureMode::HardStop,
                policy.clone(),
                timeout,
            )),
            StepDef::Activity(ActivityStep::new("create-dns", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new(
                "set-state-active",
                FailureMode::HardStop,
                policy.clone(),
                timeout,
            )),
            // Standby setup failures only degrade HA; the namespace is already serving.
            StepDef::Activity(
                ActivityStep::new("setup-standby", FailureMode::SoftContinue, policy, timeout)
                    .with_guard(StepGuard::InputFlag("ha_enabled")),
            ),
        ],
    }
}

/// update-config -> update-dns (soft) -> set-state-active.
pub fn update_definition(t: &EngineTimings) -> WorkflowDefinition {
    let policy = standard_retry(t);
    let timeout = t.activity_timeout_ms;
    WorkflowDefinition {
        workflow_type: WorkflowType::NamespaceUpdate,
        steps: vec![
            StepDef::Activity(ActivityStep::new("update-config", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new("update-dns", FailureMode::SoftContinue, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new("set-state-active", FailureMode::HardStop, policy, timeout)),
        ],
    }
}

/// deprecate -> sleep(drain) -> remove-dns (soft) -> archive (soft) ->
/// set-state-deleted.
pub fn delete_definition(t: &EngineTimings) -> WorkflowDefinition {
    let policy = short_retry(t);
    let timeout = t.activity_timeout_ms * 2;
    WorkflowDefinition {
        workflow_type: WorkflowType::NamespaceDelete,
        steps: vec![
            StepDef::Activity(ActivityStep::new("deprecate", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Sleep {
                name: "drain",
                delay_ms: t.drain_delay_ms,
            },
            StepDef::Activity(ActivityStep::new("remove-dns", FailureMode::SoftContinue, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new("archive", FailureMode::SoftContinue, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new(
                "set-state-deleted",
                FailureMode::HardStop,
                policy,
                timeout,
            )),
        ],
    }
}

/// verify-standby -> fence-primary -> promote-standby -> update-dns-failover
/// -> verify-traffic (soft).
pub fn failover_definition(t: &EngineTimings) -> WorkflowDefinition {
    let policy = failover_retry(t);
    let timeout = t.activity_timeout_ms;
    WorkflowDefinition {
        workflow_type: WorkflowType::NamespaceFailover,
        steps: vec![
            StepDef::Activity(ActivityStep::new("verify-standby", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new("fence-primary", FailureMode::HardStop, policy.clone(), timeout)),
            StepDef::Activity(ActivityStep::new(
                "promote-standby",
                FailureMode::HardStop,
                policy.clone(),
                timeout,
            )),
            StepDef::Activity(ActivityStep::new(
                "update-dns-failover",
                FailureMode::HardStop,
                policy.clone(),
                timeout,
            )),
            StepDef::Activity(ActivityStep::new("verify-traffic", FailureMode::SoftContinue, policy, timeout)),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_table_shape() {
        let def = provision_definition(&EngineTimings::default());
        let names: Vec<&str> = def.steps.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "select-cluster",
                "gen-certs",
                "register-namespace",
                "create-dns",
                "set-state-active",
                "setup-standby"
            ]
        );
        // setup-standby is HA-gated and soft
        match &def.steps[5] {
            StepDef::Activity(s) => {
                assert_eq!(s.failure_mode, FailureMode::SoftContinue);
                assert_eq!(s.guard, Some(StepGuard::InputFlag("ha_enabled")));
            }
            other => panic!("unexpected step {other:?}"),
        }
        // everything before it hard-stops
        for step in &def.steps[..5] {
            match step {
                StepDef::Activity(s) => assert_eq!(s.failure_mode, FailureMode::HardStop),
                other => panic!("unexpected step {other:?}"),
            }
        }
    }

    #[test]
    fn delete_table_has_drain_sleep_and_soft_teardown() {
        let t = EngineTimings::default();
        let def = delete_definition(&t);
        match &def.steps[1] {
            StepDef::Sleep { name, delay_ms } => {
                assert_eq!(*name, "drain");
                assert_eq!(*delay_ms, t.drain_delay_ms);
            }
            other => panic!("unexpected step {other:?}"),
        }
        for (idx, mode) in [(2usize, FailureMode::SoftContinue), (3, FailureMode::SoftContinue), (4, FailureMode::HardStop)] {
            match &def.steps[idx] {
                StepDef::Activity(s) => assert_eq!(s.failure_mode, mode, "step {}", s.name),
                other => panic!("unexpected step {other:?}"),
            }
        }
    }

    #[test]
    fn failover_retry_caps_lower_than_standard() {
        let t = EngineTimings::default();
        let def = failover_definition(&t);
        match &def.steps[0] {
            StepDef::Activity(s) => {
                assert_eq!(s.policy.maximum_attempts, 3);
                assert_eq!(s.policy.maximum_interval_ms, t.retry_initial_interval_ms * 30);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
}

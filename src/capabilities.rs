//! External collaborator traits and the activity handlers built on them.
//!
//! Every method takes an idempotency key; the engine passes the same key
//! for every attempt of a step, so implementations can deduplicate side
//! effects across retries and crash-replays. Implementations classify
//! their own failures as [`ActivityError::Transient`] or
//! [`ActivityError::Permanent`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::billing::{invoice, Subscription, UsageSummary};
use crate::runtime::activity::{ActivityError, ActivityRegistry};
use crate::workflows::billing::{BillingCycleInput, DunningInput, UsageAggregationInput};
use crate::workflows::namespace::{DeleteInput, FailoverInput, ProvisionInput, UpdateInput};
use crate::NamespaceState;

/// DNS endpoints published for a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub grpc: String,
    pub web: String,
    pub metrics: String,
}

/// Places namespaces on compute clusters.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Pick a cluster in `region` with capacity; returns the cluster id.
    async fn select_cluster(&self, idempotency_key: &str, region: &str) -> Result<String, ActivityError>;
}

/// Issues client/server certificate bundles.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Returns the id of the issued bundle.
    async fn issue(&self, idempotency_key: &str, namespace_id: &str) -> Result<String, ActivityError>;
}

/// Administers namespaces on a cluster.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    async fn register_namespace(
        &self,
        idempotency_key: &str,
        cluster_id: &str,
        namespace_id: &str,
        retention_days: u32,
    ) -> Result<(), ActivityError>;
    async fn update_config(
        &self,
        idempotency_key: &str,
        namespace_id: &str,
        retention_days: u32,
    ) -> Result<(), ActivityError>;
    async fn deprecate(&self, idempotency_key: &str, namespace_id: &str) -> Result<(), ActivityError>;
    async fn setup_standby(
        &self,
        idempotency_key: &str,
        namespace_id: &str,
        standby_region: &str,
    ) -> Result<(), ActivityError>;
    async fn verify_standby(&self, idempotency_key: &str, namespace_id: &str) -> Result<(), ActivityError>;
    async fn fence_primary(&self, idempotency_key: &str, namespace_id: &str) -> Result<(), ActivityError>;
    async fn promote_standby(
        &self,
        idempotency_key: &str,
        namespace_id: &str,
        target_region: &str,
    ) -> Result<(), ActivityError>;
    async fn verify_traffic(&self, idempotency_key: &str, namespace_id: &str) -> Result<(), ActivityError>;
}

/// Manages the namespace's public DNS records.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn create_records(
        &self,
        idempotency_key: &str,
        namespace_id: &str,
        region: &str,
    ) -> Result<Endpoints, ActivityError>;
    async fn update_records(
        &self,
        idempotency_key: &str,
        namespace_id: &str,
        region: &str,
    ) -> Result<Endpoints, ActivityError>;
    async fn remove_records(&self, idempotency_key: &str, namespace_id: &str) -> Result<(), ActivityError>;
}

/// Cold storage for deleted namespaces' data.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn archive_namespace(&self, idempotency_key: &str, namespace_id: &str) -> Result<(), ActivityError>;
}

/// User-facing namespace records; state transitions land here.
#[async_trait]
pub trait NamespaceRepository: Send + Sync {
    async fn update_state(
        &self,
        idempotency_key: &str,
        namespace_id: &str,
        state: NamespaceState,
        endpoints: Option<Endpoints>,
    ) -> Result<(), ActivityError>;
}

/// Metered-usage queries against the metrics pipeline.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn list_active_orgs(&self, idempotency_key: &str) -> Result<Vec<String>, ActivityError>;
    async fn aggregate_usage(
        &self,
        idempotency_key: &str,
        organization_id: &str,
        period_start_ms: u64,
        period_end_ms: u64,
    ) -> Result<UsageSummary, ActivityError>;
    async fn aggregate_org_usage(
        &self,
        idempotency_key: &str,
        organization_id: &str,
        period_type: &str,
        period_date_ms: u64,
    ) -> Result<(), ActivityError>;
}

/// Billing records: subscriptions and invoices.
#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn subscription(&self, organization_id: &str) -> Result<Subscription, ActivityError>;
    /// Persist a draft invoice; returns its id.
    async fn create_invoice(
        &self,
        idempotency_key: &str,
        invoice: &crate::billing::Invoice,
    ) -> Result<String, ActivityError>;
    async fn invoice_paid(&self, invoice_id: &str) -> Result<bool, ActivityError>;
}

/// Usage reporting to the payment processor.
#[async_trait]
pub trait StripeGateway: Send + Sync {
    async fn report_usage(
        &self,
        idempotency_key: &str,
        organization_id: &str,
        usage: &UsageSummary,
    ) -> Result<(), ActivityError>;
}

/// Outbound billing email.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_invoice(
        &self,
        idempotency_key: &str,
        organization_id: &str,
        invoice_id: &str,
    ) -> Result<(), ActivityError>;
    async fn send_payment_reminder(
        &self,
        idempotency_key: &str,
        organization_id: &str,
        invoice_id: &str,
        round: u32,
    ) -> Result<(), ActivityError>;
}

/// Account-level administrative actions.
#[async_trait]
pub trait AccountAdmin: Send + Sync {
    async fn suspend(&self, idempotency_key: &str, organization_id: &str) -> Result<(), ActivityError>;
}

/// The full set of collaborators the control plane's activities call.
#[derive(Clone)]
pub struct Capabilities {
    pub clusters: Arc<dyn ClusterProvider>,
    pub certs: Arc<dyn CertificateAuthority>,
    pub cluster_admin: Arc<dyn ClusterAdmin>,
    pub dns: Arc<dyn DnsProvider>,
    pub archive: Arc<dyn ArchiveStore>,
    pub namespaces: Arc<dyn NamespaceRepository>,
    pub usage: Arc<dyn UsageSource>,
    pub billing: Arc<dyn BillingRepository>,
    pub stripe: Arc<dyn StripeGateway>,
    pub email: Arc<dyn EmailSender>,
    pub accounts: Arc<dyn AccountAdmin>,
}

/// Deserialize the workflow's input out of a step's input envelope.
pub fn workflow_input<T: DeserializeOwned>(input: &Value) -> Result<T, ActivityError> {
    serde_json::from_value(input.get("workflow").cloned().unwrap_or(Value::Null))
        .map_err(|e| ActivityError::Permanent(format!("malformed workflow input: {e}")))
}

/// Deserialize a completed step's output out of the envelope.
pub fn step_output<T: DeserializeOwned>(input: &Value, step_name: &str) -> Result<T, ActivityError> {
    serde_json::from_value(
        input
            .get("steps")
            .and_then(|s| s.get(step_name))
            .cloned()
            .unwrap_or(Value::Null),
    )
    .map_err(|e| ActivityError::Permanent(format!("missing or malformed output of step {step_name}: {e}")))
}

fn param_u32(input: &Value, name: &str) -> Result<u32, ActivityError> {
    input
        .get("params")
        .and_then(|p| p.get(name))
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| ActivityError::Permanent(format!("missing step param {name}")))
}

fn fan_out_item(input: &Value) -> Result<String, ActivityError> {
    input
        .get("item")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| ActivityError::Permanent("missing fan-out item".into()))
}

/// Build the activity registry wiring every control-plane step to its
/// collaborator.
pub fn build_activity_registry(caps: Capabilities) -> ActivityRegistry {
    let c = caps;
    ActivityRegistry::builder()
        // namespace provisioning
        .register("select-cluster", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: ProvisionInput = workflow_input(&input)?;
                    let cluster = c.clusters.select_cluster(&ctx.idempotency_key, &wf.region).await?;
                    Ok(json!(cluster))
                }
            }
        })
        .register("gen-certs", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: ProvisionInput = workflow_input(&input)?;
                    let bundle = c.certs.issue(&ctx.idempotency_key, &wf.namespace_id).await?;
                    Ok(json!(bundle))
                }
            }
        })
        .register("register-namespace", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: ProvisionInput = workflow_input(&input)?;
                    let cluster: String = step_output(&input, "select-cluster")?;
                    c.cluster_admin
                        .register_namespace(&ctx.idempotency_key, &cluster, &wf.namespace_id, wf.retention_days)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("create-dns", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: ProvisionInput = workflow_input(&input)?;
                    let endpoints = c
                        .dns
                        .create_records(&ctx.idempotency_key, &wf.namespace_id, &wf.region)
                        .await?;
                    Ok(json!(endpoints))
                }
            }
        })
        .register("set-state-active", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    // Shared by provision and update; each provides the
                    // namespace id on its input and fresh endpoints from
                    // its own DNS step.
                    let namespace_id: String = serde_json::from_value(
                        input
                            .get("workflow")
                            .and_then(|w| w.get("namespace_id"))
                            .cloned()
                            .unwrap_or(Value::Null),
                    )
                    .map_err(|e| ActivityError::Permanent(format!("missing namespace_id: {e}")))?;
                    let endpoints: Option<Endpoints> = step_output(&input, "create-dns")
                        .ok()
                        .or_else(|| step_output(&input, "update-dns").ok());
                    c.namespaces
                        .update_state(&ctx.idempotency_key, &namespace_id, NamespaceState::Active, endpoints)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("setup-standby", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: ProvisionInput = workflow_input(&input)?;
                    let standby = wf
                        .standby_region
                        .ok_or_else(|| ActivityError::Permanent("ha_enabled without standby_region".into()))?;
                    c.cluster_admin
                        .setup_standby(&ctx.idempotency_key, &wf.namespace_id, &standby)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        // namespace update
        .register("update-config", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: UpdateInput = workflow_input(&input)?;
                    c.cluster_admin
                        .update_config(&ctx.idempotency_key, &wf.namespace_id, wf.retention_days)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("update-dns", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: UpdateInput = workflow_input(&input)?;
                    let endpoints = c
                        .dns
                        .update_records(&ctx.idempotency_key, &wf.namespace_id, &wf.region)
                        .await?;
                    Ok(json!(endpoints))
                }
            }
        })
        // namespace deletion
        .register("deprecate", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: DeleteInput = workflow_input(&input)?;
                    c.cluster_admin.deprecate(&ctx.idempotency_key, &wf.namespace_id).await?;
                    c.namespaces
                        .update_state(&ctx.idempotency_key, &wf.namespace_id, NamespaceState::Deleting, None)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("remove-dns", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: DeleteInput = workflow_input(&input)?;
                    c.dns.remove_records(&ctx.idempotency_key, &wf.namespace_id).await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("archive", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: DeleteInput = workflow_input(&input)?;
                    c.archive
                        .archive_namespace(&ctx.idempotency_key, &wf.namespace_id)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("set-state-deleted", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: DeleteInput = workflow_input(&input)?;
                    c.namespaces
                        .update_state(&ctx.idempotency_key, &wf.namespace_id, NamespaceState::Deleted, None)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        // namespace failover
        .register("verify-standby", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: FailoverInput = workflow_input(&input)?;
                    c.cluster_admin
                        .verify_standby(&ctx.idempotency_key, &wf.namespace_id)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("fence-primary", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: FailoverInput = workflow_input(&input)?;
                    c.cluster_admin
                        .fence_primary(&ctx.idempotency_key, &wf.namespace_id)
                        .await?;
                    c.namespaces
                        .update_state(&ctx.idempotency_key, &wf.namespace_id, NamespaceState::FailingOver, None)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("promote-standby", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: FailoverInput = workflow_input(&input)?;
                    c.cluster_admin
                        .promote_standby(&ctx.idempotency_key, &wf.namespace_id, &wf.target_region)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("update-dns-failover", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: FailoverInput = workflow_input(&input)?;
                    let endpoints = c
                        .dns
                        .update_records(&ctx.idempotency_key, &wf.namespace_id, &wf.target_region)
                        .await?;
                    c.namespaces
                        .update_state(
                            &ctx.idempotency_key,
                            &wf.namespace_id,
                            NamespaceState::Active,
                            Some(endpoints.clone()),
                        )
                        .await?;
                    Ok(json!(endpoints))
                }
            }
        })
        .register("verify-traffic", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: FailoverInput = workflow_input(&input)?;
                    c.cluster_admin
                        .verify_traffic(&ctx.idempotency_key, &wf.namespace_id)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        // billing cycle
        .register("aggregate-usage", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: BillingCycleInput = workflow_input(&input)?;
                    let summary = c
                        .usage
                        .aggregate_usage(
                            &ctx.idempotency_key,
                            &wf.organization_id,
                            wf.period_start_ms,
                            wf.period_end_ms,
                        )
                        .await?;
                    Ok(json!(summary))
                }
            }
        })
        .register("generate-invoice", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: BillingCycleInput = workflow_input(&input)?;
                    let summary: UsageSummary = step_output(&input, "aggregate-usage")?;
                    let subscription = c.billing.subscription(&wf.organization_id).await?;
                    let inv = invoice::build_invoice(&subscription, &summary, wf.period_start_ms, wf.period_end_ms);
                    let invoice_id = c.billing.create_invoice(&ctx.idempotency_key, &inv).await?;
                    Ok(json!({ "invoice_id": invoice_id, "total_cents": inv.total_cents }))
                }
            }
        })
        .register("report-stripe-usage", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: BillingCycleInput = workflow_input(&input)?;
                    let summary: UsageSummary = step_output(&input, "aggregate-usage")?;
                    c.stripe
                        .report_usage(&ctx.idempotency_key, &wf.organization_id, &summary)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("send-invoice-email", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: BillingCycleInput = workflow_input(&input)?;
                    let generated: Value = step_output(&input, "generate-invoice")?;
                    let invoice_id = generated
                        .get("invoice_id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ActivityError::Permanent("generate-invoice output missing invoice_id".into()))?
                        .to_string();
                    c.email
                        .send_invoice(&ctx.idempotency_key, &wf.organization_id, &invoice_id)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        // dunning
        .register("send-reminder", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: DunningInput = workflow_input(&input)?;
                    let round = param_u32(&input, "round")?;
                    c.email
                        .send_payment_reminder(&ctx.idempotency_key, &wf.organization_id, &wf.invoice_id, round)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .register("check-paid", {
            let c = c.clone();
            move |_ctx, input| {
                let c = c.clone();
                async move {
                    let wf: DunningInput = workflow_input(&input)?;
                    let paid = c.billing.invoice_paid(&wf.invoice_id).await?;
                    Ok(json!(paid))
                }
            }
        })
        .register("suspend-account", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: DunningInput = workflow_input(&input)?;
                    c.accounts.suspend(&ctx.idempotency_key, &wf.organization_id).await?;
                    Ok(Value::Null)
                }
            }
        })
        // usage aggregation
        .register("list-active-orgs", {
            let c = c.clone();
            move |ctx, _input| {
                let c = c.clone();
                async move {
                    let orgs = c.usage.list_active_orgs(&ctx.idempotency_key).await?;
                    Ok(json!(orgs))
                }
            }
        })
        .register("aggregate-org-usage", {
            let c = c.clone();
            move |ctx, input| {
                let c = c.clone();
                async move {
                    let wf: UsageAggregationInput = workflow_input(&input)?;
                    let org = fan_out_item(&input)?;
                    c.usage
                        .aggregate_org_usage(&ctx.idempotency_key, &org, &wf.period_type, wf.period_date_ms)
                        .await?;
                    Ok(Value::Null)
                }
            }
        })
        .build()
}

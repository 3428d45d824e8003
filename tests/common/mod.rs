#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use cloudplane::billing::{Invoice, Plan, Subscription, UsageSummary};
use cloudplane::capabilities::{
    build_activity_registry, AccountAdmin, ArchiveStore, BillingRepository, Capabilities, CertificateAuthority,
    ClusterAdmin, ClusterProvider, DnsProvider, EmailSender, Endpoints, NamespaceRepository, StripeGateway,
    UsageSource,
};
use cloudplane::providers::in_memory::InMemoryStore;
use cloudplane::providers::ExecutionStore;
use cloudplane::runtime::activity::ActivityError;
use cloudplane::runtime::{Engine, EngineOptions};
use cloudplane::workflows::{control_plane_registry, EngineTimings};
use cloudplane::{NamespaceState, WorkflowExecution};

/// Scriptable implementation of every capability trait.
///
/// Calls and idempotency keys are recorded per method name; failures are
/// scripted per method (`fail_transient_times`, `fail_permanently`) or, for
/// the fan-out activity, per `"aggregate_org_usage:<org>"` key.
pub struct MockCapabilities {
    calls: Mutex<HashMap<String, u32>>,
    keys: Mutex<HashMap<String, Vec<String>>>,
    fail_transient: Mutex<HashMap<String, u32>>,
    fail_permanent: Mutex<HashSet<String>>,
    /// invoice_paid returns true from this many checks onward (1-based).
    paid_after: Mutex<Option<u32>>,
    pub orgs: Vec<String>,
    pub usage: UsageSummary,
    pub subscription: Subscription,
    state_updates: Mutex<Vec<(String, NamespaceState)>>,
    invoices: Mutex<Vec<Invoice>>,
}

impl MockCapabilities {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            fail_transient: Mutex::new(HashMap::new()),
            fail_permanent: Mutex::new(HashSet::new()),
            paid_after: Mutex::new(None),
            orgs: vec!["org-1".into(), "org-2".into(), "org-3".into()],
            usage: UsageSummary {
                total_actions: 2_600_000,
                active_storage_gbh: 0.0,
                retained_storage_gbh: 0.0,
            },
            subscription: Subscription {
                organization_id: "org-1".into(),
                plan: Plan::Business,
                actions_included: 2_500_000,
                active_storage_gb: 10,
                retained_storage_gb: 100,
            },
            state_updates: Mutex::new(Vec::new()),
            invoices: Mutex::new(Vec::new()),
        })
    }

    pub fn capabilities(self: &Arc<Self>) -> Capabilities {
        Capabilities {
            clusters: self.clone(),
            certs: self.clone(),
            cluster_admin: self.clone(),
            dns: self.clone(),
            archive: self.clone(),
            namespaces: self.clone(),
            usage: self.clone(),
            billing: self.clone(),
            stripe: self.clone(),
            email: self.clone(),
            accounts: self.clone(),
        }
    }

    pub fn count(&self, method: &str) -> u32 {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub fn keys_for(&self, method: &str) -> Vec<String> {
        self.keys.lock().unwrap().get(method).cloned().unwrap_or_default()
    }

    pub fn state_updates(&self) -> Vec<(String, NamespaceState)> {
        self.state_updates.lock().unwrap().clone()
    }

    pub fn invoices(&self) -> Vec<Invoice> {
        self.invoices.lock().unwrap().clone()
    }

    /// The next `times` calls of `method` fail transiently.
    pub fn fail_transient_times(&self, method: &str, times: u32) {
        self.fail_transient.lock().unwrap().insert(method.to_string(), times);
    }

    /// Every call of `method` fails permanently.
    pub fn fail_permanently(&self, method: &str) {
        self.fail_permanent.lock().unwrap().insert(method.to_string());
    }

    /// invoice_paid returns true from the `n`th check onward.
    pub fn set_paid_after(&self, n: u32) {
        *self.paid_after.lock().unwrap() = Some(n);
    }

    fn record(&self, method: &str, idempotency_key: &str) {
        *self.calls.lock().unwrap().entry(method.to_string()).or_insert(0) += 1;
        self.keys
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push(idempotency_key.to_string());
    }

    fn check_fail(&self, method: &str) -> Result<(), ActivityError> {
        if self.fail_permanent.lock().unwrap().contains(method) {
            return Err(ActivityError::Permanent(format!("{method} scripted permanent failure")));
        }
        let mut transient = self.fail_transient.lock().unwrap();
        if let Some(remaining) = transient.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ActivityError::Transient(format!("{method} scripted transient failure")));
            }
        }
        Ok(())
    }

    fn hit(&self, method: &str, idempotency_key: &str) -> Result<(), ActivityError> {
        self.record(method, idempotency_key);
        self.check_fail(method)
    }

    fn endpoints(namespace_id: &str) -> Endpoints {
        Endpoints {
            grpc: format!("{namespace_id}.grpc.example.net:7233"),
            web: format!("https://{namespace_id}.web.example.net"),
            metrics: format!("{namespace_id}.metrics.example.net:443"),
        }
    }
}

#[async_trait]
impl ClusterProvider for MockCapabilities {
    async fn select_cluster(&self, key: &str, region: &str) -> Result<String, ActivityError> {
        self.hit("select_cluster", key)?;
        Ok(format!("cluster-{region}-001"))
    }
}

#[async_trait]
impl CertificateAuthority for MockCapabilities {
    async fn issue(&self, key: &str, namespace_id: &str) -> Result<String, ActivityError> {
        self.hit("issue", key)?;
        Ok(format!("certs-{namespace_id}"))
    }
}

#[async_trait]
impl ClusterAdmin for MockCapabilities {
    async fn register_namespace(&self, key: &str, _cluster: &str, _ns: &str, _retention: u32) -> Result<(), ActivityError> {
        self.hit("register_namespace", key)
    }
    async fn update_config(&self, key: &str, _ns: &str, _retention: u32) -> Result<(), ActivityError> {
        self.hit("update_config", key)
    }
    async fn deprecate(&self, key: &str, _ns: &str) -> Result<(), ActivityError> {
        self.hit("deprecate", key)
    }
    async fn setup_standby(&self, key: &str, _ns: &str, _standby: &str) -> Result<(), ActivityError> {
        self.hit("setup_standby", key)
    }
    async fn verify_standby(&self, key: &str, _ns: &str) -> Result<(), ActivityError> {
        self.hit("verify_standby", key)
    }
    async fn fence_primary(&self, key: &str, _ns: &str) -> Result<(), ActivityError> {
        self.hit("fence_primary", key)
    }
    async fn promote_standby(&self, key: &str, _ns: &str, _region: &str) -> Result<(), ActivityError> {
        self.hit("promote_standby", key)
    }
    async fn verify_traffic(&self, key: &str, _ns: &str) -> Result<(), ActivityError> {
        self.hit("verify_traffic", key)
    }
}

#[async_trait]
impl DnsProvider for MockCapabilities {
    async fn create_records(&self, key: &str, ns: &str, _region: &str) -> Result<Endpoints, ActivityError> {
        self.hit("create_records", key)?;
        Ok(Self::endpoints(ns))
    }
    async fn update_records(&self, key: &str, ns: &str, _region: &str) -> Result<Endpoints, ActivityError> {
        self.hit("update_records", key)?;
        Ok(Self::endpoints(ns))
    }
    async fn remove_records(&self, key: &str, _ns: &str) -> Result<(), ActivityError> {
        self.hit("remove_records", key)
    }
}

#[async_trait]
impl ArchiveStore for MockCapabilities {
    async fn archive_namespace(&self, key: &str, _ns: &str) -> Result<(), ActivityError> {
        self.hit("archive_namespace", key)
    }
}

#[async_trait]
impl NamespaceRepository for MockCapabilities {
    async fn update_state(
        &self,
        key: &str,
        ns: &str,
        state: NamespaceState,
        _endpoints: Option<Endpoints>,
    ) -> Result<(), ActivityError> {
        self.hit("update_state", key)?;
        self.state_updates.lock().unwrap().push((ns.to_string(), state));
        Ok(())
    }
}

#[async_trait]
impl UsageSource for MockCapabilities {
    async fn list_active_orgs(&self, key: &str) -> Result<Vec<String>, ActivityError> {
        self.hit("list_active_orgs", key)?;
        Ok(self.orgs.clone())
    }
    async fn aggregate_usage(&self, key: &str, _org: &str, _start: u64, _end: u64) -> Result<UsageSummary, ActivityError> {
        self.hit("aggregate_usage", key)?;
        Ok(self.usage.clone())
    }
    async fn aggregate_org_usage(&self, key: &str, org: &str, _period: &str, _date: u64) -> Result<(), ActivityError> {
        self.record("aggregate_org_usage", key);
        self.check_fail(&format!("aggregate_org_usage:{org}"))?;
        self.check_fail("aggregate_org_usage")
    }
}

#[async_trait]
impl BillingRepository for MockCapabilities {
    async fn subscription(&self, _org: &str) -> Result<Subscription, ActivityError> {
        self.record("subscription", "");
        Ok(self.subscription.clone())
    }
    async fn create_invoice(&self, key: &str, invoice: &Invoice) -> Result<String, ActivityError> {
        self.hit("create_invoice", key)?;
        self.invoices.lock().unwrap().push(invoice.clone());
        Ok(format!("inv-{}", self.invoices.lock().unwrap().len()))
    }
    async fn invoice_paid(&self, _invoice_id: &str) -> Result<bool, ActivityError> {
        self.record("invoice_paid", "");
        self.check_fail("invoice_paid")?;
        let checks = self.count("invoice_paid");
        Ok(self.paid_after.lock().unwrap().map(|n| checks >= n).unwrap_or(false))
    }
}

#[async_trait]
impl StripeGateway for MockCapabilities {
    async fn report_usage(&self, key: &str, _org: &str, _usage: &UsageSummary) -> Result<(), ActivityError> {
        self.hit("report_usage", key)
    }
}

#[async_trait]
impl EmailSender for MockCapabilities {
    async fn send_invoice(&self, key: &str, _org: &str, _invoice_id: &str) -> Result<(), ActivityError> {
        self.hit("send_invoice", key)
    }
    async fn send_payment_reminder(&self, key: &str, _org: &str, _invoice_id: &str, _round: u32) -> Result<(), ActivityError> {
        self.hit("send_payment_reminder", key)
    }
}

#[async_trait]
impl AccountAdmin for MockCapabilities {
    async fn suspend(&self, key: &str, _org: &str) -> Result<(), ActivityError> {
        self.hit("suspend", key)
    }
}

/// Engine over an in-memory store with millisecond timings.
pub async fn start_engine(caps: &Arc<MockCapabilities>) -> (Arc<Engine>, Arc<dyn ExecutionStore>) {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryStore::new());
    let engine = start_engine_on(caps, store.clone()).await;
    (engine, store)
}

/// Engine over a caller-provided store (restart and sqlite scenarios).
pub async fn start_engine_on(caps: &Arc<MockCapabilities>, store: Arc<dyn ExecutionStore>) -> Arc<Engine> {
    Engine::start(
        store,
        control_plane_registry(&EngineTimings::fast()),
        build_activity_registry(caps.capabilities()),
        EngineOptions::default(),
    )
    .await
}

/// Poll until the execution reaches a terminal status.
pub async fn wait_for_terminal(engine: &Arc<Engine>, execution_id: &str, timeout_ms: u64) -> WorkflowExecution {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        let execution = engine.get_status(execution_id).await.expect("execution exists");
        if execution.is_terminal() {
            return execution;
        }
        if std::time::Instant::now() > deadline {
            panic!(
                "execution {execution_id} still {:?} at step {} after {timeout_ms}ms",
                execution.status, execution.current_step_index
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

pub fn provision_input(namespace_id: &str, ha: bool) -> Value {
    serde_json::json!({
        "namespace_id": namespace_id,
        "organization_id": "org-1",
        "name": namespace_id,
        "region": "eu-west-1",
        "retention_days": 30,
        "ha_enabled": ha,
        "standby_region": if ha { Value::String("eu-central-1".into()) } else { Value::Null },
    })
}

pub fn billing_cycle_input() -> Value {
    serde_json::json!({
        "organization_id": "org-1",
        "period_start_ms": 1_700_000_000_000u64,
        "period_end_ms": 1_702_592_000_000u64,
    })
}

pub fn dunning_input() -> Value {
    serde_json::json!({
        "organization_id": "org-1",
        "invoice_id": "inv-1",
    })
}

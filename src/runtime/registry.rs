use std::collections::HashMap;
use std::sync::Arc;

use crate::workflows::WorkflowDefinition;
use crate::WorkflowType;

/// Immutable registry mapping workflow types to step-definition tables.
///
/// Built once and handed to the engine at construction; there is no global
/// mutable registration.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<WorkflowType, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, workflow_type: WorkflowType) -> Option<Arc<WorkflowDefinition>> {
        self.inner.get(&workflow_type).cloned()
    }

    pub fn has(&self, workflow_type: WorkflowType) -> bool {
        self.inner.contains_key(&workflow_type)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<WorkflowType, Arc<WorkflowDefinition>>,
    errors: Vec<String>,
}

impl WorkflowRegistryBuilder {
    pub fn register(mut self, definition: WorkflowDefinition) -> Self {
        if self.map.contains_key(&definition.workflow_type) {
            self.errors
                .push(format!("duplicate workflow registration: {}", definition.workflow_type));
            return self;
        }
        self.map.insert(definition.workflow_type, Arc::new(definition));
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build, surfacing duplicate-registration errors.
    pub fn build_result(self) -> Result<WorkflowRegistry, String> {
        if self.errors.is_empty() {
            Ok(WorkflowRegistry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::EngineTimings;

    #[test]
    fn registers_and_resolves() {
        let timings = EngineTimings::default();
        let reg = WorkflowRegistry::builder()
            .register(crate::workflows::namespace::provision_definition(&timings))
            .register(crate::workflows::billing::dunning_definition(&timings))
            .build();
        assert_eq!(reg.count(), 2);
        assert!(reg.has(WorkflowType::NamespaceProvision));
        assert!(reg.get(WorkflowType::BillingCycle).is_none());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let timings = EngineTimings::default();
        let err = WorkflowRegistry::builder()
            .register(crate::workflows::namespace::provision_definition(&timings))
            .register(crate::workflows::namespace::provision_definition(&timings))
            .build_result()
            .err()
            .unwrap();
        assert!(err.contains("duplicate"));
    }
}

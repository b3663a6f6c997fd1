use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Capability, CapabilityRequest, CapabilityResponse};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capability name is empty")]
    EmptyName,

    #[error("capability '{0}' is already registered")]
    Duplicate(String),

    #[error("capability '{0}' not found")]
    NotFound(String),
}

/// Health of one registered capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityHealth {
    pub name: String,
    pub version: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Concurrency-safe directory of capabilities, keyed by lowercase name.
///
/// Lookups take the read lock; registration takes the write lock. The
/// lock is never held across an `.await`.
#[derive(Default)]
pub struct Registry {
    items: RwLock<BTreeMap<String, Arc<dyn Capability>>>,
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability. Fails on an empty or already-taken name and
    /// leaves the registry unchanged.
    pub fn register(&self, capability: Arc<dyn Capability>) -> Result<(), RegistryError> {
        let name = normalize(capability.name());
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut items = self.items.write();
        if items.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        info!("Registered capability: {name} ({})", capability.version());
        items.insert(name, capability);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Capability>, RegistryError> {
        let key = normalize(name);
        let removed = self
            .items
            .write()
            .remove(&key)
            .ok_or(RegistryError::NotFound(key.clone()))?;
        debug!("Unregistered capability: {key}");
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Capability>, RegistryError> {
        let key = normalize(name);
        self.items
            .read()
            .get(&key)
            .cloned()
            .ok_or(RegistryError::NotFound(key))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.read().contains_key(&normalize(name))
    }

    /// All capabilities in name order.
    pub fn list(&self) -> Vec<Arc<dyn Capability>> {
        self.items.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Capabilities available to callers. Only local registrations exist
    /// today.
    pub async fn discover(&self) -> anyhow::Result<Vec<Arc<dyn Capability>>> {
        Ok(self.list())
    }

    /// Looks up `name` and invokes it.
    pub async fn dispatch(
        &self,
        name: &str,
        request: &CapabilityRequest,
    ) -> anyhow::Result<CapabilityResponse> {
        let capability = self.get(name)?;
        debug!(
            "Dispatching {}.{} for agent {}",
            capability.name(),
            request.action,
            request.agent_id()
        );
        capability.invoke(request).await
    }

    /// Runs every health check concurrently; the report keeps name order.
    pub async fn health(&self) -> Vec<CapabilityHealth> {
        let checks = self.list().into_iter().map(|capability| async move {
            let result = capability.health_check().await;
            CapabilityHealth {
                name: normalize(capability.name()),
                version: capability.version().to_string(),
                healthy: result.is_ok(),
                error: result.err().map(|e| format!("{e:#}")),
            }
        });
        join_all(checks).await
    }

    /// Shuts every capability down, continuing past failures.
    pub async fn shutdown_all(&self) -> anyhow::Result<()> {
        let mut failed = Vec::new();
        for capability in self.list() {
            if let Err(e) = capability.shutdown().await {
                warn!("Capability {} failed to shut down: {e:#}", capability.name());
                failed.push(capability.name().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("capabilities failed to shut down: {}", failed.join(", "))
        }
    }
}

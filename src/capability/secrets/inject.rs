use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{SecretError, SecretResolver};

/// Environment variable `name` filled from secret reference `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBinding {
    pub name: String,
    pub source: String,
}

impl SecretBinding {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Resolves every binding in order. The first failure aborts the batch
/// and no partial map is returned.
pub async fn inject(
    resolver: &dyn SecretResolver,
    bindings: &[SecretBinding],
) -> Result<BTreeMap<String, String>, SecretError> {
    let mut env = BTreeMap::new();
    for binding in bindings {
        if binding.name.trim().is_empty() {
            return Err(SecretError::InvalidReference(format!(
                "binding for '{}' has no name",
                binding.source
            )));
        }
        let value = resolver
            .resolve(&binding.source)
            .await
            .map_err(|e| SecretError::Binding {
                name: binding.name.clone(),
                source: Box::new(e),
            })?;
        env.insert(binding.name.clone(), value);
    }
    Ok(env)
}

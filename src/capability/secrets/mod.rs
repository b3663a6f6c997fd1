//! Secret references and the `secrets` capability.
//!
//! A reference is `scheme://locator`:
//!
//! - `env://NAME` resolves the host environment variable `NAME`
//! - `vault://path/to/secret#key` reads one key from HashiCorp Vault
//!   (KV v1 or v2)
//!
//! `SchemeResolver` routes a reference to the resolver for its scheme.
//! `inject` turns a list of bindings into an environment map for a
//! sandbox launch.

mod env;
mod inject;
mod vault;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    Action, Capability, CapabilityRequest, CapabilityResponse, ErrorCode, Field, FieldType, Schema,
};

pub use env::EnvResolver;
pub use inject::{inject, SecretBinding};
pub use vault::VaultResolver;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("vault address is not configured")]
    MissingAddress,

    #[error("vault token is not configured (set secrets.vault.token or VAULT_TOKEN)")]
    MissingToken,

    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("unsupported secret scheme in '{0}' (expected env:// or vault://)")]
    UnsupportedScheme(String),

    #[error("invalid secret reference '{0}'")]
    InvalidReference(String),

    #[error("vault request for '{reference}' failed: {message}")]
    Http { reference: String, message: String },

    #[error("cannot decode vault response for '{reference}': {message}")]
    Decode { reference: String, message: String },

    #[error("binding '{name}': {source}")]
    Binding {
        name: String,
        #[source]
        source: Box<SecretError>,
    },
}

impl SecretError {
    /// Misconfiguration of the resolver itself, not of one reference.
    pub fn is_config(&self) -> bool {
        match self {
            SecretError::MissingAddress | SecretError::MissingToken => true,
            SecretError::Binding { source, .. } => source.is_config(),
            _ => false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SecretError::NotFound(_) => ErrorCode::NotFound,
            SecretError::UnsupportedScheme(_) | SecretError::InvalidReference(_) => {
                ErrorCode::InvalidParams
            }
            SecretError::Binding { source, .. } => source.code(),
            _ => ErrorCode::ResolveFailed,
        }
    }
}

/// Resolves secret references to their values.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Scheme handled, without `://` (e.g. `"vault"`).
    fn scheme(&self) -> &str;

    async fn resolve(&self, reference: &str) -> Result<String, SecretError>;
}

/// Splits `scheme://rest`.
pub(crate) fn split_reference(reference: &str) -> Option<(&str, &str)> {
    reference.trim().split_once("://")
}

// ── SchemeResolver ───────────────────────────────────────

/// Routes each reference to the resolver registered for its scheme.
#[derive(Default, Clone)]
pub struct SchemeResolver {
    resolvers: BTreeMap<String, Arc<dyn SecretResolver>>,
}

impl SchemeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.resolvers
            .insert(resolver.scheme().to_lowercase(), resolver);
        self
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.resolvers.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl SecretResolver for SchemeResolver {
    fn scheme(&self) -> &str {
        "*"
    }

    async fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        let (scheme, _) = split_reference(reference)
            .ok_or_else(|| SecretError::UnsupportedScheme(reference.to_string()))?;
        let resolver = self
            .resolvers
            .get(&scheme.to_lowercase())
            .ok_or_else(|| SecretError::UnsupportedScheme(reference.to_string()))?;
        resolver.resolve(reference).await
    }
}

// ── SecretsCapability ────────────────────────────────────

#[derive(Deserialize)]
struct ResolveParams {
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Deserialize)]
struct InjectParams {
    bindings: Vec<SecretBinding>,
}

pub struct SecretsCapability {
    resolver: Arc<dyn SecretResolver>,
}

impl SecretsCapability {
    pub fn new(resolver: Arc<dyn SecretResolver>) -> Self {
        Self { resolver }
    }

    fn refused(&self, error: SecretError) -> anyhow::Result<CapabilityResponse> {
        if error.is_config() {
            return Err(error.into());
        }
        Ok(CapabilityResponse::fail(error.code(), error.to_string()))
    }
}

#[async_trait]
impl Capability for SecretsCapability {
    fn name(&self) -> &str {
        "secrets"
    }

    fn description(&self) -> &str {
        "Resolve env:// and vault:// secret references"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .action(
                Action::new("resolve", "Resolve one secret reference")
                    .field("ref", Field::required(FieldType::String, "env://NAME or vault://path#key")),
            )
            .action(
                Action::new("inject", "Resolve bindings into an environment map (all or nothing)")
                    .field(
                        "bindings",
                        Field::required(FieldType::Array, "List of {name, source}"),
                    ),
            )
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        match request.action.as_str() {
            "resolve" => {
                let params: ResolveParams = match request.params() {
                    Ok(p) => p,
                    Err(e) => return Ok(e.into()),
                };
                match self.resolver.resolve(&params.reference).await {
                    Ok(value) => {
                        debug!("Resolved secret reference {}", params.reference);
                        Ok(CapabilityResponse::ok(json!({
                            "ref": params.reference,
                            "value": value,
                        })))
                    }
                    Err(e) => self.refused(e),
                }
            }
            "inject" => {
                let params: InjectParams = match request.params() {
                    Ok(p) => p,
                    Err(e) => return Ok(e.into()),
                };
                match inject(self.resolver.as_ref(), &params.bindings).await {
                    Ok(env) => Ok(CapabilityResponse::ok(json!({ "env": env }))),
                    Err(e) => self.refused(e),
                }
            }
            other => Ok(CapabilityResponse::fail(ErrorCode::InvalidAction, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn capability() -> SecretsCapability {
        let resolver = SchemeResolver::new()
            .with(Arc::new(EnvResolver::new(true)))
            .with(Arc::new(VaultResolver::with_token("", None).unwrap()));
        SecretsCapability::new(Arc::new(resolver))
    }

    async fn call(cap: &SecretsCapability, action: &str, params: Value) -> anyhow::Result<CapabilityResponse> {
        cap.invoke(&CapabilityRequest::new(action).with_params(params)).await
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SecretError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(SecretError::UnsupportedScheme("x".into()).code(), ErrorCode::InvalidParams);
        assert_eq!(
            SecretError::Http {
                reference: "x".into(),
                message: "HTTP 500".into()
            }
            .code(),
            ErrorCode::ResolveFailed
        );
        let wrapped = SecretError::Binding {
            name: "DB".into(),
            source: Box::new(SecretError::MissingToken),
        };
        assert!(wrapped.is_config());
    }

    #[tokio::test]
    async fn test_scheme_routing() {
        std::env::set_var("SPAWN_TEST_SCHEME_ROUTING", "routed");
        let resolver = SchemeResolver::new().with(Arc::new(EnvResolver::default()));
        assert_eq!(resolver.schemes(), vec!["env"]);
        assert_eq!(
            resolver.resolve("env://SPAWN_TEST_SCHEME_ROUTING").await.unwrap(),
            "routed"
        );
        assert!(matches!(
            resolver.resolve("aws://secret").await,
            Err(SecretError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            resolver.resolve("no-scheme").await,
            Err(SecretError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_action() {
        std::env::set_var("SPAWN_TEST_RESOLVE_ACTION", "value-1");
        let cap = capability();
        let response = call(&cap, "resolve", json!({"ref": "env://SPAWN_TEST_RESOLVE_ACTION"}))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.data().unwrap()["value"], "value-1");
    }

    #[tokio::test]
    async fn test_resolve_action_error_tiers() {
        let cap = capability();

        let response = call(&cap, "resolve", json!({"ref": "env://SPAWN_TEST_DEFINITELY_UNSET"}))
            .await
            .unwrap();
        assert_eq!(response.code(), Some(ErrorCode::NotFound));

        let response = call(&cap, "resolve", json!({"ref": "gcp://x"})).await.unwrap();
        assert_eq!(response.code(), Some(ErrorCode::InvalidParams));

        // Vault with no address is a configuration problem, not a domain failure.
        assert!(call(&cap, "resolve", json!({"ref": "vault://kv/app#k"})).await.is_err());
    }

    #[tokio::test]
    async fn test_inject_action() {
        std::env::set_var("SPAWN_TEST_INJECT_A", "a");
        std::env::set_var("SPAWN_TEST_INJECT_B", "b");
        let cap = capability();
        let response = call(
            &cap,
            "inject",
            json!({"bindings": [
                {"name": "A", "source": "env://SPAWN_TEST_INJECT_A"},
                {"name": "B", "source": "env://SPAWN_TEST_INJECT_B"}
            ]}),
        )
        .await
        .unwrap();
        assert_eq!(response.data().unwrap()["env"], json!({"A": "a", "B": "b"}));

        let response = call(
            &cap,
            "inject",
            json!({"bindings": [
                {"name": "A", "source": "env://SPAWN_TEST_INJECT_A"},
                {"name": "C", "source": "env://SPAWN_TEST_INJECT_UNSET"}
            ]}),
        )
        .await
        .unwrap();
        assert_eq!(response.code(), Some(ErrorCode::NotFound));
        assert!(response.data().is_none());
    }

    #[tokio::test]
    async fn test_inject_rejects_malformed_bindings() {
        let cap = capability();
        let response = call(&cap, "inject", json!({"bindings": [{"name": "A"}]}))
            .await
            .unwrap();
        assert_eq!(response.code(), Some(ErrorCode::InvalidParams));
    }
}

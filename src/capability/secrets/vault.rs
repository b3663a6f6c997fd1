//! HashiCorp Vault resolver.
//!
//! `vault://<path>#<key>` becomes `GET {address}/v1/<path>` with the
//! `X-Vault-Token` header. KV v2 payloads (`data.data`) and KV v1
//! payloads (`data`) are told apart by shape, so the mount's engine
//! version never needs configuring.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{split_reference, SecretError, SecretResolver};
use crate::capability::net::read_capped;

/// Largest Vault response accepted (64 KB).
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct VaultResolver {
    address: String,
    token: Option<String>,
    strict: bool,
    client: reqwest::Client,
}

impl VaultResolver {
    /// Uses `token`, falling back to `VAULT_TOKEN`.
    pub fn new(address: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let token = token
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var("VAULT_TOKEN").ok());
        Self::with_token(address, token)
    }

    /// Uses exactly `token`, with no environment fallback.
    pub fn with_token(address: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("building Vault client: {e}"))?;
        Ok(Self {
            address: address.into().trim().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            strict: false,
            client,
        })
    }

    /// In strict mode a missing key is `NotFound` instead of falling
    /// back to the first value of the secret.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn locate<'a>(&self, reference: &'a str) -> Result<(&'a str, Option<&'a str>), SecretError> {
        let locator = match split_reference(reference) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("vault") => rest,
            _ => return Err(SecretError::UnsupportedScheme(reference.to_string())),
        };
        let (path, key) = match locator.split_once('#') {
            Some((path, key)) => (path, Some(key).filter(|k| !k.is_empty())),
            None => (locator, None),
        };
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(SecretError::InvalidReference(reference.to_string()));
        }
        Ok((path, key))
    }
}

/// The secret's key/value map: `data.data` for KV v2, `data` for KV v1.
fn secret_data(payload: &Value) -> Option<&serde_json::Map<String, Value>> {
    let data = payload.get("data")?;
    match data.get("data") {
        Some(Value::Object(inner)) => Some(inner),
        _ => data.as_object(),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SecretResolver for VaultResolver {
    fn scheme(&self) -> &str {
        "vault"
    }

    async fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        if self.address.is_empty() {
            return Err(SecretError::MissingAddress);
        }
        let token = self.token.as_deref().ok_or(SecretError::MissingToken)?;
        let (path, key) = self.locate(reference)?;

        let url = format!("{}/v1/{path}", self.address);
        debug!("Reading Vault secret at {path}");
        let http_error = |message: String| SecretError::Http {
            reference: reference.to_string(),
            message,
        };
        let decode_error = |message: String| SecretError::Decode {
            reference: reference.to_string(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", token)
            .send()
            .await
            .map_err(|e| http_error(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(reference.to_string()));
        }
        if status != reqwest::StatusCode::OK {
            warn!("Vault returned {status} for {path}");
            return Err(http_error(format!("HTTP {status}")));
        }

        let body = read_capped(response, MAX_RESPONSE_SIZE)
            .await
            .map_err(|e| http_error(e.to_string()))?;
        if body.truncated {
            return Err(decode_error(format!(
                "response exceeds {MAX_RESPONSE_SIZE} bytes"
            )));
        }
        let payload: Value =
            serde_json::from_slice(&body.bytes).map_err(|e| decode_error(e.to_string()))?;
        let data = secret_data(&payload)
            .ok_or_else(|| decode_error("no data object in response".into()))?;

        if let Some(key) = key {
            if let Some(value) = data.get(key) {
                return Ok(render(value));
            }
            if self.strict {
                return Err(SecretError::NotFound(reference.to_string()));
            }
        }

        // No key requested, or non-strict miss: first value in key order.
        let ordered: BTreeMap<&String, &Value> = data.iter().collect();
        let first = ordered
            .into_values()
            .next()
            .map(render)
            .ok_or_else(|| SecretError::NotFound(reference.to_string()));
        first
    }
}

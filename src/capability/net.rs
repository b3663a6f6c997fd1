//! `net` capability: policy-checked HTTP GET and DNS resolution.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    Action, Capability, CapabilityRequest, CapabilityResponse, ErrorCode, Field, FieldType, Schema,
};
use crate::policy::{normalize_host, HostPolicy, PolicyViolation};

/// Maximum response body returned by `get` (8 KB).
pub const MAX_BODY_SIZE: usize = 8 * 1024;

/// HTTP read timeout in seconds.
const READ_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

const USER_AGENT: &str = concat!("spawn-net/", env!("CARGO_PKG_VERSION"));

#[derive(Deserialize)]
struct GetParams {
    url: String,
}

#[derive(Deserialize)]
struct ResolveParams {
    host: String,
}

/// Maps a policy refusal onto its error code.
pub(crate) fn refused(violation: PolicyViolation) -> CapabilityResponse {
    match violation {
        PolicyViolation::InvalidUrl(_) => CapabilityResponse::fail(ErrorCode::InvalidUrl, violation.to_string()),
        other => {
            warn!("Blocked by network policy: {other}");
            CapabilityResponse::fail(ErrorCode::Blocked, other.to_string())
        }
    }
}

/// HTTP client shared by `net` and `browser`. Redirects are never followed:
/// each hop would bypass the host policy.
pub(crate) fn http_client() -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow::anyhow!("building HTTP client: {e}"))?;
    Ok(client)
}

/// Body read up to a cap.
pub(crate) struct CappedBody {
    pub bytes: Vec<u8>,
    /// More data was available past the cap.
    pub truncated: bool,
}

/// Reads at most `cap` bytes of the body, chunk by chunk.
pub(crate) async fn read_capped(
    mut response: reqwest::Response,
    cap: usize,
) -> reqwest::Result<CappedBody> {
    let mut bytes = Vec::new();
    let mut truncated = false;
    while let Some(chunk) = response.chunk().await? {
        let room = cap.saturating_sub(bytes.len());
        if chunk.len() > room {
            bytes.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(CappedBody { bytes, truncated })
}

pub struct NetCapability {
    policy: HostPolicy,
    client: reqwest::Client,
}

impl NetCapability {
    pub fn new(policy: HostPolicy) -> anyhow::Result<Self> {
        Ok(Self {
            policy,
            client: http_client()?,
        })
    }

    pub fn policy(&self) -> &HostPolicy {
        &self.policy
    }

    async fn get(&self, params: GetParams, timeout: Option<Duration>) -> CapabilityResponse {
        let url = match self.policy.check_url(&params.url) {
            Ok(url) => url,
            Err(v) => return refused(v),
        };
        let host = url.host_str().unwrap_or_default().to_string();
        debug!("Fetching URL: {url}");

        let mut builder = self.client.get(url.clone());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("GET {url} failed: {e}");
                return CapabilityResponse::fail(ErrorCode::HttpFailed, e.to_string());
            }
        };

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let body = match read_capped(response, MAX_BODY_SIZE).await {
            Ok(body) => body,
            Err(e) => {
                return CapabilityResponse::fail(ErrorCode::HttpFailed, format!("reading body: {e}"))
            }
        };

        CapabilityResponse::ok(json!({
            "status": status,
            "host": host,
            "headers": headers,
            "body": String::from_utf8_lossy(&body.bytes),
            "body_bytes": body.bytes.len(),
            "truncated": body.truncated,
        }))
    }

    async fn resolve(&self, params: ResolveParams) -> CapabilityResponse {
        if let Err(v) = self.policy.check_host(&params.host) {
            return refused(v);
        }
        let host = normalize_host(&params.host);
        let lookup = tokio::net::lookup_host((host.as_str(), 0)).await;
        match lookup {
            Ok(addrs) => {
                let mut ips: Vec<String> = Vec::new();
                for addr in addrs {
                    let ip = addr.ip().to_string();
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
                debug!("Resolved {host} to {} addresses", ips.len());
                CapabilityResponse::ok(json!({ "host": host, "addresses": ips }))
            }
            Err(e) => CapabilityResponse::fail(ErrorCode::DnsFailed, format!("lookup {host}: {e}")),
        }
    }
}

#[async_trait]
impl Capability for NetCapability {
    fn name(&self) -> &str {
        "net"
    }

    fn description(&self) -> &str {
        "HTTP GET and DNS resolution under host allow/deny policy"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .action(
                Action::new("get", "Fetch a URL (body capped at 8 KB, redirects not followed)")
                    .field("url", Field::required(FieldType::String, "Absolute http(s) URL")),
            )
            .action(
                Action::new("resolve", "Resolve a host name to IP addresses")
                    .field("host", Field::required(FieldType::String, "Host name")),
            )
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        let response = match request.action.as_str() {
            "get" => match request.params() {
                Ok(p) => self.get(p, request.timeout).await,
                Err(e) => e.into(),
            },
            "resolve" => match request.params() {
                Ok(p) => self.resolve(p).await,
                Err(e) => e.into(),
            },
            other => CapabilityResponse::fail(ErrorCode::InvalidAction, other),
        };
        Ok(response)
    }
}

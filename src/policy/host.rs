//! Host allow/deny matching for outbound requests.

use url::Url;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("host '{host}' is denied by '{pattern}'")]
    Denied { host: String, pattern: String },

    #[error("host '{0}' is not in the allowlist")]
    NotAllowed(String),
}

/// Allow and deny lists of host patterns.
///
/// Patterns are `*` (any host), `*.example.com` (the domain and every
/// subdomain) or an exact host. Deny wins over allow; an empty allowlist
/// allows everything not denied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPolicy {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl HostPolicy {
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let normalize_all = |patterns: Vec<String>| -> Vec<String> {
            patterns
                .iter()
                .map(|p| normalize_host(p))
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            allow: normalize_all(allow.into_iter().map(|p| p.as_ref().to_string()).collect()),
            deny: normalize_all(deny.into_iter().map(|p| p.as_ref().to_string()).collect()),
        }
    }

    /// Everything allowed.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn check_host(&self, host: &str) -> Result<(), PolicyViolation> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(PolicyViolation::InvalidUrl("host is empty".into()));
        }
        if let Some(pattern) = self.deny.iter().find(|p| matches(&host, p)) {
            return Err(PolicyViolation::Denied {
                host,
                pattern: pattern.clone(),
            });
        }
        if self.allow.is_empty() || self.allow.iter().any(|p| matches(&host, p)) {
            Ok(())
        } else {
            Err(PolicyViolation::NotAllowed(host))
        }
    }

    /// Parses `raw` as an absolute http(s) URL and checks its host.
    pub fn check_url(&self, raw: &str) -> Result<Url, PolicyViolation> {
        let url = Url::parse(raw.trim())
            .map_err(|e| PolicyViolation::InvalidUrl(format!("'{raw}': {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(PolicyViolation::InvalidUrl(format!(
                    "unsupported scheme '{scheme}' (only http/https)"
                )))
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| PolicyViolation::InvalidUrl(format!("'{raw}' has no host")))?;
        self.check_host(host)?;
        Ok(url)
    }
}

/// Lowercases, strips any port, IPv6 brackets and the trailing dot.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if let Some(rest) = raw.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if raw.matches(':').count() == 1 {
        raw.split(':').next().unwrap_or(raw)
    } else {
        raw
    };
    host.trim_end_matches('.').to_lowercase()
}

fn matches(host: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
        None => host == pattern,
    }
}

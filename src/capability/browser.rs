//! `browser` capability: text captures of web pages.
//!
//! There is no headless engine behind this. A "screenshot" is the page
//! fetched under the network host policy, rendered to plain text with
//! `html2text` and written below the capture directory.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::net::{http_client, read_capped, refused};
use super::{
    Action, Capability, CapabilityRequest, CapabilityResponse, ErrorCode, Field, FieldType, Schema,
};
use crate::policy::{ContainmentError, HostPolicy, PathJail};

/// Maximum page size fetched for a capture (5 MB).
const MAX_PAGE_SIZE: usize = 5 * 1024 * 1024;

/// Text wrapping width for html2text conversion.
const TEXT_WIDTH: usize = 100;

#[derive(Deserialize)]
struct ScreenshotParams {
    url: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct RecordParams {
    url: String,
}

#[derive(Deserialize)]
struct StopParams {
    recording_id: String,
}

/// A recording opened by `record`.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub url: String,
    pub started_at: DateTime<Utc>,
}

pub struct BrowserCapability {
    policy: HostPolicy,
    captures: PathJail,
    client: reqwest::Client,
    recordings: RwLock<BTreeMap<String, Recording>>,
}

impl BrowserCapability {
    /// Creates `capture_dir` if needed.
    pub fn new(policy: HostPolicy, capture_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let captures = PathJail::new(capture_dir)?;
        Ok(Self {
            policy,
            captures,
            client: http_client()?,
            recordings: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn capture_dir(&self) -> &Path {
        self.captures.root()
    }

    pub fn recording(&self, id: &str) -> Option<Recording> {
        self.recordings.read().get(id).cloned()
    }

    async fn screenshot(&self, params: ScreenshotParams) -> CapabilityResponse {
        let url = match self.policy.check_url(&params.url) {
            Ok(url) => url,
            Err(v) => return refused(v),
        };

        let name = params
            .path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| format!("capture-{}.txt", uuid::Uuid::new_v4()));
        let target = match self.captures.resolve(&name).await {
            Ok(p) => p,
            Err(e) => return denied(e),
        };

        debug!("Capturing URL: {url}");
        let response = match self.client.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Capture of {url} failed: {e}");
                return CapabilityResponse::fail(ErrorCode::HttpFailed, e.to_string());
            }
        };
        let status = response.status();
        if !status.is_success() {
            return CapabilityResponse::fail(ErrorCode::HttpFailed, format!("HTTP {status}"));
        }
        if let Some(len) = response.content_length() {
            if len > MAX_PAGE_SIZE as u64 {
                return too_large(len);
            }
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();
        let body = match read_capped(response, MAX_PAGE_SIZE).await {
            Ok(body) if body.truncated => return too_large(body.bytes.len() as u64),
            Ok(body) => body.bytes,
            Err(e) => return CapabilityResponse::fail(ErrorCode::HttpFailed, e.to_string()),
        };

        let text = render_text(&content_type, &body);
        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return CapabilityResponse::fail(ErrorCode::WriteFailed, format!("{name}: {e}"));
            }
        }
        if let Err(e) = tokio::fs::write(&target, text.as_bytes()).await {
            return CapabilityResponse::fail(ErrorCode::WriteFailed, format!("{name}: {e}"));
        }
        info!("Captured {url} to {}", target.display());
        CapabilityResponse::ok(json!({
            "path": self.captures.display_relative(&target),
            "bytes": text.len(),
        }))
    }

    fn record(&self, params: RecordParams) -> CapabilityResponse {
        let url = match self.policy.check_url(&params.url) {
            Ok(url) => url,
            Err(v) => return refused(v),
        };
        let id = uuid::Uuid::new_v4().to_string();
        self.recordings.write().insert(
            id.clone(),
            Recording {
                url: url.to_string(),
                started_at: Utc::now(),
            },
        );
        debug!("Recording {id} started for {url}");
        CapabilityResponse::ok(json!({ "recording_id": id, "state": "started" }))
    }

    fn stop(&self, params: StopParams) -> CapabilityResponse {
        match self.recordings.write().remove(&params.recording_id) {
            Some(recording) => {
                debug!("Recording {} stopped for {}", params.recording_id, recording.url);
                CapabilityResponse::ok(json!({
                    "recording_id": params.recording_id,
                    "state": "stopped",
                    "url": recording.url,
                }))
            }
            None => CapabilityResponse::fail(
                ErrorCode::NotFound,
                format!("no recording '{}'", params.recording_id),
            ),
        }
    }
}

fn too_large(len: u64) -> CapabilityResponse {
    CapabilityResponse::fail(
        ErrorCode::HttpFailed,
        format!("page too large ({len} bytes, limit is {MAX_PAGE_SIZE} bytes)"),
    )
}

fn denied(error: ContainmentError) -> CapabilityResponse {
    warn!("browser: {error}");
    CapabilityResponse::fail(ErrorCode::AccessDenied, error.to_string())
}

/// HTML is rendered to text; anything else is kept as lossy UTF-8.
fn render_text(content_type: &str, body: &[u8]) -> String {
    let ct = content_type.to_lowercase();
    if ct.contains("text/html") || ct.contains("application/xhtml") {
        html2text::from_read(body, TEXT_WIDTH)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

#[async_trait]
impl Capability for BrowserCapability {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Capture web pages as text files"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .action(
                Action::new("screenshot", "Capture a page as text")
                    .field("url", Field::required(FieldType::String, "http(s) URL"))
                    .field("path", Field::optional(FieldType::String, "Capture file, relative to the capture directory"))
                    .output("path", Field::required(FieldType::String, "Written file"))
                    .output("bytes", Field::required(FieldType::Integer, "Bytes written")),
            )
            .action(
                Action::new("record", "Start a recording session")
                    .field("url", Field::required(FieldType::String, "http(s) URL")),
            )
            .action(
                Action::new("stop", "End a recording session")
                    .field("recording_id", Field::required(FieldType::String, "Id returned by record")),
            )
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let meta = tokio::fs::metadata(self.captures.root()).await?;
        anyhow::ensure!(meta.is_dir(), "capture directory is not a directory");
        Ok(())
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        let response = match request.action.as_str() {
            "screenshot" => match request.params::<ScreenshotParams>() {
                Ok(params) => self.screenshot(params).await,
                Err(e) => e.into(),
            },
            "record" => match request.params::<RecordParams>() {
                Ok(params) => self.record(params),
                Err(e) => e.into(),
            },
            "stop" => match request.params::<StopParams>() {
                Ok(params) => self.stop(params),
                Err(e) => e.into(),
            },
            other => CapabilityResponse::fail(ErrorCode::InvalidAction, other),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{StubResponse, StubServer};
    use serde_json::Value;

    fn browser(dir: &Path, policy: HostPolicy) -> BrowserCapability {
        BrowserCapability::new(policy, dir).unwrap()
    }

    async fn call(browser: &BrowserCapability, action: &str, params: Value) -> CapabilityResponse {
        browser
            .invoke(&CapabilityRequest::new(action).with_params(params))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_screenshot_writes_rendered_text() {
        let dir = tempfile::tempdir().unwrap();
        let server = StubServer::fixed(StubResponse::text(
            200,
            "text/html; charset=utf-8",
            "<html><body><script>alert('x')</script><p>Hello capture</p></body></html>",
        ))
        .await
        .unwrap();
        let b = browser(dir.path(), HostPolicy::open());

        let response = call(&b, "screenshot", json!({"url": server.url(), "path": "shots/page.txt"})).await;
        assert!(response.is_success(), "{response:?}");
        assert_eq!(response.data().unwrap()["path"], "shots/page.txt");

        let written = std::fs::read_to_string(dir.path().join("shots/page.txt")).unwrap();
        assert!(written.contains("Hello capture"));
        assert!(!written.contains("alert"));
        assert_eq!(response.data().unwrap()["bytes"], written.len());
    }

    #[tokio::test]
    async fn test_screenshot_default_name() {
        let dir = tempfile::tempdir().unwrap();
        let server = StubServer::fixed(StubResponse::text(200, "text/plain", "plain"))
            .await
            .unwrap();
        let b = browser(dir.path(), HostPolicy::open());
        let response = call(&b, "screenshot", json!({"url": server.url()})).await;
        let path = response.data().unwrap()["path"].as_str().unwrap().to_string();
        assert!(path.starts_with("capture-") && path.ends_with(".txt"));
        assert_eq!(std::fs::read_to_string(dir.path().join(path)).unwrap(), "plain");
    }

    #[tokio::test]
    async fn test_screenshot_path_escape_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let b = browser(dir.path(), HostPolicy::open());
        let response = call(
            &b,
            "screenshot",
            json!({"url": "http://127.0.0.1:9/", "path": "../../etc/owned"}),
        )
        .await;
        assert_eq!(response.code(), Some(ErrorCode::AccessDenied));
    }

    #[tokio::test]
    async fn test_policy_applies_to_both_actions() {
        let dir = tempfile::tempdir().unwrap();
        let b = browser(dir.path(), HostPolicy::new(["docs.rs"], Vec::<String>::new()));
        let response = call(&b, "screenshot", json!({"url": "https://example.com/"})).await;
        assert_eq!(response.code(), Some(ErrorCode::Blocked));
        let response = call(&b, "record", json!({"url": "https://example.com/"})).await;
        assert_eq!(response.code(), Some(ErrorCode::Blocked));
        let response = call(&b, "record", json!({"url": "ftp://docs.rs/"})).await;
        assert_eq!(response.code(), Some(ErrorCode::InvalidUrl));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let server = StubServer::fixed(StubResponse::text(500, "text/plain", "boom"))
            .await
            .unwrap();
        let b = browser(dir.path(), HostPolicy::open());
        let response = call(&b, "screenshot", json!({"url": server.url()})).await;
        assert_eq!(response.code(), Some(ErrorCode::HttpFailed));
    }

    #[tokio::test]
    async fn test_record_returns_started() {
        let dir = tempfile::tempdir().unwrap();
        let b = browser(dir.path(), HostPolicy::open());
        let response = call(&b, "record", json!({"url": "https://docs.rs/"})).await;
        let data = response.data().unwrap();
        assert_eq!(data["state"], "started");
        let id = data["recording_id"].as_str().unwrap();
        assert_eq!(b.recording(id).unwrap().url, "https://docs.rs/");
    }

    #[tokio::test]
    async fn test_stop_forgets_the_recording() {
        let dir = tempfile::tempdir().unwrap();
        let b = browser(dir.path(), HostPolicy::open());
        let response = call(&b, "record", json!({"url": "https://docs.rs/"})).await;
        let id = response.data().unwrap()["recording_id"].as_str().unwrap().to_string();

        let response = call(&b, "stop", json!({"recording_id": id})).await;
        assert!(response.is_success(), "{response:?}");
        assert_eq!(response.data().unwrap()["state"], "stopped");
        assert!(b.recording(&id).is_none());

        let response = call(&b, "stop", json!({"recording_id": id})).await;
        assert_eq!(response.code(), Some(ErrorCode::NotFound));
        let response = call(&b, "stop", json!({})).await;
        assert_eq!(response.code(), Some(ErrorCode::InvalidParams));
    }

    #[tokio::test]
    async fn test_screenshot_overwrites_capture() {
        let dir = tempfile::tempdir().unwrap();
        let first = StubServer::fixed(StubResponse::text(200, "text/plain", "first"))
            .await
            .unwrap();
        let second = StubServer::fixed(StubResponse::text(200, "text/plain", "second"))
            .await
            .unwrap();
        let b = browser(dir.path(), HostPolicy::open());

        for server in [&first, &second] {
            let response = call(&b, "screenshot", json!({"url": server.url(), "path": "page.txt"})).await;
            assert!(response.is_success(), "{response:?}");
        }
        assert_eq!(std::fs::read_to_string(dir.path().join("page.txt")).unwrap(), "second");
    }

    #[test]
    fn test_render_text() {
        assert!(render_text("text/html", b"<p>Hi</p>").contains("Hi"));
        assert_eq!(render_text("application/json", b"{\"a\":1}"), "{\"a\":1}");
    }
}

//! `fs` capability: file access confined to one root directory.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    Action, Capability, CapabilityRequest, CapabilityResponse, ErrorCode, Field, FieldType, Schema,
};
use crate::policy::{ContainmentError, PathJail};

/// Largest file `read` returns (8 MB).
const MAX_READ_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
struct WriteParams {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct CopyParams {
    src: String,
    dst: String,
}

pub struct FsCapability {
    jail: PathJail,
}

impl FsCapability {
    /// Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let jail = PathJail::new(root)?;
        debug!("fs capability rooted at {}", jail.root().display());
        Ok(Self { jail })
    }

    pub fn root(&self) -> &Path {
        self.jail.root()
    }

    async fn read(&self, params: PathParams) -> CapabilityResponse {
        let path = match self.jail.resolve(&params.path).await {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > MAX_READ_SIZE => {
                return CapabilityResponse::fail(
                    ErrorCode::ReadFailed,
                    format!(
                        "{} is too large ({} bytes, limit is {MAX_READ_SIZE} bytes)",
                        params.path,
                        meta.len()
                    ),
                )
            }
            Ok(meta) if meta.is_dir() => {
                return CapabilityResponse::fail(
                    ErrorCode::ReadFailed,
                    format!("{} is a directory", params.path),
                )
            }
            _ => {}
        }
        match tokio::fs::read(&path).await {
            Ok(bytes) => CapabilityResponse::ok(json!({
                "path": self.jail.display_relative(&path),
                "content": String::from_utf8_lossy(&bytes),
                "bytes": bytes.len(),
            })),
            Err(e) => CapabilityResponse::fail(ErrorCode::ReadFailed, format!("{}: {e}", params.path)),
        }
    }

    async fn write(&self, params: WriteParams) -> CapabilityResponse {
        let path = match self.jail.resolve(&params.path).await {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return CapabilityResponse::fail(
                    ErrorCode::WriteFailed,
                    format!("{}: cannot create parent: {e}", params.path),
                );
            }
        }
        match tokio::fs::write(&path, params.content.as_bytes()).await {
            Ok(()) => {
                debug!("fs: wrote {} bytes to {}", params.content.len(), path.display());
                CapabilityResponse::ok(json!({
                    "path": self.jail.display_relative(&path),
                    "bytes": params.content.len(),
                }))
            }
            Err(e) => CapabilityResponse::fail(ErrorCode::WriteFailed, format!("{}: {e}", params.path)),
        }
    }

    async fn copy(&self, params: CopyParams) -> CapabilityResponse {
        let src = match self.jail.resolve(&params.src).await {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let dst = match self.jail.resolve(&params.dst).await {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        if let Some(parent) = dst.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return CapabilityResponse::fail(
                    ErrorCode::CopyFailed,
                    format!("{}: cannot create parent: {e}", params.dst),
                );
            }
        }
        match tokio::fs::copy(&src, &dst).await {
            Ok(bytes) => CapabilityResponse::ok(json!({
                "src": self.jail.display_relative(&src),
                "dst": self.jail.display_relative(&dst),
                "bytes": bytes,
            })),
            Err(e) => CapabilityResponse::fail(
                ErrorCode::CopyFailed,
                format!("{} -> {}: {e}", params.src, params.dst),
            ),
        }
    }

    async fn list(&self, params: PathParams) -> CapabilityResponse {
        let path = match self.jail.resolve(&params.path).await {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) => return CapabilityResponse::fail(ErrorCode::ReadFailed, format!("{}: {e}", params.path)),
        };
        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        name.push('/');
                    }
                    names.push(name);
                }
                Ok(None) => break,
                Err(e) => {
                    return CapabilityResponse::fail(ErrorCode::ReadFailed, format!("{}: {e}", params.path))
                }
            }
        }
        names.sort();
        CapabilityResponse::ok(json!({ "entries": names }))
    }
}

fn denied(error: ContainmentError) -> CapabilityResponse {
    match error {
        ContainmentError::EmptyPath => CapabilityResponse::fail(ErrorCode::MissingPath, error.to_string()),
        other => {
            warn!("fs: {other}");
            CapabilityResponse::fail(ErrorCode::AccessDenied, other.to_string())
        }
    }
}

#[async_trait]
impl Capability for FsCapability {
    fn name(&self) -> &str {
        "fs"
    }

    fn description(&self) -> &str {
        "Read, write, copy and list files under a confined root directory"
    }

    fn schema(&self) -> Schema {
        let path = || Field::required(FieldType::String, "Path relative to the root");
        Schema::new()
            .action(Action::new("read", "Read a file as text").field("path", path()))
            .action(
                Action::new("write", "Write a file, creating parent directories")
                    .field("path", path())
                    .field("content", Field::required(FieldType::String, "File content")),
            )
            .action(
                Action::new("copy", "Copy a file")
                    .field("src", path())
                    .field("dst", path()),
            )
            .action(Action::new("list", "List a directory").field("path", path()))
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let meta = tokio::fs::metadata(self.jail.root()).await?;
        anyhow::ensure!(meta.is_dir(), "{} is not a directory", self.jail.root().display());
        Ok(())
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        let response = match request.action.as_str() {
            "read" => match request.params() {
                Ok(p) => self.read(p).await,
                Err(e) => e.into(),
            },
            "write" => match request.params() {
                Ok(p) => self.write(p).await,
                Err(e) => e.into(),
            },
            "copy" => match request.params() {
                Ok(p) => self.copy(p).await,
                Err(e) => e.into(),
            },
            "list" => match request.params() {
                Ok(p) => self.list(p).await,
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
    use serde_json::{json, Value};

    fn setup() -> (tempfile::TempDir, FsCapability) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsCapability::new(dir.path().join("root")).unwrap();
        (dir, fs)
    }

    async fn call(fs: &FsCapability, action: &str, params: Value) -> CapabilityResponse {
        fs.invoke(&CapabilityRequest::new(action).with_params(params))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, fs) = setup();
        let written = call(&fs, "write", json!({"path": "notes/a.txt", "content": "hello"})).await;
        assert!(written.is_success());
        assert_eq!(written.data().unwrap()["path"], "notes/a.txt");

        let read = call(&fs, "read", json!({"path": "notes/a.txt"})).await;
        assert!(read.is_success());
        assert_eq!(read.data().unwrap()["content"], "hello");
        assert_eq!(read.data().unwrap()["bytes"], 5);
    }

    #[tokio::test]
    async fn test_overwrite_existing_file() {
        let (_dir, fs) = setup();
        assert!(call(&fs, "write", json!({"path": "a.txt", "content": "first"})).await.is_success());
        let again = call(&fs, "write", json!({"path": "a.txt", "content": "second"})).await;
        assert!(again.is_success(), "{:?}", again.error());

        let read = call(&fs, "read", json!({"path": "a.txt"})).await;
        assert_eq!(read.data().unwrap()["content"], "second");
    }

    #[tokio::test]
    async fn test_traversal_is_denied() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("secret.txt"), "s3cret").unwrap();

        let response = call(&fs, "read", json!({"path": "../secret.txt"})).await;
        assert_eq!(response.code(), Some(ErrorCode::AccessDenied));

        let response = call(&fs, "write", json!({"path": "a/../../x.txt", "content": "x"})).await;
        assert_eq!(response.code(), Some(ErrorCode::AccessDenied));
        assert!(!dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_absolute_paths_are_rerooted() {
        let (_dir, fs) = setup();
        let response = call(&fs, "write", json!({"path": "/etc/passwd", "content": "root"})).await;
        assert!(response.is_success());
        assert!(fs.root().join("etc/passwd").is_file());
    }

    #[tokio::test]
    async fn test_empty_path_is_missing_path() {
        let (_dir, fs) = setup();
        let response = call(&fs, "read", json!({"path": ""})).await;
        assert_eq!(response.code(), Some(ErrorCode::MissingPath));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let (_dir, fs) = setup();
        let response = call(&fs, "read", json!({"path": "nope.txt"})).await;
        assert_eq!(response.code(), Some(ErrorCode::ReadFailed));
    }

    #[tokio::test]
    async fn test_copy() {
        let (_dir, fs) = setup();
        call(&fs, "write", json!({"path": "src.txt", "content": "data"})).await;
        let response = call(&fs, "copy", json!({"src": "src.txt", "dst": "deep/dst.txt"})).await;
        assert!(response.is_success());
        assert_eq!(response.data().unwrap()["bytes"], 4);
        assert_eq!(std::fs::read_to_string(fs.root().join("deep/dst.txt")).unwrap(), "data");

        let response = call(&fs, "copy", json!({"src": "missing.txt", "dst": "b.txt"})).await;
        assert_eq!(response.code(), Some(ErrorCode::CopyFailed));

        let response = call(&fs, "copy", json!({"src": "src.txt", "dst": "../../b.txt"})).await;
        assert_eq!(response.code(), Some(ErrorCode::AccessDenied));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (_dir, fs) = setup();
        for name in ["b.txt", "a.txt", "sub/c.txt"] {
            call(&fs, "write", json!({"path": name, "content": ""})).await;
        }
        let response = call(&fs, "list", json!({"path": "."})).await;
        assert_eq!(response.data().unwrap()["entries"], json!(["a.txt", "b.txt", "sub/"]));
    }

    #[tokio::test]
    async fn test_schema_rejects_missing_content() {
        let (_dir, fs) = setup();
        let response = call(&fs, "write", json!({"path": "a.txt"})).await;
        assert_eq!(response.code(), Some(ErrorCode::InvalidParams));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_denied() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("outside.txt"), "s3cret").unwrap();
        std::os::unix::fs::symlink(dir.path().join("outside.txt"), fs.root().join("link.txt")).unwrap();
        let response = call(&fs, "read", json!({"path": "link.txt"})).await;
        assert_eq!(response.code(), Some(ErrorCode::AccessDenied));
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, fs) = setup();
        fs.health_check().await.unwrap();
    }
}

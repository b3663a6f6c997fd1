//! Confines caller-supplied paths to one root directory.

use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ContainmentError {
    #[error("path is required")]
    EmptyPath,

    #[error("path '{0}' escapes the root")]
    Escapes(String),

    #[error("cannot prepare root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot inspect '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// A canonical root directory that every resolved path must stay under.
///
/// Input paths are always interpreted relative to the root: absolute
/// inputs are re-rooted, `..` is resolved lexically, and symlinks are
/// followed so a link pointing outside the root is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathJail {
    root: PathBuf,
}

impl PathJail {
    /// Creates `root` if missing and canonicalizes it once.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ContainmentError> {
        let root = root.as_ref();
        let prepare = || -> io::Result<PathBuf> {
            std::fs::create_dir_all(root)?;
            root.canonicalize()
        };
        let canonical = prepare().map_err(|source| ContainmentError::Root {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps `input` to a real path under the root.
    pub async fn resolve(&self, input: &str) -> Result<PathBuf, ContainmentError> {
        let lexical = self.lexical(input)?;

        // Walk up to the deepest entry that exists and check where it really points.
        for ancestor in lexical.ancestors() {
            match tokio::fs::symlink_metadata(ancestor).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(ContainmentError::Io {
                        path: input.to_string(),
                        source,
                    })
                }
            }
            // Exists but cannot be canonicalized: a dangling symlink.
            let real = tokio::fs::canonicalize(ancestor)
                .await
                .map_err(|_| ContainmentError::Escapes(input.to_string()))?;
            if !real.starts_with(&self.root) {
                return Err(ContainmentError::Escapes(input.to_string()));
            }
            let rest = lexical
                .strip_prefix(ancestor)
                .map_err(|_| ContainmentError::Escapes(input.to_string()))?;
            if rest.as_os_str().is_empty() {
                return Ok(real);
            }
            return Ok(real.join(rest));
        }
        Err(ContainmentError::Escapes(input.to_string()))
    }

    /// Joins and normalizes `input` without touching the filesystem.
    pub fn lexical(&self, input: &str) -> Result<PathBuf, ContainmentError> {
        if input.trim().is_empty() {
            return Err(ContainmentError::EmptyPath);
        }
        let relative: PathBuf = Path::new(input)
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();
        let joined = PathBuf::from(path_clean::clean(self.root.join(relative)));
        if !joined.starts_with(&self.root) {
            return Err(ContainmentError::Escapes(input.to_string()));
        }
        Ok(joined)
    }

    /// `path` relative to the root, for display.
    pub fn display_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

use async_trait::async_trait;

use super::{SecretError, SecretResolver};

/// Resolves `env://NAME` from the host environment.
///
/// An unset variable resolves to `""` unless `strict` is set, in which
/// case it is `SecretError::NotFound`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvResolver {
    strict: bool,
}

impl EnvResolver {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

#[async_trait]
impl SecretResolver for EnvResolver {
    fn scheme(&self) -> &str {
        "env"
    }

    async fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        let reference = reference.trim();
        let name = reference.strip_prefix("env://").unwrap_or(reference);
        if name.is_empty() || name.contains('=') || name.contains('\0') {
            return Err(SecretError::InvalidReference(reference.to_string()));
        }
        match std::env::var(name) {
            Ok(value) => Ok(value),
            Err(_) if self.strict => Err(SecretError::NotFound(reference.to_string())),
            Err(_) => Ok(String::new()),
        }
    }
}

//! Access control.
//!
//! Mutating methods are doubly gated: the server must permit them at
//! all (`--allow-put`, `--allow-delete`; violations are 405), and when
//! an authenticator is configured the request must carry a valid
//! bearer token (violations are 401).
//!
//! Token validation is a collaborator behind the [`Authenticator`]
//! seam. The file-backed implementation accepts a fixed token set; an
//! OIDC validator plugs in behind the same trait.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{ServerError, ServerResult};

/// Which mutating methods this server permits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Permissions {
    pub allow_put: bool,
    pub allow_delete: bool,
}

impl Permissions {
    pub fn require_put(&self) -> ServerResult<()> {
        if self.allow_put {
            Ok(())
        } else {
            Err(ServerError::NotPermitted)
        }
    }

    pub fn require_delete(&self) -> ServerResult<()> {
        if self.allow_delete {
            Ok(())
        } else {
            Err(ServerError::NotPermitted)
        }
    }
}

/// Validates bearer tokens on mutating requests.
pub trait Authenticator: Send + Sync + fmt::Debug {
    fn validate(&self, token: &str) -> bool;
}

/// Accepts the tokens listed in a file, one per line.
pub struct TokenFileAuthenticator {
    tokens: HashSet<String>,
}

impl TokenFileAuthenticator {
    /// Loads the token file. Blank lines and `#` comments are skipped.
    pub async fn load(path: &Path) -> ServerResult<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            ServerError::StorageError(anyhow::anyhow!(
                "Failed to read token file {}: {}",
                path.display(),
                e
            ))
        })?;

        let tokens = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        Ok(Self { tokens })
    }
}

impl Authenticator for TokenFileAuthenticator {
    fn validate(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

impl fmt::Debug for TokenFileAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never leak the tokens
        f.debug_struct("TokenFileAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions() {
        let none = Permissions::default();
        none.require_put().unwrap_err();
        none.require_delete().unwrap_err();

        let put_only = Permissions {
            allow_put: true,
            allow_delete: false,
        };
        put_only.require_put().unwrap();
        put_only.require_delete().unwrap_err();
    }

    #[tokio::test]
    async fn test_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens");
        tokio::fs::write(&path, "# deploy tokens\nsecret-a\n\n  secret-b  \n")
            .await
            .unwrap();

        let authenticator = TokenFileAuthenticator::load(&path).await.unwrap();
        assert!(authenticator.validate("secret-a"));
        assert!(authenticator.validate("secret-b"));
        assert!(!authenticator.validate("# deploy tokens"));
        assert!(!authenticator.validate(""));
        assert!(!authenticator.validate("secret-c"));
    }
}

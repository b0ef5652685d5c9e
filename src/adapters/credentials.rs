//! Credentials handed to remotely configurable processes.

use std::fmt;

use anyhow::Result;
use uuid::Uuid;

/// Secret shared between the operator and one child process
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Issues credentials for the remote configuration channel
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, program_id: &str) -> Result<Credentials>;
}

/// Issues a random bearer token per process
#[derive(Debug, Default)]
pub struct TokenIssuer;

impl CredentialIssuer for TokenIssuer {
    fn issue(&self, _program_id: &str) -> Result<Credentials> {
        Ok(Credentials {
            token: Uuid::new_v4().simple().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let issuer = TokenIssuer;
        let a = issuer.issue("long--1.0").unwrap();
        let b = issuer.issue("long--1.0").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.token.len(), 32);
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials {
            token: "secret".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}

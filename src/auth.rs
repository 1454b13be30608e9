//! Credential verification for the inbound side of the relay.
//!
//! The [`Authenticator`] trait is the seam external providers (LDAP, PAM,
//! REST, ...) plug into; the bastion itself ships the [`LocalAuthenticator`]
//! backed by the user table of the configuration. Public-key verification is
//! not behind the trait: authorized keys always come from the user table and
//! are compared right in the server's auth callback.

use crate::config;
use async_trait::async_trait;
use russh::keys::PublicKey;
use std::fmt;

/// The error returned by authenticators. The transport layer closes the
/// connection; the reason only ever reaches the logs.
#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    /// Unknown username.
    #[error("user not found")]
    BadUser,
    /// The presented password did not match.
    #[error("bad password")]
    BadPassword,
    /// The user record carries no usable credential source.
    #[error("user has no authorized keys specified")]
    NoKeys,
    /// An authorized-keys source exists but could not be used.
    #[error("error while processing authorized keys: {0}")]
    BadKeySource(String),
}

/// Verifies a username/password pair against some credential store.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Check `password` for `username`. `Ok(())` means authenticated.
    async fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthenticationError>;
}

/// Password verification against the `users:` table of the configuration.
#[derive(Debug)]
pub struct LocalAuthenticator {
    users: std::collections::HashMap<String, config::User>,
}

impl LocalAuthenticator {
    /// Build the authenticator from the resolved configuration.
    pub fn new(config: &config::Config) -> Self {
        LocalAuthenticator {
            users: config.users.clone(),
        }
    }
}

#[async_trait]
impl Authenticator for LocalAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthenticationError> {
        let user = self.users.get(username).ok_or(AuthenticationError::BadUser)?;
        match user.password.as_deref() {
            Some(expected) if expected == password => Ok(()),
            _ => Err(AuthenticationError::BadPassword),
        }
    }
}

/// Resolve the authorized public keys of a user record: the inline
/// `authorized_key` line when present, otherwise every key line of
/// `authorized_keys_file`. A record with neither is an error, as is any
/// line that does not parse — a malformed allow-list must deny, not shrink.
pub fn authorized_keys(user: &config::User) -> Result<Vec<PublicKey>, AuthenticationError> {
    if let Some(line) = user.authorized_key.as_deref() {
        return Ok(vec![parse_key_line(line)?]);
    }
    if let Some(path) = user.authorized_keys_file.as_deref() {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AuthenticationError::BadKeySource(e.to_string()))?;
        let mut keys = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            keys.push(parse_key_line(line)?);
        }
        if keys.is_empty() {
            return Err(AuthenticationError::NoKeys);
        }
        return Ok(keys);
    }
    Err(AuthenticationError::NoKeys)
}

fn parse_key_line(line: &str) -> Result<PublicKey, AuthenticationError> {
    PublicKey::from_openssh(line.trim()).map_err(|e| AuthenticationError::BadKeySource(e.to_string()))
}

/// Compare an offered key against an allow-list the way the SSH protocol
/// does: key type and marshaled key data both have to match.
pub fn key_matches(offered: &PublicKey, candidates: &[PublicKey]) -> bool {
    candidates
        .iter()
        .any(|k| k.algorithm() == offered.algorithm() && k.key_data() == offered.key_data())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::User;

    fn user(password: Option<&str>) -> User {
        User {
            acl: "admins".to_string(),
            authorized_key: None,
            authorized_keys_file: None,
            password: password.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn local_authenticator_matches_table_entries() {
        let mut users = std::collections::HashMap::new();
        users.insert("alice".to_string(), user(Some("wonderland")));
        users.insert("bob".to_string(), user(None));
        let auth = LocalAuthenticator { users };

        assert!(auth.authenticate("alice", "wonderland").await.is_ok());
        assert!(matches!(
            auth.authenticate("alice", "oxford").await,
            Err(AuthenticationError::BadPassword)
        ));
        // A user without a password cannot use password auth at all.
        assert!(matches!(
            auth.authenticate("bob", "").await,
            Err(AuthenticationError::BadPassword)
        ));
        assert!(matches!(
            auth.authenticate("mallory", "x").await,
            Err(AuthenticationError::BadUser)
        ));
    }

    #[test]
    fn user_without_key_sources_is_denied() {
        assert!(matches!(
            authorized_keys(&user(None)),
            Err(AuthenticationError::NoKeys)
        ));
    }

    #[test]
    fn malformed_inline_key_is_an_error() {
        let mut u = user(None);
        u.authorized_key = Some("not-a-key".to_string());
        assert!(matches!(
            authorized_keys(&u),
            Err(AuthenticationError::BadKeySource(_))
        ));
    }
}

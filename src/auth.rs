//! Credential verification for SOCKS5 and SSH authentication.
//!
//! Dispatchers hold a [`Verifier`] trait object; the two implementations are
//! backed by an inline username→password map and by an htpasswd file. Stored
//! values may be plain passwords or htpasswd-style hashes; the hash algorithm
//! is picked from the stored prefix.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use constant_time_eq::constant_time_eq;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Checks a username/password pair against configured credentials.
pub trait Verifier: Send + Sync {
    /// Returns true when the pair is acceptable.
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Compare a presented password against a stored entry.
///
/// `$2*$` entries are bcrypt, `{SHA}` entries are base64(SHA-1), anything
/// else is a plain password compared in constant time.
fn verify_password(stored: &str, given: &str) -> bool {
    if stored.starts_with("$2") {
        bcrypt::verify(given, stored).unwrap_or(false)
    } else if let Some(hash) = stored.strip_prefix("{SHA}") {
        let digest = Sha1::digest(given.as_bytes());
        match BASE64.decode(hash) {
            Ok(expected) => constant_time_eq(digest.as_slice(), &expected),
            Err(_) => false,
        }
    } else {
        constant_time_eq(stored.as_bytes(), given.as_bytes())
    }
}

/// Verifier backed by an inline username→password map.
pub struct MapVerifier {
    users: HashMap<String, String>,
}

impl MapVerifier {
    /// Create a verifier from a username→password map.
    pub fn new(users: HashMap<String, String>) -> Self {
        MapVerifier { users }
    }
}

impl Verifier for MapVerifier {
    fn verify(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(stored) => verify_password(stored, password),
            None => false,
        }
    }
}

/// Verifier backed by an Apache htpasswd file.
pub struct HtpasswdVerifier {
    users: HashMap<String, String>,
}

impl HtpasswdVerifier {
    /// Load `user:hash` entries from an htpasswd file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "cannot read htpasswd file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        let mut users = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, stored) = line.split_once(':').ok_or_else(|| {
                Error::config(format!("htpasswd line {} has no colon", lineno + 1))
            })?;
            users.insert(user.to_string(), stored.to_string());
        }
        Ok(HtpasswdVerifier { users })
    }
}

impl Verifier for HtpasswdVerifier {
    fn verify(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(stored) => verify_password(stored, password),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_password() {
        assert!(verify_password("s3cret", "s3cret"));
        assert!(!verify_password("s3cret", "wrong"));
        assert!(!verify_password("s3cret", ""));
    }

    #[test]
    fn test_sha_password() {
        // {SHA} of "password"
        let stored = "{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=";
        assert!(verify_password(stored, "password"));
        assert!(!verify_password(stored, "Password"));
    }

    #[test]
    fn test_bcrypt_password() {
        let stored = bcrypt::hash("hunter2", 4).unwrap();
        assert!(verify_password(&stored, "hunter2"));
        assert!(!verify_password(&stored, "hunter3"));
    }

    #[test]
    fn test_map_verifier() {
        let v = MapVerifier::new(
            [("alice".to_string(), "s3cret".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(v.verify("alice", "s3cret"));
        assert!(!v.verify("alice", "nope"));
        assert!(!v.verify("bob", "s3cret"));
    }

    #[test]
    fn test_htpasswd_parse() {
        let v = HtpasswdVerifier::parse(
            "# comment\n\
             alice:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=\n\
             \n\
             bob:plainpass\n",
        )
        .unwrap();
        assert!(v.verify("alice", "password"));
        assert!(v.verify("bob", "plainpass"));
        assert!(!v.verify("carol", "anything"));
    }

    #[test]
    fn test_htpasswd_rejects_malformed_line() {
        assert!(HtpasswdVerifier::parse("no-colon-here\n").is_err());
    }
}

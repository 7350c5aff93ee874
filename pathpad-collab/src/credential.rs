//! Salted password hashes for document write/read tiers.
//!
//! Hashes are Argon2id PHC strings, so the salt and cost parameters travel
//! with the record and verification never needs the hasher's settings.

use std::fmt;

use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Salt length in bytes.
const SALT_LEN: usize = 16;

/// Hashing failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid hash parameters: {0}")]
    Params(String),

    #[error("hashing failed: {0}")]
    Hash(String),
}

/// Stored password hash (PHC string). Debug output never shows it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential(String);

impl Credential {
    /// Check a candidate password. Malformed records never verify.
    pub fn verify(&self, candidate: &str) -> bool {
        match PasswordHash::new(&self.0) {
            Ok(parsed) => Argon2::default()
                .verify_password(candidate.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                log::warn!("Unreadable password hash record: {e}");
                false
            }
        }
    }

    pub fn as_phc(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Argon2id hasher with fixed cost parameters.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

impl CredentialHasher {
    /// Cheap parameters for tests.
    pub fn for_testing() -> Self {
        Self {
            m_cost: 256,
            t_cost: 1,
            p_cost: 1,
        }
    }

    pub fn hash(&self, password: &str) -> Result<Credential, CredentialError> {
        let params = Params::new(self.m_cost, self.t_cost, self.p_cost, None)
            .map_err(|e| CredentialError::Params(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut salt_bytes = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| CredentialError::Hash(e.to_string()))?;

        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CredentialError::Hash(e.to_string()))?;
        Ok(Credential(hash.to_string()))
    }
}

/// True for `None`, empty and whitespace-only passwords.
pub fn is_blank(password: Option<&str>) -> bool {
    password.map_or(true, |p| p.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = CredentialHasher::for_testing();
        let cred = hasher.hash("abc123").unwrap();
        assert!(cred.verify("abc123"));
        assert!(!cred.verify("abc124"));
        assert!(!cred.verify(""));
    }

    #[test]
    fn test_salts_differ() {
        let hasher = CredentialHasher::for_testing();
        let a = hasher.hash("same").unwrap();
        let b = hasher.hash("same").unwrap();
        assert_ne!(a, b);
        assert!(a.as_phc().starts_with("$argon2id$"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let cred = CredentialHasher::for_testing().hash("secret").unwrap();
        assert_eq!(format!("{cred:?}"), "Credential(..)");
    }

    #[test]
    fn test_malformed_record_never_verifies() {
        let cred = Credential("not-a-phc-string".into());
        assert!(!cred.verify("anything"));
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(None));
        assert!(is_blank(Some("")));
        assert!(is_blank(Some("   ")));
        assert!(!is_blank(Some("x")));
    }
}

//! Credential hashing and input policy checks.
//!
//! Passwords are hashed with Argon2id into PHC strings and never stored or
//! logged in plaintext.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{CoreError, CoreResult};

/// Argon2id PHC string. `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialHash(String);

impl CredentialHash {
    pub(crate) fn from_stored(phc: String) -> Self {
        CredentialHash(phc)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `Ok(true)` on match, `Ok(false)` on mismatch, error if the stored
    /// hash is malformed.
    pub fn verify(&self, password: &str) -> CoreResult<bool> {
        let parsed = PasswordHash::new(&self.0)
            .map_err(|e| CoreError::Storage(format!("invalid credential hash: {e}")))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(CoreError::Storage(format!("credential verify error: {e}"))),
        }
    }
}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialHash([redacted])")
    }
}

pub fn hash_password(password: &str) -> CoreResult<CredentialHash> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| CoreError::Storage(format!("password hashing failed: {e}")))?;
    Ok(CredentialHash(hash.to_string()))
}

/// At least `min_length` characters, one uppercase letter and one digit.
pub fn is_strong_password(password: &str, min_length: usize) -> bool {
    password.chars().count() >= min_length
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
}

/// `local@domain.tld`: local part of `[A-Za-z0-9._%+-]`, domain of
/// `[A-Za-z0-9.-]`, alphabetic TLD of two or more letters.
static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("Invalid email regex")
});

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

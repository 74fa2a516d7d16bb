//! API key secret hashing and verification.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::errors::Error;

/// Argon2 hashing parameters.
#[derive(Debug, Clone, Copy)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Params {
    fn to_argon2(self) -> Result<Argon2<'static>, Error> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None).map_err(|e| Error::Internal {
            operation: format!("create argon2 params: {e}"),
        })?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for Argon2Params {
    /// Secure defaults for production (Argon2id RFC recommendations)
    fn default() -> Self {
        Self {
            memory_kib: 19456, // 19 MB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Hash an API key secret with Argon2id.
pub fn hash_secret(secret: &str) -> Result<String, Error> {
    hash_secret_with_params(secret, None)
}

pub fn hash_secret_with_params(secret: &str, params: Option<Argon2Params>) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = params.unwrap_or_default().to_argon2()?;

    let hash = argon2.hash_password(secret.as_bytes(), &salt).map_err(|e| Error::Internal {
        operation: format!("hash secret: {e}"),
    })?;

    Ok(hash.to_string())
}

/// Verify a presented secret against its stored hash.
///
/// Argon2 verification is constant-time over the derived output; parameters
/// are read from the hash itself.
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool, Error> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| Error::Internal {
        operation: format!("parse hash: {e}"),
    })?;

    let argon2 = Argon2::default();
    Ok(argon2.verify_password(secret.as_bytes(), &parsed_hash).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Low-cost params so the test suite stays fast.
    fn fast_params() -> Option<Argon2Params> {
        Some(Argon2Params {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
    }

    #[test]
    fn test_secret_hash_verify() {
        let hash = hash_secret_with_params("sekrit-token", fast_params()).unwrap();
        assert!(!hash.is_empty());
        assert!(verify_secret("sekrit-token", &hash).unwrap());
        assert!(!verify_secret("wrong-token", &hash).unwrap());
    }

    #[test]
    fn test_same_secret_different_hashes() {
        let hash1 = hash_secret_with_params("same", fast_params()).unwrap();
        let hash2 = hash_secret_with_params("same", fast_params()).unwrap();
        assert_ne!(hash1, hash2);
        assert!(verify_secret("same", &hash1).unwrap());
        assert!(verify_secret("same", &hash2).unwrap());
    }

    #[test]
    fn test_garbage_hash_is_an_error() {
        assert!(verify_secret("anything", "not-a-phc-string").is_err());
    }
}

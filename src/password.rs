use crate::error::{AuthError, Result};
use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use async_trait::async_trait;
use std::fmt;

/// PHC-formatted password hash
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub fn from_phc(phc: String) -> Self {
        Self(phc)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(<redacted>)")
    }
}

/// Hashing of clear secrets (user passwords, oauth client secrets)
#[async_trait]
pub trait PasswordService: Send + Sync {
    async fn hash(&self, clear: &str) -> Result<PasswordHash>;
    async fn verify(&self, clear: &str, hash: &PasswordHash) -> Result<bool>;
}

/// Argon2id on the blocking pool
#[derive(Debug, Clone)]
pub struct Argon2PasswordService {
    params: Params,
}

impl Argon2PasswordService {
    /// OWASP minimum: m=19456 KiB, t=2, p=1
    pub fn new() -> Self {
        Self {
            params: Params::DEFAULT,
        }
    }

    /// Custom cost, e.g. the cheapest legal params in tests
    pub fn with_cost(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self> {
        let params = Params::new(m_cost, t_cost, p_cost, None)
            .map_err(|e| AuthError::Internal(format!("invalid argon2 params: {}", e)))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2PasswordService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasswordService for Argon2PasswordService {
    async fn hash(&self, clear: &str) -> Result<PasswordHash> {
        let argon2 = self.argon2();
        let clear = clear.to_string();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(clear.as_bytes(), &salt)
                .map(|h| PasswordHash(h.to_string()))
                .map_err(|e| AuthError::Internal(format!("password hashing failed: {}", e)))
        })
        .await
        .map_err(|e| AuthError::Internal(format!("hashing task failed: {}", e)))?
    }

    async fn verify(&self, clear: &str, hash: &PasswordHash) -> Result<bool> {
        let clear = clear.to_string();
        let phc = hash.0.clone();
        tokio::task::spawn_blocking(move || {
            let parsed = argon2::PasswordHash::new(&phc)
                .map_err(|e| AuthError::Internal(format!("stored hash is corrupt: {}", e)))?;
            // params come from the hash itself, so older costs keep verifying
            Ok(Argon2::default()
                .verify_password(clear.as_bytes(), &parsed)
                .is_ok())
        })
        .await
        .map_err(|e| AuthError::Internal(format!("verification task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_then_verify() {
        let passwords = Argon2PasswordService::with_cost(8, 1, 1).unwrap();
        let hash = passwords.hash("hunter2").await.unwrap();

        assert!(hash.as_str().starts_with("$argon2id$"));
        assert!(passwords.verify("hunter2", &hash).await.unwrap());
        assert!(!passwords.verify("hunter3", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_hash_is_an_error() {
        let passwords = Argon2PasswordService::with_cost(8, 1, 1).unwrap();
        let bogus = PasswordHash::from_phc("not-a-phc-string".to_string());
        assert!(matches!(
            passwords.verify("x", &bogus).await,
            Err(AuthError::Internal(_))
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let hash = PasswordHash::from_phc("$argon2id$secret".to_string());
        assert!(!format!("{:?}", hash).contains("secret"));
    }
}

use crate::domain::DomainResult;

/// Trait for password hashing and verification
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait PasswordService: Send + Sync {
    /// Hash a plaintext password into a PHC string
    fn hash_password(&self, password: &str) -> DomainResult<String>;

    /// Verify a password against a PHC hash
    fn verify_password(&self, password: &str, hash: &str) -> DomainResult<bool>;
}

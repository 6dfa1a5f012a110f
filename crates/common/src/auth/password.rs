use crate::auth::PasswordService;
use crate::domain::{DomainError, DomainResult};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use std::ops::RangeInclusive;

/// Length bounds for a charge point basic-auth password (OCPP security profile 1).
pub const CHARGE_POINT_PASSWORD_LEN: RangeInclusive<usize> = 16..=40;

/// Argon2id hashing for charge point basic-auth passwords.
///
/// Hashes are stored as PHC strings next to the charge point record. Only
/// passwords a charge point could legally present are hashed; verification of
/// an out-of-range password fails without touching Argon2.
#[derive(Default)]
pub struct Argon2PasswordService;

impl Argon2PasswordService {
    pub fn new() -> Self {
        Self
    }
}

fn has_valid_length(password: &str) -> bool {
    CHARGE_POINT_PASSWORD_LEN.contains(&password.chars().count())
}

impl PasswordService for Argon2PasswordService {
    fn hash_password(&self, password: &str) -> DomainResult<String> {
        if !has_valid_length(password) {
            return Err(DomainError::InvalidPassword(format!(
                "charge point passwords must be {} to {} characters",
                CHARGE_POINT_PASSWORD_LEN.start(),
                CHARGE_POINT_PASSWORD_LEN.end()
            )));
        }
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| DomainError::PasswordHashingError(e.to_string()))
    }

    fn verify_password(&self, password: &str, hash: &str) -> DomainResult<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| DomainError::PasswordHashingError(e.to_string()))?;
        if !has_valid_length(password) {
            return Ok(false);
        }

        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHORIZATION_KEY: &str = "0123456789abcdef";

    #[test]
    fn test_provisioned_key_hashes_to_phc_string() {
        let service = Argon2PasswordService::new();
        let hash = service.hash_password(AUTHORIZATION_KEY).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert_ne!(hash, service.hash_password(AUTHORIZATION_KEY).unwrap());
    }

    #[test]
    fn test_key_outside_length_bounds_is_not_hashed() {
        let service = Argon2PasswordService::new();
        for key in ["short", &"k".repeat(41)] {
            let result = service.hash_password(key);
            assert!(matches!(result, Err(DomainError::InvalidPassword(_))), "{key}");
        }
        assert!(service.hash_password(&"k".repeat(40)).is_ok());
    }

    #[test]
    fn test_charge_point_presenting_its_key_is_verified() {
        let service = Argon2PasswordService::new();
        let hash = service.hash_password(AUTHORIZATION_KEY).unwrap();
        assert!(service.verify_password(AUTHORIZATION_KEY, &hash).unwrap());
        assert!(!service.verify_password("fedcba9876543210", &hash).unwrap());
        assert!(!service.verify_password("guess", &hash).unwrap());
    }

    #[test]
    fn test_corrupt_stored_hash_is_error() {
        let service = Argon2PasswordService::new();
        let result = service.verify_password(AUTHORIZATION_KEY, "plaintext-not-a-hash");
        assert!(matches!(result, Err(DomainError::PasswordHashingError(_))));
    }
}

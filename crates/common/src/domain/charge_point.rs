use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Registry entry for a provisioned charge point.
///
/// Rows are written by the device lifecycle sync and are read-only for the
/// gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargePointRecord {
    pub charge_point_id: String,
    pub status: ChargePointStatus,
    /// Argon2 PHC hash of the basic-auth password, if the charge point uses one
    pub password_hash: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChargePointRecord {
    /// Active record without a password, as provisioned for security profile 0.
    pub fn active(charge_point_id: impl Into<String>) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            status: ChargePointStatus::Active,
            password_hash: None,
            updated_at: None,
        }
    }

    pub fn with_password_hash(mut self, hash: impl Into<String>) -> Self {
        self.password_hash = Some(hash.into());
        self
    }

    pub fn with_status(mut self, status: ChargePointStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePointStatus {
    Active,
    Revoked,
}

impl ChargePointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargePointStatus::Active => "active",
            ChargePointStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for ChargePointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChargePointStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ChargePointStatus::Active),
            "revoked" => Ok(ChargePointStatus::Revoked),
            other => Err(DomainError::InvalidChargePointStatus(other.to_string())),
        }
    }
}

/// Read access to the charge point registry
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChargePointRepository: Send + Sync {
    /// Look up a charge point by id. `Ok(None)` means the id is not provisioned.
    async fn get_charge_point(&self, charge_point_id: &str) -> DomainResult<Option<ChargePointRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_case_insensitively() {
        assert_eq!("ACTIVE".parse::<ChargePointStatus>().unwrap(), ChargePointStatus::Active);
        assert_eq!(" revoked ".parse::<ChargePointStatus>().unwrap(), ChargePointStatus::Revoked);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "suspended".parse::<ChargePointStatus>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidChargePointStatus(s) if s == "suspended"));
    }

    #[test]
    fn test_record_builders() {
        let record = ChargePointRecord::active("CP-001")
            .with_password_hash("$argon2id$v=19$...")
            .with_status(ChargePointStatus::Revoked);
        assert_eq!(record.charge_point_id, "CP-001");
        assert_eq!(record.status, ChargePointStatus::Revoked);
        assert!(record.password_hash.is_some());
    }
}

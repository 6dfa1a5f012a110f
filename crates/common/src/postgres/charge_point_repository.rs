use crate::domain::{ChargePointRecord, ChargePointRepository, ChargePointStatus, DomainError, DomainResult};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

/// Row shape of the `charge_points` registry table.
///
/// ```sql
/// CREATE TABLE charge_points (
///     charge_point_id TEXT PRIMARY KEY,
///     status          TEXT NOT NULL DEFAULT 'active',
///     password_hash   TEXT,
///     updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ChargePointRow {
    pub charge_point_id: String,
    pub status: String,
    pub password_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ChargePointRow> for ChargePointRecord {
    type Error = DomainError;

    fn try_from(row: ChargePointRow) -> Result<Self, Self::Error> {
        Ok(ChargePointRecord {
            status: row.status.parse::<ChargePointStatus>()?,
            charge_point_id: row.charge_point_id,
            password_hash: row.password_hash.filter(|h| !h.is_empty()),
            updated_at: Some(row.updated_at),
        })
    }
}

#[derive(Clone)]
pub struct PostgresChargePointRepository {
    client: PostgresClient,
}

impl PostgresChargePointRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChargePointRepository for PostgresChargePointRepository {
    #[instrument(name = "get_charge_point", skip(self))]
    async fn get_charge_point(&self, charge_point_id: &str) -> DomainResult<Option<ChargePointRecord>> {
        debug!(charge_point_id = %charge_point_id, "looking up charge point");

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT charge_point_id, status, password_hash, updated_at
                 FROM charge_points
                 WHERE charge_point_id = $1",
                &[&charge_point_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.map(|row| {
            ChargePointRow {
                charge_point_id: row.get(0),
                status: row.get(1),
                password_hash: row.get(2),
                updated_at: row.get(3),
            }
            .try_into()
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, password_hash: Option<&str>) -> ChargePointRow {
        ChargePointRow {
            charge_point_id: "CP-001".to_string(),
            status: status.to_string(),
            password_hash: password_hash.map(str::to_string),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_maps_to_record() {
        let record: ChargePointRecord = row("active", Some("$argon2id$hash")).try_into().unwrap();
        assert_eq!(record.charge_point_id, "CP-001");
        assert_eq!(record.status, ChargePointStatus::Active);
        assert_eq!(record.password_hash.as_deref(), Some("$argon2id$hash"));
        assert!(record.updated_at.is_some());
    }

    #[test]
    fn test_empty_password_hash_is_treated_as_none() {
        let record: ChargePointRecord = row("revoked", Some("")).try_into().unwrap();
        assert_eq!(record.status, ChargePointStatus::Revoked);
        assert!(record.password_hash.is_none());
    }

    #[test]
    fn test_unknown_status_fails_mapping() {
        let result: Result<ChargePointRecord, _> = row("pending", None).try_into();
        assert!(matches!(result, Err(DomainError::InvalidChargePointStatus(_))));
    }
}

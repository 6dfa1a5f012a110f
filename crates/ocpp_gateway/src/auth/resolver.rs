use crate::auth::Credential;
use crate::ocpp::OcppVersion;
use chrono::{DateTime, Utc};
use common::auth::PasswordService;
use common::domain::{ChargePointRecord, ChargePointRepository, ChargePointStatus};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Why a connecting charge point was turned away.
///
/// Every variant is final: the connection is closed and never retried by the
/// gateway. Lookup failures and timeouts deny access rather than letting an
/// unverified device in.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    #[error("unknown charge point")]
    UnknownIdentifier,
    #[error("charge point credential revoked")]
    RevokedCredential,
    #[error("credential does not match charge point")]
    CredentialMismatch,
    #[error("authorization timed out")]
    Timeout,
    #[error("charge point registry unavailable")]
    RegistryUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Admitted by registry membership alone.
    RegistryOnly,
    /// Admitted after verifying an HTTP Basic password.
    BasicAuth,
}

/// Identity of an authorized connection. Fixed for the connection's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub id: String,
    pub version: OcppVersion,
    pub auth_method: AuthMethod,
    pub authorized_at: DateTime<Utc>,
}

/// Decides whether a claimed charge point id may open a session.
pub struct AuthorizationResolver {
    repository: Arc<dyn ChargePointRepository>,
    passwords: Arc<dyn PasswordService>,
    timeout: Duration,
}

impl AuthorizationResolver {
    pub fn new(
        repository: Arc<dyn ChargePointRepository>,
        passwords: Arc<dyn PasswordService>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            passwords,
            timeout,
        }
    }

    #[instrument(
        name = "authorize",
        skip(self, credential),
        fields(charge_point_id = %claimed_id, version = %version, has_credential = credential.is_some())
    )]
    pub async fn authorize(
        &self,
        claimed_id: &str,
        version: OcppVersion,
        credential: Option<&Credential>,
    ) -> Result<DeviceIdentity, DenialReason> {
        let decision = match tokio::time::timeout(self.timeout, self.evaluate(claimed_id, credential)).await {
            Ok(decision) => decision,
            Err(_) => Err(DenialReason::Timeout),
        };

        match decision {
            Ok(auth_method) => {
                debug!(?auth_method, "charge point authorized");
                Ok(DeviceIdentity {
                    id: claimed_id.to_string(),
                    version,
                    auth_method,
                    authorized_at: Utc::now(),
                })
            }
            Err(reason) => {
                info!(reason = %reason, "charge point denied");
                Err(reason)
            }
        }
    }

    async fn evaluate(
        &self,
        claimed_id: &str,
        credential: Option<&Credential>,
    ) -> Result<AuthMethod, DenialReason> {
        let record = self
            .repository
            .get_charge_point(claimed_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "charge point lookup failed");
                DenialReason::RegistryUnavailable
            })?
            .ok_or(DenialReason::UnknownIdentifier)?;

        if record.status == ChargePointStatus::Revoked {
            return Err(DenialReason::RevokedCredential);
        }

        if let Some(credential) = credential {
            if credential.username != claimed_id {
                return Err(DenialReason::CredentialMismatch);
            }
        }

        match (record.password_hash.is_some(), credential) {
            (false, _) => Ok(AuthMethod::RegistryOnly),
            (true, None) => Err(DenialReason::CredentialMismatch),
            (true, Some(credential)) => self.verify_password(record, credential).await,
        }
    }

    async fn verify_password(
        &self,
        record: ChargePointRecord,
        credential: &Credential,
    ) -> Result<AuthMethod, DenialReason> {
        let Some(hash) = record.password_hash else {
            return Err(DenialReason::CredentialMismatch);
        };
        let passwords = Arc::clone(&self.passwords);
        let password = credential.password.clone();

        // Argon2 is deliberately slow; keep it off the async workers.
        let verified = tokio::task::spawn_blocking(move || passwords.verify_password(&password, &hash))
            .await
            .map_err(|e| {
                warn!(error = %e, "password verification task failed");
                DenialReason::CredentialMismatch
            })?;

        match verified {
            Ok(true) => Ok(AuthMethod::BasicAuth),
            Ok(false) => Err(DenialReason::CredentialMismatch),
            Err(e) => {
                warn!(error = %e, charge_point_id = %record.charge_point_id, "stored password hash is unusable");
                Err(DenialReason::CredentialMismatch)
            }
        }
    }
}

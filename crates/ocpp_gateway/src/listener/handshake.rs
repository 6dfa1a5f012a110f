use crate::auth::{Credential, CredentialError};
use crate::mqtt::{TopicError, validate_device_id};
use crate::ocpp::OcppVersion;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{StatusCode, header};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("invalid charge point identifier in path: {0}")]
    InvalidDeviceId(#[from] TopicError),

    #[error("no Sec-WebSocket-Protocol offered")]
    MissingSubprotocol,

    #[error("none of the offered subprotocols is enabled: {0}")]
    UnsupportedSubprotocol(String),

    #[error("invalid Authorization header: {0}")]
    InvalidCredential(#[from] CredentialError),
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// HTTP response that refuses the upgrade.
    pub fn to_response(&self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// What an accepted upgrade request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub device_id: String,
    pub version: OcppVersion,
    pub credential: Option<Credential>,
}

/// Checks an upgrade request before any session exists.
pub fn negotiate(
    request: &Request,
    enabled: &[OcppVersion],
) -> Result<HandshakeOutcome, HandshakeError> {
    let offered: Vec<&str> = request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let version = select_subprotocol(&offered, enabled)?;

    let device_id = device_id_from_path(request.uri().path())?;

    let credential = match request.headers().get(header::AUTHORIZATION) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| HandshakeError::InvalidCredential(CredentialError::InvalidEncoding))?;
            Some(Credential::from_authorization_header(value)?)
        }
        None => None,
    };

    Ok(HandshakeOutcome {
        device_id,
        version,
        credential,
    })
}

/// Picks the first offered subprotocol that is enabled.
///
/// Each header value may carry a comma-separated list; unknown identifiers
/// are skipped.
pub fn select_subprotocol(
    offered: &[&str],
    enabled: &[OcppVersion],
) -> Result<OcppVersion, HandshakeError> {
    let candidates: Vec<&str> = offered
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .collect();
    if candidates.is_empty() {
        return Err(HandshakeError::MissingSubprotocol);
    }

    candidates
        .iter()
        .filter_map(|candidate| OcppVersion::from_subprotocol(candidate).ok())
        .find(|version| enabled.contains(version))
        .ok_or_else(|| HandshakeError::UnsupportedSubprotocol(candidates.join(",")))
}

/// The charge point id is the last non-empty path segment.
pub fn device_id_from_path(path: &str) -> Result<String, TopicError> {
    let id = path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or_default();
    validate_device_id(id)?;
    Ok(id.to_string())
}

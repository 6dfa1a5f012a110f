use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// OCPP-J protocol revisions the gateway can terminate.
///
/// Each revision is negotiated as its own WebSocket subprotocol and is fixed
/// for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcppVersion {
    V16,
    V20,
    V201,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported OCPP subprotocol: {0}")]
pub struct UnknownSubprotocol(pub String);

/// Error codes valid in every revision.
const COMMON_ERROR_CODES: &[&str] = &[
    "NotImplemented",
    "NotSupported",
    "InternalError",
    "ProtocolError",
    "SecurityError",
    "PropertyConstraintViolation",
    "TypeConstraintViolation",
    "GenericError",
];

// 1.6 spells these differently from 2.x, including the historical typo.
const V16_ERROR_CODES: &[&str] = &["FormationViolation", "OccurenceConstraintViolation"];

const V2X_ERROR_CODES: &[&str] = &[
    "FormatViolation",
    "OccurrenceConstraintViolation",
    "MessageTypeNotSupported",
    "RpcFrameworkError",
];

impl OcppVersion {
    pub const ALL: [OcppVersion; 3] = [OcppVersion::V16, OcppVersion::V20, OcppVersion::V201];

    /// WebSocket subprotocol identifier.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            OcppVersion::V16 => "ocpp1.6",
            OcppVersion::V20 => "ocpp2.0",
            OcppVersion::V201 => "ocpp2.0.1",
        }
    }

    pub fn from_subprotocol(value: &str) -> Result<Self, UnknownSubprotocol> {
        match value.trim() {
            "ocpp1.6" => Ok(OcppVersion::V16),
            "ocpp2.0" => Ok(OcppVersion::V20),
            "ocpp2.0.1" => Ok(OcppVersion::V201),
            other => Err(UnknownSubprotocol(other.to_string())),
        }
    }

    /// Whether `code` is a CALLERROR error code defined by this revision.
    pub fn is_valid_error_code(&self, code: &str) -> bool {
        if COMMON_ERROR_CODES.contains(&code) {
            return true;
        }
        match self {
            OcppVersion::V16 => V16_ERROR_CODES.contains(&code),
            OcppVersion::V20 | OcppVersion::V201 => V2X_ERROR_CODES.contains(&code),
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

impl FromStr for OcppVersion {
    type Err = UnknownSubprotocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_subprotocol(s)
    }
}

/// Parses a comma-separated list of subprotocol identifiers, preserving order
/// and dropping duplicates.
pub fn parse_version_list(value: &str) -> Result<Vec<OcppVersion>, UnknownSubprotocol> {
    let mut versions = Vec::new();
    for part in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let version = OcppVersion::from_subprotocol(part)?;
        if !versions.contains(&version) {
            versions.push(version);
        }
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprotocol_identifiers() {
        for version in OcppVersion::ALL {
            assert_eq!(OcppVersion::from_subprotocol(version.subprotocol()), Ok(version));
        }
        assert!(OcppVersion::from_subprotocol("ocpp1.5").is_err());
        assert!(OcppVersion::from_subprotocol("OCPP1.6").is_err());
    }

    #[test]
    fn test_error_code_vocabulary_differs_per_version() {
        assert!(OcppVersion::V16.is_valid_error_code("FormationViolation"));
        assert!(OcppVersion::V16.is_valid_error_code("OccurenceConstraintViolation"));
        assert!(!OcppVersion::V16.is_valid_error_code("FormatViolation"));
        assert!(!OcppVersion::V16.is_valid_error_code("RpcFrameworkError"));

        assert!(OcppVersion::V201.is_valid_error_code("FormatViolation"));
        assert!(OcppVersion::V201.is_valid_error_code("MessageTypeNotSupported"));
        assert!(!OcppVersion::V201.is_valid_error_code("FormationViolation"));
        assert!(!OcppVersion::V20.is_valid_error_code("OccurenceConstraintViolation"));

        for version in OcppVersion::ALL {
            assert!(version.is_valid_error_code("GenericError"));
            assert!(!version.is_valid_error_code("MadeUpError"));
        }
    }

    #[test]
    fn test_parse_version_list() {
        let versions = parse_version_list("ocpp2.0.1, ocpp1.6,ocpp1.6").unwrap();
        assert_eq!(versions, vec![OcppVersion::V201, OcppVersion::V16]);
        assert!(parse_version_list("").unwrap().is_empty());
        assert_eq!(
            parse_version_list("ocpp1.6,ocpp3"),
            Err(UnknownSubprotocol("ocpp3".to_string()))
        );
    }
}

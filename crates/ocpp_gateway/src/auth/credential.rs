use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("unsupported authorization scheme")]
    UnsupportedScheme,
    #[error("invalid basic credential encoding")]
    InvalidEncoding,
}

/// HTTP Basic credential presented on the WebSocket upgrade.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parses an `Authorization: Basic <base64(user:pass)>` header value.
    pub fn from_authorization_header(value: &str) -> Result<Self, CredentialError> {
        let (scheme, encoded) = value
            .trim()
            .split_once(' ')
            .ok_or(CredentialError::UnsupportedScheme)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(CredentialError::UnsupportedScheme);
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CredentialError::InvalidEncoding)?;
        let decoded = String::from_utf8(decoded).map_err(|_| CredentialError::InvalidEncoding)?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(CredentialError::InvalidEncoding)?;

        Ok(Self::new(username, password))
    }

    /// Header value for this credential, as sent by clients.
    pub fn to_authorization_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

// Never print the password.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid charge point status: {0}")]
    InvalidChargePointStatus(String),

    #[error("Invalid password: {0}")]
    InvalidPassword(String),

    #[error("Password hashing error: {0}")]
    PasswordHashingError(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

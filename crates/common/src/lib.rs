pub mod auth;
pub mod domain;
pub mod postgres;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use auth::MockPasswordService;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockChargePointRepository;

//! Semantic error kinds surfaced by the core service layer.
//!
//! Every public operation on [`crate::service::OtaService`] and its
//! components returns `Result<T, OtaError>` so that callers (including the
//! HTTP adapter) can match on the kind of failure instead of parsing error
//! strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("firmware not eligible for rollout: {0}")]
    FirmwareNotEligible(String),

    #[error("device not eligible for update: {0}")]
    DeviceNotEligible(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(String),

    #[error("firmware file missing: {0}")]
    FirmwareFileMissing(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("retry exhausted: {0}")]
    RetryExhausted(String),

    #[error("batch concurrency limit reached: {0}")]
    ConcurrencyLimitReached(String),

    #[error("store error: {0}")]
    StoreError(String),
}

pub type Result<T> = std::result::Result<T, OtaError>;
